//! Minimal deb822 control-file reader.
//!
//! `Release` and `Packages` files are sequences of paragraphs separated by
//! blank lines. Each paragraph is a list of `Field: value` lines; a line that
//! starts with a space or tab continues the previous field. Field names are
//! case-insensitive. Only as much of the format as the sync pipeline needs is
//! handled here: no PGP armor, no substitution variables.

use thiserror::Error;

/// Errors raised while reading control paragraphs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// A non-continuation line had no `:` separator.
    #[error("line {line}: expected 'Field: value', got '{content}'")]
    MissingColon {
        /// 1-based line number.
        line: usize,
        /// The offending line.
        content: String,
    },

    /// A continuation line appeared before any field.
    #[error("line {line}: continuation line without a preceding field")]
    OrphanContinuation {
        /// 1-based line number.
        line: usize,
    },

    /// A field name was empty.
    #[error("line {line}: empty field name")]
    EmptyFieldName {
        /// 1-based line number.
        line: usize,
    },
}

/// One field of a paragraph. Multi-line values keep their line structure:
/// the first line is whatever followed the colon, later lines are the
/// continuation lines with their leading whitespace stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlField {
    name: String,
    lines: Vec<String>,
}

impl ControlField {
    /// Field name as written in the file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value of a single-line field, trimmed.
    pub fn value(&self) -> &str {
        self.lines.first().map_or("", |l| l.trim())
    }

    /// Non-empty value lines, including the first line when it is not blank.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty())
    }

    /// Whitespace-separated words across all lines.
    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().flat_map(|l| l.split_ascii_whitespace())
    }
}

/// A single deb822 paragraph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlParagraph {
    fields: Vec<ControlField>,
    /// 1-based line on which the paragraph starts, for diagnostics.
    start_line: usize,
}

impl ControlParagraph {
    /// Look a field up by case-insensitive name.
    pub fn field(&self, name: &str) -> Option<&ControlField> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Trimmed single-line value of a field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).map(ControlField::value)
    }

    /// Words of a field, e.g. `Components: main contrib`.
    pub fn field_words(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(ControlField::words)
    }

    /// Value lines of a multi-line field, e.g. a checksum table.
    pub fn field_lines(&self, name: &str) -> Option<impl Iterator<Item = &str>> {
        self.field(name).map(ControlField::lines)
    }

    /// All fields in file order.
    pub fn fields(&self) -> &[ControlField] {
        &self.fields
    }

    /// Line the paragraph starts on.
    pub fn start_line(&self) -> usize {
        self.start_line
    }

    /// True if the paragraph has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Split a control document into paragraphs.
///
/// Blank lines (including whitespace-only lines) separate paragraphs; runs of
/// blank lines never produce empty paragraphs. Lines starting with `#` are
/// comments.
///
/// # Errors
///
/// Returns a [`ControlError`] naming the first malformed line.
pub fn parse_paragraphs(input: &str) -> Result<Vec<ControlParagraph>, ControlError> {
    let mut paragraphs = Vec::new();
    let mut current = ControlParagraph::default();

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.strip_suffix('\r').unwrap_or(raw);

        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            let Some(field) = current.fields.last_mut() else {
                return Err(ControlError::OrphanContinuation { line: line_no });
            };
            // A lone "." stands for an empty line inside a long description.
            let content = line.trim_start();
            field.lines.push(if content == "." {
                String::new()
            } else {
                content.to_string()
            });
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(ControlError::MissingColon {
                line: line_no,
                content: line.to_string(),
            });
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(ControlError::EmptyFieldName { line: line_no });
        }

        if current.is_empty() {
            current.start_line = line_no;
        }
        current.fields.push(ControlField {
            name: name.to_string(),
            lines: vec![value.trim().to_string()],
        });
    }

    if !current.is_empty() {
        paragraphs.push(current);
    }

    Ok(paragraphs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_paragraphs() {
        let input = "Package: hello\nVersion: 1.0\n\n\nPackage: world\nVersion: 2.0\n";
        let paragraphs = parse_paragraphs(input).unwrap();
        assert_eq!(paragraphs.len(), 2);
        assert_eq!(paragraphs[0].field_str("Package"), Some("hello"));
        assert_eq!(paragraphs[1].field_str("version"), Some("2.0"));
        assert_eq!(paragraphs[1].start_line(), 5);
    }

    #[test]
    fn continuation_lines_extend_previous_field() {
        let input = "SHA256:\n aaaa 10 main/binary-amd64/Packages\n bbbb 20 main/binary-amd64/Packages.gz\nCodename: bookworm\n";
        let paragraphs = parse_paragraphs(input).unwrap();
        let lines: Vec<_> = paragraphs[0].field_lines("sha256").unwrap().collect();
        assert_eq!(
            lines,
            vec![
                "aaaa 10 main/binary-amd64/Packages",
                "bbbb 20 main/binary-amd64/Packages.gz"
            ]
        );
        assert_eq!(paragraphs[0].field_str("Codename"), Some("bookworm"));
    }

    #[test]
    fn words_split_on_whitespace() {
        let p = parse_paragraphs("Components: main contrib  non-free\n").unwrap();
        let words: Vec<_> = p[0].field_words("Components").unwrap().collect();
        assert_eq!(words, vec!["main", "contrib", "non-free"]);
    }

    #[test]
    fn comments_and_crlf_are_tolerated() {
        let p = parse_paragraphs("# generated\r\nSuite: stable\r\n").unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].field_str("Suite"), Some("stable"));
    }

    #[test]
    fn value_may_contain_colons() {
        let p = parse_paragraphs("Homepage: https://example.org/x\n").unwrap();
        assert_eq!(p[0].field_str("Homepage"), Some("https://example.org/x"));
    }

    #[test]
    fn rejects_line_without_colon() {
        let err = parse_paragraphs("Package: a\nbroken line\n").unwrap_err();
        assert!(matches!(err, ControlError::MissingColon { line: 2, .. }));
    }

    #[test]
    fn rejects_leading_continuation() {
        let err = parse_paragraphs(" dangling\n").unwrap_err();
        assert_eq!(err, ControlError::OrphanContinuation { line: 1 });
    }
}
