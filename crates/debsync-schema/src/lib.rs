//! Shared data model for debsync.
//!
//! Nothing in this crate performs I/O. It holds the checksum newtypes, the
//! deb822 paragraph reader used for `Release` and `Packages` files, and the
//! typed records the sync pipeline passes between its stages.

pub mod control;
pub mod hash;
pub mod types;

// Re-exports
pub use control::{ControlError, ControlParagraph};
pub use hash::*;
pub use types::*;

/// File name of the release document inside `dists/<release>/`.
pub const RELEASE_FILE: &str = "Release";

/// File name of the detached release signature inside `dists/<release>/`.
pub const RELEASE_SIGNATURE_FILE: &str = "Release.gpg";
