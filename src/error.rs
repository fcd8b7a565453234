//! Caller-observable error kinds (§7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LdmError {
    /// A decoder invariant was violated (e.g. a var-int length byte exceeds
    /// the target width). Indicates a bug in this crate, not corrupt input.
    #[error("internal decoder error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device is readable but carries no LDM signature.
    #[error("not an LDM disk: {0}")]
    NotLdm(String),

    /// Structural corruption: bad magic, out-of-range offsets, count
    /// mismatches, orphan records, incomplete spanned records.
    #[error("invalid LDM metadata: {0}")]
    Invalid(String),

    /// A newly added disk's committed sequence disagrees with its group.
    #[error("inconsistent disk group: {0}")]
    Inconsistent(String),

    /// Unknown VBLK revision, or a volume/component shape this crate does
    /// not implement.
    #[error("unsupported LDM structure: {0}")]
    NotSupported(String),

    /// A disk required to materialise a volume is absent and cannot be
    /// substituted for.
    #[error("missing disk: {0}")]
    MissingDisk(String),
}

pub type Result<T> = std::result::Result<T, LdmError>;
