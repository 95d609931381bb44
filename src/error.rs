//! Error types for the NTFS index core.
//!
//! One variant per failure kind the core can surface; propagation policy lives
//! with each call site, not here (see the module docs on `Index::matches` and
//! `volume::VolumeDescriptor::open`).

use thiserror::Error;

/// Main error type for index construction, I/O, and query operations.
#[derive(Error, Debug)]
pub enum NtfsIndexError {
    #[error("volume '{0}' is not recognised as NTFS")]
    VolumeUnrecognised(String),

    #[error("volume '{0}' could not be opened: {1}")]
    VolumeInaccessible(String, std::io::Error),

    #[error("overlapped read failed with status {0:#x}")]
    IoFailed(u32),

    #[error("record {0} is corrupt and was skipped")]
    Corrupt(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("out of memory growing index arena")]
    OutOfMemory,

    #[error("invalid attribute at offset {0}: {1}")]
    InvalidAttribute(u32, String),

    #[error("data run decode error: {0}")]
    DataRunError(String),

    #[error("windows API error: {0}")]
    WindowsError(String),

    #[error("record {0} references non-existent parent {1}")]
    OrphanedRecord(u64, u64),
}

/// Result type alias used throughout the core.
pub type Result<T> = std::result::Result<T, NtfsIndexError>;

impl NtfsIndexError {
    /// Build a `WindowsError` from a raw Win32 status/error code.
    pub fn from_win32(code: u32, context: &str) -> Self {
        NtfsIndexError::WindowsError(format!("{context}: Win32 error code {code}"))
    }

    /// Whether a multi-volume driver should continue scanning remaining
    /// volumes after seeing this error on one volume.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NtfsIndexError::Corrupt(_)
                | NtfsIndexError::InvalidAttribute(_, _)
                | NtfsIndexError::OrphanedRecord(_, _)
                | NtfsIndexError::VolumeInaccessible(_, _)
                | NtfsIndexError::VolumeUnrecognised(_)
        )
    }
}
