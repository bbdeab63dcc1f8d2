//! Error types for archive operations

use std::io;

/// Specialized result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by archive operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The named file does not exist in the archive
    #[error("file not found: {0}")]
    NotFound(String),

    /// A file with the same name and locale already exists
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// The handle is closed, of the wrong kind, or outlived a table rebuild
    #[error("invalid handle")]
    InvalidHandle,

    /// The data does not describe a well-formed archive
    #[error("malformed archive: {0}")]
    BadFormat(String),

    /// The operation is not permitted on this archive or handle
    #[error("access denied")]
    AccessDenied,

    /// A capacity limit was exceeded
    #[error("not enough memory")]
    NotEnoughMemory,

    /// The underlying storage ran out of space
    #[error("disk full")]
    DiskFull,

    /// The bytes written to a file did not match its declared size
    #[error("size mismatch: declared {declared} bytes, wrote {written}")]
    SizeMismatch {
        /// Size announced when the file was created
        declared: u64,
        /// Bytes actually written before the file was finished
        written: u64,
    },

    /// A seek resolved to a position before the start of the file
    #[error("seek before start of file")]
    NegativeSeek,

    /// A sector failed to compress or decompress
    #[error("compression error: {0}")]
    Compression(String),

    /// Stored data is internally inconsistent
    #[error("corrupted archive: {0}")]
    Corrupt(String),

    /// An I/O error from the underlying storage
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl Error {
    /// Creates a [`Error::BadFormat`] with the given message
    pub fn bad_format(msg: impl Into<String>) -> Self {
        Error::BadFormat(msg.into())
    }

    /// Creates a [`Error::Corrupt`] with the given message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    /// Creates a [`Error::Compression`] with the given message
    pub fn compression(msg: impl Into<String>) -> Self {
        Error::Compression(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // Storage exhaustion and permission failures have their own
        // variants so callers can match on them without digging into
        // the io::ErrorKind.
        match err.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::WriteZero => Error::DiskFull,
            io::ErrorKind::PermissionDenied => Error::AccessDenied,
            _ => Error::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_storage_full_maps_to_disk_full() {
        let err: Error = io::Error::new(io::ErrorKind::StorageFull, "full").into();
        assert!(matches!(err, Error::DiskFull));
    }

    #[test]
    fn io_permission_denied_maps_to_access_denied() {
        let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, Error::AccessDenied));
    }

    #[test]
    fn other_io_errors_stay_io() {
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn display_includes_file_name() {
        let err = Error::NotFound("war3map.j".to_string());
        assert_eq!(err.to_string(), "file not found: war3map.j");
    }
}
