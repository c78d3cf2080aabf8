use std::{fmt, io, sync::Arc};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` is the error type shared by the page store, the tree, the codec
/// and the blob log.
#[derive(Clone, Debug)]
pub enum Error {
    Io(Arc<io::Error>), // An I/O error occurred
    InvalidOffset(u64), // Page offset outside the allocated range or misaligned
    Serialization(String),
    Deserialization(String),
    Corruption(String), // Structural invariant broken on disk
    Codec(String),
    BlobOutOfRange { offset: u64, size: u64 },
    InvalidArgument(String),
    DimensionMismatch { name: String }, // Stored versions of one image differ in size
}

// Implementation of Display trait for Error
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {err}"),
            Error::InvalidOffset(offset) => write!(f, "Invalid page offset {offset}"),
            Error::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            Error::Deserialization(msg) => write!(f, "Deserialization error: {msg}"),
            Error::Corruption(msg) => write!(f, "Corruption detected: {msg}"),
            Error::Codec(msg) => write!(f, "Codec error: {msg}"),
            Error::BlobOutOfRange { offset, size } => {
                write!(f, "Blob range {offset}+{size} is outside the data file")
            }
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            Error::DimensionMismatch { name } => {
                write!(f, "Versions of image {name} have different dimensions")
            }
        }
    }
}

// Implementation of Error trait for Error
impl std::error::Error for Error {}

// Implementation to convert io::Error into Error
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_kind() {
        let err: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "short read").into();
        match &err {
            Error::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.to_string(), "IO error: short read");
    }

    #[test]
    fn blob_range_message() {
        let err = Error::BlobOutOfRange {
            offset: 10,
            size: 4,
        };
        assert_eq!(err.to_string(), "Blob range 10+4 is outside the data file");
    }
}
