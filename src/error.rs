use std::fmt::Display;
use std::io;

/// emberdb errors.
#[derive(Debug)]
pub enum Error {
    /// Malformed on-disk data: bad footer magic, checksum mismatch, or a
    /// truncated section. Fatal for the affected file.
    Corruption(String),
    /// Failed to decode a framed field; names the field being read.
    Decode(&'static str, io::Error),
    /// Invalid data or an operation that violates a structural contract.
    InvalidData(String),
    /// An I/O error from the filesystem.
    Io(io::Error),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::Decode(field, err) => write!(f, "failed to decode {field}: {err}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
