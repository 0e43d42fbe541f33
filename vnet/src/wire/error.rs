use core::fmt;

/// The error type for the wire codecs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The buffer is too short to contain the claimed structure.
    Truncated,

    /// A field combination makes the packet nonsensical.
    Malformed,

    /// The checksum field does not verify.
    BadChecksum,

    /// A field value identifies a standard this stack does not speak.
    Unsupported,
}

/// The result type for the wire codecs.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Error::Truncated => "truncated packet",
            Error::Malformed => "malformed packet",
            Error::BadChecksum => "checksum mismatch",
            Error::Unsupported => "unsupported format",
        })
    }
}

impl std::error::Error for Error {}
