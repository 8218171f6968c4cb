use core::fmt;

/// The error type for parsing of segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An incoming packet could not be parsed because it was shorter than assumed.
    ///
    /// The packet may be shorter than the minimum length specified, or the header length field
    /// points past the end of the received data.
    Truncated,

    /// An incoming packet was recognized but was self-contradictory.
    ///
    /// Examples: a TCP header length below the minimum; an option whose length field does not
    /// match its kind; a zero port.
    Malformed,

    /// An incoming packet had an incorrect checksum and was dropped.
    Checksum,
}

/// The result type for segment parsing.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated packet"),
            Error::Malformed => write!(f, "malformed packet"),
            Error::Checksum  => write!(f, "checksum error"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
