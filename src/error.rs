use thiserror::Error;

/// Errors surfaced by the ard1541 library.
///
/// Every failure carries a human readable message; the variant tells the
/// caller which part of the stack failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Anything that breaks the host<->transceiver link: tty I/O, a bad or
    /// unsupported connection banner, broken framing, or the background
    /// reader exiting while a request was outstanding.
    #[error("connection failure: {message}")]
    Connection { message: String },

    /// The transceiver reported a bus-level failure.  The message is the
    /// status text received from it, verbatim.
    #[error("IEC bus failure: {message}")]
    Iec { message: String },

    /// Caller misuse, such as an oversized open payload or an out of range
    /// device number.
    #[error("invalid argument: {message}")]
    Args { message: String },

    /// Reserved for callers that treat end-of-transfer (EOI) as terminal.
    #[error("end of file")]
    EndOfFile,

    /// The drive's DOS reported an error on the command channel.
    #[error("drive error {code}: {message} ({track},{sector})")]
    Drive {
        code: u8,
        message: String,
        track: u8,
        sector: u8,
    },

    /// A disk image could not be opened, read or written.
    #[error("image error: {message}")]
    Image { message: String },
}

impl Error {
    /// Shorthand for an [`Error::Connection`] wrapping a lower level error.
    pub(crate) fn connection<E: std::fmt::Display>(context: &str, error: E) -> Self {
        Error::Connection {
            message: format!("{context}: {error}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
