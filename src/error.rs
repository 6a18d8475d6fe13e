use std::io;

/// The error taxonomy of the engine.
///
/// Every variant is produced either by a transport read/write, by the
/// wrapped `h2` codec, by a request body source, by cancellation, or by an
/// internal invariant violation that is otherwise only logged.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport read or write half failed, or would have blocked when
    /// the caller asked for a blocking operation.
    #[error("transport I/O error: {0}")]
    Transport(#[source] io::Error),

    /// A GOAWAY, RST_STREAM, or other codec-reported failure on a stream.
    #[error("HTTP/2 protocol error: {0}")]
    Protocol(#[source] h2::Error),

    /// The upper-layer request-body producer failed.
    #[error("request body source failed: {0}")]
    Body(#[source] io::Error),

    /// A per-item cancellation token was triggered.
    #[error("message was cancelled")]
    Cancelled,

    /// An impossible state transition or monotonicity violation. These are
    /// normally only logged (see `Message::advance`); this variant exists so
    /// that internal-error paths that *do* need to surface something still
    /// have a typed value to return.
    #[error("internal engine error: {0}")]
    Internal(&'static str),
}

impl Error {
    pub(crate) fn would_block() -> Error {
        Error::Transport(io::Error::new(io::ErrorKind::WouldBlock, "would block"))
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Transport(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<h2::Error> for Error {
    fn from(e: h2::Error) -> Self {
        Error::Protocol(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
