use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or out-of-range request parameters. Rejected before any session exists.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Avatar image missing or undecodable. Always recovered locally by the session manager.
    #[error("Asset unavailable: {0}")]
    AssetUnavailable(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session {0} already has an attached transport")]
    DoubleAttach(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that end a stream the same way a client disconnect does.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::TransportFailure(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
