//! Error kinds for the replication engine.
//!
//! Fatal-init errors are the only ones that bubble out of the process entry
//! point; recoverable-network and protocol-framing errors are caught and
//! absorbed by the replicator loop (see `replicator.rs`).

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("fatal init error: {0}")]
    FatalInit(String),

    #[error("network error: {0}")]
    Network(#[source] io::Error),

    #[error("protocol framing error: {0}")]
    Framing(String),

    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
