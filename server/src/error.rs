//! Error types for the server crate

use shared::{CodecError, NetchanError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("channel error: {0}")]
    Netchan(#[from] NetchanError),

    #[error("persistence error: {0}")]
    Persist(#[from] bincode::Error),

    #[error("could not resolve {0}")]
    Resolve(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// A session's reliable command ring wrapped around unacknowledged commands
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("server command overflow")]
pub struct CommandOverflow;

/// Failure to resolve an operator-supplied player handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("Bad client slot: {0}")]
    BadSlot(usize),

    #[error("Client {0} is not active")]
    NotConnected(usize),

    #[error("No player matches {0}")]
    NotFound(String),

    #[error("Multiple players match: {}", .0.join(", "))]
    Ambiguous(Vec<String>),
}
