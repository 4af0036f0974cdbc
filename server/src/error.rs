//! Error types for the zone server.

use crate::world::EntityId;
use shared::ProtocolError;

/// Failures of the entity world's checked accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("entity {0} does not exist")]
    NotFound(EntityId),

    #[error("entity {0} refers to a slot that has since been reused")]
    Stale(EntityId),

    #[error("entity world is at capacity")]
    Capacity,

    #[error("global id already bound to entity {0}")]
    DuplicateGlobal(EntityId),
}

/// Why the lag compensator could not reconstruct a past instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RewindError {
    #[error("rewind target {target}ms predates the oldest retained frame {oldest}ms")]
    BeforeWindow { target: u64, oldest: u64 },

    #[error("no history has been recorded yet")]
    EmptyHistory,

    #[error("requested rewind of {requested}ms exceeds the {limit}ms limit")]
    ExceedsMaxRewind { requested: u64, limit: u64 },
}

/// Why a new connection was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectRefused {
    #[error("address is temporarily blocked")]
    Blocked,

    #[error("too many connections from this address")]
    TooManyFromAddress,

    #[error("server full")]
    Full,
}

/// External store failures. None of these are fatal to the tick loop.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Top level error for the server binary.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Config(err.to_string())
    }
}
