//! Error types for the bus.
//!
//! Dispatch failures carry the exact messages that travel on the wire in
//! [`Response::error`](crate::protocol::Response); peers match on those
//! strings, so the display forms here are part of the protocol.

use thiserror::Error;

/// Main error type for all bus operations.
#[derive(Debug, Error)]
pub enum ZbusError {
    /// Broker command or connection failure.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Protocol-level failure reported by the remote end.
    #[error("{0}")]
    Protocol(String),

    /// The requested method is not registered on the object.
    #[error("not a function")]
    NotAFunction,

    /// The requested object is not registered on the server.
    #[error("unknown object")]
    UnknownObject,

    /// Wrong number of call arguments. For variadic methods `expected`
    /// counts only the fixed parameters.
    #[error("invalid number of arguments expecting {expected} got {got}")]
    ArgumentCount { expected: usize, got: usize },

    /// An argument did not decode into the declared parameter type.
    #[error("invalid argument type [{index}] expecting {expected}")]
    ArgumentType {
        index: usize,
        expected: &'static str,
    },

    /// Tuple access past the last element.
    #[error("index out of range")]
    IndexOutOfRange,

    /// Attempt to register the built-in status object id.
    #[error("object id is reserved")]
    ReservedObjectId,

    /// Attempt to register the same object id twice.
    #[error("object already exists")]
    ObjectExists,

    /// `run` was called on a server that is already running, or
    /// `register` after `run`.
    #[error("server is already running")]
    AlreadyRunning,

    /// Worker pools need at least one worker.
    #[error("invalid number of workers")]
    InvalidWorkerCount,

    /// Broker address did not parse as a URL.
    #[error("invalid address: {0}")]
    Address(#[from] url::ParseError),

    /// Broker address URL has an unsupported scheme.
    #[error("unknown scheme '{0}' expecting tcp or unix")]
    InvalidScheme(String),

    /// The caller's context was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,
}

/// Result type alias using ZbusError.
pub type Result<T> = std::result::Result<T, ZbusError>;
