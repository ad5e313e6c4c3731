//! Error taxonomy for the JoyRPC runtime core (spec §7).
//!
//! Every variant carries a stable [`ErrorCode`] so callers can match on
//! error *kind* across library versions without string-matching messages.
//! Messages are expected to already be redacted by the caller (no secrets,
//! no raw credentials) before being wrapped here.

use std::fmt;
use thiserror::Error;

/// Stable, matchable error code. Numeric so it can cross a wire boundary
/// inside a `Response` without pulling the whole error type with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Config = 1,
    Init = 2,
    Transport = 3,
    Serialization = 4,
    Timeout = 5,
    Overload = 6,
    NoAvailableNode = 7,
    Remote = 8,
    Shutdown = 9,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Config => "CONFIG",
            ErrorCode::Init => "INIT",
            ErrorCode::Transport => "TRANSPORT",
            ErrorCode::Serialization => "SERIALIZATION",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Overload => "OVERLOAD",
            ErrorCode::NoAvailableNode => "NO_AVAILABLE_NODE",
            ErrorCode::Remote => "REMOTE",
            ErrorCode::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// The runtime's error type. Variants correspond 1:1 to spec §7's taxonomy.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("config error: {0}")]
    Config(String),

    #[error("init error: {0}")]
    Init(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("transport dead")]
    TransportDead,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("send queue full")]
    SendFull,

    #[error("payload of {size} bytes exceeds cap of {cap} bytes")]
    OverPayload { size: usize, cap: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("overload: {0}")]
    Overload(String),

    #[error("no available node for {interface}/{alias}")]
    NoAvailableNode { interface: String, alias: String },

    #[error("remote exception: {0}")]
    Remote(String),

    #[error("no such alias: {0}")]
    NoSuchAlias(String),

    #[error("no such method: {interface}.{method}")]
    NoSuchMethod { interface: String, method: String },

    #[error("invoker closed")]
    InvokerClosed,

    #[error("shutting down")]
    ShuttingDown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::Config(_) => ErrorCode::Config,
            RpcError::Init(_) => ErrorCode::Init,
            RpcError::TransportClosed
            | RpcError::TransportDead
            | RpcError::Transport(_)
            | RpcError::SendFull
            | RpcError::Io(_) => ErrorCode::Transport,
            RpcError::OverPayload { .. } => ErrorCode::Overload,
            RpcError::Serialization(_) => ErrorCode::Serialization,
            RpcError::Timeout(_) => ErrorCode::Timeout,
            RpcError::Overload(_) => ErrorCode::Overload,
            RpcError::NoAvailableNode { .. } => ErrorCode::NoAvailableNode,
            RpcError::Remote(_) => ErrorCode::Remote,
            RpcError::NoSuchAlias(_) | RpcError::NoSuchMethod { .. } => ErrorCode::Remote,
            RpcError::InvokerClosed | RpcError::ShuttingDown => ErrorCode::Shutdown,
        }
    }

    /// Retriable per spec §4.6: transport-level errors and explicit
    /// server-side "retry" signals (the latter surfaces as `Remote` with
    /// the retry flag already consumed by the Route layer, so only
    /// transport-level variants are retriable here).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RpcError::TransportClosed
                | RpcError::TransportDead
                | RpcError::Transport(_)
                | RpcError::SendFull
                | RpcError::NoAvailableNode { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
