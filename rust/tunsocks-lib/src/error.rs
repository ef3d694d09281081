use std::io;
use thiserror::Error;
use tunsocks_stack::StackError;

/// Numeric status codes handed across the host boundary
pub mod codes {
    pub const OK: i32 = 0;
    pub const INVALID_CONFIG: i32 = -1;
    pub const INIT_FAILED: i32 = -2;
    pub const NETWORK_UNAVAILABLE: i32 = -3;
    pub const INVALID_TUN_FD: i32 = -4;
    pub const ALREADY_RUNNING: i32 = -5;
    pub const UNKNOWN: i32 = -999;
}

/// Lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Engine initialization failed: {0}")]
    InitFailed(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Invalid TUN fd: {0}")]
    InvalidTunFd(String),

    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    pub fn code(&self) -> i32 {
        match self {
            EngineError::InvalidConfig(_) => codes::INVALID_CONFIG,
            EngineError::InitFailed(_) => codes::INIT_FAILED,
            EngineError::NetworkUnavailable(_) => codes::NETWORK_UNAVAILABLE,
            EngineError::InvalidTunFd(_) => codes::INVALID_TUN_FD,
            EngineError::AlreadyRunning => codes::ALREADY_RUNNING,
            EngineError::Unknown(_) => codes::UNKNOWN,
        }
    }
}

impl From<StackError> for EngineError {
    fn from(err: StackError) -> Self {
        match err {
            StackError::InvalidConfig(msg) => EngineError::InvalidConfig(msg),
            StackError::Tun(msg) => EngineError::InvalidTunFd(msg),
            StackError::Io(e) => EngineError::from(e),
            e @ (StackError::ProxyUnreachable { .. } | StackError::ConnectTimeout(_)) => {
                EngineError::NetworkUnavailable(e.to_string())
            }
            other => EngineError::Unknown(other.to_string()),
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => EngineError::InvalidTunFd(err.to_string()),
            _ => EngineError::InitFailed(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
