//! Error types for the tunsocks stack

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for stack operations
pub type Result<T> = std::result::Result<T, StackError>;

/// Main error type for the stack
#[derive(Error, Debug)]
pub enum StackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Bad {0} checksum")]
    BadChecksum(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Flow table full: {0}")]
    FlowTableFull(usize),

    #[error("Proxy unreachable at {addr}: {source}")]
    ProxyUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Proxy handshake timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("Proxy protocol error: {0}")]
    ProxyProtocol(String),

    #[error("Proxy auth failed")]
    ProxyAuthFailed,

    #[error("Proxy rejected CONNECT to {target}: {reason} ({code:#04x})")]
    ProxyRejected {
        target: String,
        code: u8,
        reason: &'static str,
    },

    #[error("Relay closed for {0}")]
    RelayClosed(SocketAddr),

    #[error("TUN device error: {0}")]
    Tun(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl StackError {
    /// Whether the error only affects one flow (as opposed to the whole engine)
    pub fn is_flow_local(&self) -> bool {
        matches!(
            self,
            StackError::ProxyUnreachable { .. }
                | StackError::ConnectTimeout(_)
                | StackError::ProxyProtocol(_)
                | StackError::ProxyAuthFailed
                | StackError::ProxyRejected { .. }
                | StackError::RelayClosed(_)
        )
    }

    /// Whether the error was caused by garbage input from the TUN side
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            StackError::InvalidPacket(_)
                | StackError::PacketTooShort { .. }
                | StackError::InvalidIpVersion(_)
                | StackError::BadChecksum(_)
        )
    }
}
