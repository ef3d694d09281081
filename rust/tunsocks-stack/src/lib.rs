//! Tunsocks stack - user-space TUN-to-SOCKS5 engine
//!
//! IP packets read from a TUN device are decoded, tracked per flow and
//! relayed through a SOCKS5 proxy: TCP streams are terminated locally and
//! reassembled before being written to a CONNECT tunnel, UDP datagrams go
//! through a UDP ASSOCIATE relay. Replies are synthesized back into IP
//! packets for the device.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                     TUN device (tun)                        |
//! +-------------------------------------------------------------+
//!                  |  raw IP packets  ^
//!                  v                  |
//! +-------------------------------------------------------------+
//! |                  Scheduler (stack)                          |
//! |  packet codec -> flow table -> TCP reassembly               |
//! +-------------------------------------------------------------+
//!                  |  bytes/datagrams ^  relay events
//!                  v                  |
//! +-------------------------------------------------------------+
//! |           SOCKS5 relay tasks (socks5)                       |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokio::sync::watch;
//! use tunsocks_stack::{EngineConfig, FdTun, Scheduler, StackStats};
//!
//! let config = EngineConfig::builder().proxy("127.0.0.1", 1080).mtu(1500).build();
//! config.validate()?;
//! let scheduler = Scheduler::new(config, Arc::new(StackStats::new()));
//! let (stop_tx, stop_rx) = watch::channel(false);
//! scheduler.run(Box::new(FdTun::dup(tun_fd)?), stop_rx).await?;
//! ```

pub mod config;
pub mod error;
pub mod flow;
pub mod packet;
pub mod socks5;
pub mod stack;
pub mod stats;
pub mod tcp;
pub mod tun;


// Re-exports for convenience
pub use config::{EngineConfig, EngineConfigBuilder, ProxyAuth, ProxyConfig, TcpConfig, UdpConfig};
pub use error::{Result, StackError};
pub use flow::{Flow, FlowKey, FlowTable, Protocol};
pub use packet::{decode, encode, ParsedPacket, TcpFlags, Transport};
pub use socks5::{
    clear_protect_callback, has_protect_callback, set_protect_callback, RelayConnection, TargetAddr,
    UdpAssociation,
};
pub use stack::{RelayEvent, Scheduler};
pub use stats::{StackStats, StatsSnapshot};
pub use tcp::{TcpPhase, TcpReassembly};
pub use tun::{ChannelTun, FdTun, TunDevice, TunPeer, TunReader, TunWriter};
