//! Engine configuration
//!
//! Every policy knob (timeouts, buffer caps, table size) lives here instead of
//! being hardcoded in the stack. Defaults are starting points, not tuned values.

use crate::error::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest MTU every IPv4 host must accept (RFC 791)
pub const MIN_MTU: u16 = 576;

/// SOCKS5 username/password credentials (RFC 1929)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Upstream SOCKS5 proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: None,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 1080)
    }
}

/// TCP flow configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Established flows with no activity for this long are swept
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Upper bound on proxy connect + SOCKS5 handshake
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Out-of-order bytes buffered per flow before segments are dropped
    pub max_ooo_bytes: usize,
    /// Per-flow cap on bytes queued in each direction
    pub flow_buffer: usize,
    /// Retransmission timeout for data sent toward the TUN side
    #[serde(with = "duration_secs")]
    pub retransmit_timeout: Duration,
    /// Retransmissions of the same segment before the flow is reset
    pub max_retransmits: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            max_ooo_bytes: 256 * 1024,
            flow_buffer: 64 * 1024,
            retransmit_timeout: Duration::from_secs(1),
            max_retransmits: 8,
        }
    }
}

/// UDP flow configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
    /// Datagrams held while the UDP association is still being set up
    pub max_pending_datagrams: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_pending_datagrams: 64,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub proxy: ProxyConfig,
    /// MTU of the TUN interface; bounds synthesized packet size
    pub mtu: u16,
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    /// Maximum concurrent flows (TCP + UDP)
    pub max_flows: usize,
    /// Period of the idle sweep / retransmission timer
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Verify IP/TCP/UDP checksums on inbound packets
    pub verify_checksums: bool,
    /// Packets queued toward the TUN writer before relays are throttled
    pub tun_queue_len: usize,
    /// Stack size of the worker thread
    pub worker_stack_size: usize,
    /// Default tracing filter directive
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            mtu: 1500,
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            max_flows: 4096,
            sweep_interval: Duration::from_secs(1),
            verify_checksums: true,
            tun_queue_len: 1024,
            worker_stack_size: 2 * 1024 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(StackError::InvalidConfig(msg));

        if self.proxy.host.trim().is_empty() {
            return invalid("proxy host is empty".into());
        }
        if self.proxy.port == 0 {
            return invalid("proxy port is 0".into());
        }
        if let Some(auth) = &self.proxy.auth {
            if auth.username.is_empty() || auth.username.len() > 255 {
                return invalid("proxy username must be 1..=255 bytes".into());
            }
            if auth.password.len() > 255 {
                return invalid("proxy password must be at most 255 bytes".into());
            }
        }
        if self.mtu < MIN_MTU {
            return invalid(format!("mtu {} below minimum {}", self.mtu, MIN_MTU));
        }
        if self.tcp.idle_timeout.is_zero()
            || self.tcp.connect_timeout.is_zero()
            || self.tcp.retransmit_timeout.is_zero()
            || self.udp.idle_timeout.is_zero()
            || self.sweep_interval.is_zero()
        {
            return invalid("timeouts and intervals must be non-zero".into());
        }
        if self.tcp.flow_buffer == 0 || self.tcp.max_ooo_bytes == 0 {
            return invalid("per-flow buffers must be non-zero".into());
        }
        // The relay credit semaphore is sized from this
        if self.tcp.flow_buffer > u32::MAX as usize >> 2 {
            return invalid(format!("flow_buffer {} too large", self.tcp.flow_buffer));
        }
        if self.max_flows == 0 || self.tun_queue_len == 0 {
            return invalid("max_flows and tun_queue_len must be non-zero".into());
        }
        Ok(())
    }
}

/// Fluent builder over [`EngineConfig`]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.proxy.host = host.into();
        self.config.proxy.port = port;
        self
    }

    pub fn auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.proxy.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn tcp_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp.idle_timeout = timeout;
        self
    }

    pub fn udp_timeout(mut self, timeout: Duration) -> Self {
        self.config.udp.idle_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp.connect_timeout = timeout;
        self
    }

    pub fn flow_buffer(mut self, bytes: usize) -> Self {
        self.config.tcp.flow_buffer = bytes;
        self
    }

    pub fn max_flows(mut self, max: usize) -> Self {
        self.config.max_flows = max;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn verify_checksums(mut self, enable: bool) -> Self {
        self.config.verify_checksums = enable;
        self
    }

    pub fn tun_queue_len(mut self, len: usize) -> Self {
        self.config.tun_queue_len = len;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Durations as (fractional) seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
