//! SOCKS5 relay client (RFC 1928, RFC 1929)
//!
//! [`RelayConnection`] is one CONNECT tunnel; [`UdpAssociation`] one UDP
//! ASSOCIATE session. Every upstream socket goes through the protect hook
//! before it connects so a VPN host can keep it out of the tunnel.

use crate::config::{ProxyAuth, ProxyConfig};
use crate::error::{Result, StackError};
use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, info, trace, warn};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Socket protect callback type
type ProtectCallback = Arc<dyn Fn(RawFd) -> bool + Send + Sync>;

static PROTECT_CALLBACK: RwLock<Option<ProtectCallback>> = RwLock::new(None);

/// Install the process-wide hook called with every upstream socket's fd
/// before it connects
pub fn set_protect_callback<F>(callback: F)
where
    F: Fn(RawFd) -> bool + Send + Sync + 'static,
{
    *PROTECT_CALLBACK.write() = Some(Arc::new(callback));
    info!("Socket protect callback registered");
}

pub fn clear_protect_callback() {
    *PROTECT_CALLBACK.write() = None;
    info!("Socket protect callback cleared");
}

pub fn has_protect_callback() -> bool {
    PROTECT_CALLBACK.read().is_some()
}

fn protect_socket(fd: RawFd) {
    let callback = PROTECT_CALLBACK.read().clone();
    if let Some(callback) = callback {
        if callback(fd) {
            trace!("Socket fd={} protected", fd);
        } else {
            warn!("Socket fd={} protection FAILED, traffic may loop through the tunnel", fd);
        }
    }
}

/// RFC 1928 reply code names
pub fn reply_reason(code: u8) -> &'static str {
    match code {
        0x00 => "Succeeded",
        0x01 => "General SOCKS server failure",
        0x02 => "Connection not allowed by ruleset",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "Unknown error",
    }
}

/// SOCKS5 address: an IP endpoint or a domain to be resolved by the proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Some(*addr),
            TargetAddr::Domain(..) => None,
        }
    }

    /// Append `ATYP | ADDR | PORT`
    fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            TargetAddr::Ip(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        buf.push(ATYP_IPV4);
                        buf.extend_from_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        buf.push(ATYP_IPV6);
                        buf.extend_from_slice(&ip.octets());
                    }
                }
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                if domain.is_empty() || domain.len() > 255 {
                    return Err(StackError::ProxyProtocol(format!(
                        "domain length {} out of range",
                        domain.len()
                    )));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Parse `ATYP | ADDR | PORT` from a datagram header; returns the address
    /// and the number of bytes consumed
    fn parse(buf: &[u8]) -> Option<(TargetAddr, usize)> {
        match *buf.first()? {
            ATYP_IPV4 if buf.len() >= 7 => {
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Some((TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_IPV6 if buf.len() >= 19 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Some((TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)), 19))
            }
            ATYP_DOMAIN if buf.len() >= 2 => {
                let len = buf[1] as usize;
                if buf.len() < 4 + len {
                    return None;
                }
                let domain = String::from_utf8(buf[2..2 + len].to_vec()).ok()?;
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Some((TargetAddr::Domain(domain, port), 4 + len))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Relay connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Authenticating,
    Relaying,
    Closed,
}

/// One SOCKS5 CONNECT tunnel
pub struct RelayConnection {
    stream: TcpStream,
    target: TargetAddr,
    state: RelayState,
}

impl RelayConnection {
    /// Connect to the proxy and run the handshake for `target`. The whole
    /// exchange is bounded by `timeout`.
    pub async fn open(
        proxy: &ProxyConfig,
        target: impl Into<TargetAddr>,
        timeout: Duration,
    ) -> Result<Self> {
        let target = target.into();
        tokio::time::timeout(timeout, Self::establish(proxy, target))
            .await
            .map_err(|_| StackError::ConnectTimeout(timeout))?
    }

    async fn establish(proxy: &ProxyConfig, target: TargetAddr) -> Result<Self> {
        let mut state = RelayState::Connecting;
        trace!("SOCKS5 {:?}: {} via {}", state, target, proxy.address());
        let mut stream = connect_proxy(proxy).await?;

        state = RelayState::Authenticating;
        trace!("SOCKS5 {:?}: {}", state, target);
        negotiate(&mut stream, proxy.auth.as_ref()).await?;

        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
        target.write_to(&mut request)?;
        stream.write_all(&request).await?;
        read_reply(&mut stream, &target).await?;

        state = RelayState::Relaying;
        debug!("SOCKS5: tunnel established to {}", target);
        Ok(Self { stream, target, state })
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.state == RelayState::Closed {
            return Err(StackError::ChannelClosed);
        }
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Read upstream bytes; `Ok(0)` is EOF
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state == RelayState::Closed {
            return Ok(0);
        }
        let n = self.stream.read(buf).await?;
        Ok(n)
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.state != RelayState::Closed {
            self.state = RelayState::Closed;
            self.stream.shutdown().await?;
        }
        Ok(())
    }

    /// Split into halves for independent reader and writer tasks
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}

/// Resolve the proxy and connect a protected socket to the first address
/// that accepts
async fn connect_proxy(proxy: &ProxyConfig) -> Result<TcpStream> {
    let addr = proxy.address();
    let unreachable = |source: io::Error| StackError::ProxyUnreachable {
        addr: addr.clone(),
        source,
    };

    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(&addr)
        .await
        .map_err(unreachable)?
        .collect();

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
    for candidate in candidates {
        match connect_protected(candidate).await {
            Ok(stream) => {
                // Handshake messages are tiny; don't let Nagle hold them
                if let Err(e) = stream.set_nodelay(true) {
                    trace!("set_nodelay failed: {}", e);
                }
                return Ok(stream);
            }
            Err(e) => {
                debug!("SOCKS5 proxy {} refused: {}", candidate, e);
                last_err = e;
            }
        }
    }
    Err(unreachable(last_err))
}

async fn connect_protected(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    protect_socket(socket.as_raw_fd());
    socket.connect(addr).await
}

/// Method negotiation plus optional username/password sub-negotiation
async fn negotiate(stream: &mut TcpStream, auth: Option<&ProxyAuth>) -> Result<()> {
    let greeting: &[u8] = if auth.is_some() {
        &[SOCKS_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[SOCKS_VERSION, 0x01, METHOD_NO_AUTH]
    };
    stream.write_all(greeting).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != SOCKS_VERSION {
        return Err(StackError::ProxyProtocol(format!(
            "invalid version {:#04x} in method reply",
            response[0]
        )));
    }

    match (response[1], auth) {
        (METHOD_NO_AUTH, _) => Ok(()),
        (METHOD_USER_PASS, Some(auth)) => authenticate(stream, auth).await,
        (METHOD_USER_PASS, None) => Err(StackError::ProxyProtocol(
            "server requires auth but no credentials configured".to_string(),
        )),
        (METHOD_NONE_ACCEPTABLE, _) => Err(StackError::ProxyProtocol(
            "no acceptable auth method".to_string(),
        )),
        (method, _) => Err(StackError::ProxyProtocol(format!(
            "unsupported auth method {:#04x}",
            method
        ))),
    }
}

async fn authenticate(stream: &mut TcpStream, auth: &ProxyAuth) -> Result<()> {
    let mut request = Vec::with_capacity(3 + auth.username.len() + auth.password.len());
    request.push(AUTH_VERSION);
    request.push(auth.username.len() as u8);
    request.extend_from_slice(auth.username.as_bytes());
    request.push(auth.password.len() as u8);
    request.extend_from_slice(auth.password.as_bytes());
    stream.write_all(&request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != AUTH_VERSION {
        return Err(StackError::ProxyProtocol(format!(
            "invalid auth version {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(StackError::ProxyAuthFailed);
    }
    Ok(())
}

/// Read a CONNECT / UDP ASSOCIATE reply and return the bound address
async fn read_reply(stream: &mut TcpStream, target: &TargetAddr) -> Result<TargetAddr> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(StackError::ProxyProtocol(format!(
            "invalid version {:#04x} in reply",
            header[0]
        )));
    }
    if header[1] != 0x00 {
        return Err(StackError::ProxyRejected {
            target: target.to_string(),
            code: header[1],
            reason: reply_reason(header[1]),
        });
    }

    let mut addr = vec![header[3]];
    match header[3] {
        ATYP_IPV4 => addr.resize(1 + 6, 0),
        ATYP_IPV6 => addr.resize(1 + 18, 0),
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            addr.push(len);
            addr.resize(2 + len as usize + 2, 0);
        }
        other => {
            return Err(StackError::ProxyProtocol(format!(
                "unsupported address type {:#04x} in reply",
                other
            )))
        }
    }
    let start = if header[3] == ATYP_DOMAIN { 2 } else { 1 };
    stream.read_exact(&mut addr[start..]).await?;

    TargetAddr::parse(&addr)
        .map(|(bound, _)| bound)
        .ok_or_else(|| StackError::ProxyProtocol("malformed bound address".to_string()))
}

/// One SOCKS5 UDP ASSOCIATE session. The control connection is held open for
/// as long as the association lives.
pub struct UdpAssociation {
    control: TcpStream,
    relay: UdpRelay,
}

/// Datagram side of a [`UdpAssociation`]
pub struct UdpRelay {
    socket: UdpSocket,
    relay_addr: SocketAddr,
}

impl UdpAssociation {
    pub async fn open(proxy: &ProxyConfig, timeout: Duration) -> Result<Self> {
        tokio::time::timeout(timeout, Self::establish(proxy))
            .await
            .map_err(|_| StackError::ConnectTimeout(timeout))?
    }

    async fn establish(proxy: &ProxyConfig) -> Result<Self> {
        let mut control = connect_proxy(proxy).await?;
        negotiate(&mut control, proxy.auth.as_ref()).await?;

        // Unknown client endpoint: all zeros (RFC 1928 sec 6)
        let request = [SOCKS_VERSION, CMD_UDP_ASSOCIATE, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
        control.write_all(&request).await?;

        let placeholder = TargetAddr::Ip(SocketAddr::from(([0, 0, 0, 0], 0)));
        let bound = read_reply(&mut control, &placeholder).await?;
        let mut relay_addr = bound.as_socket_addr().ok_or_else(|| {
            StackError::ProxyProtocol("UDP relay address must be an IP".to_string())
        })?;
        // An unspecified relay address means "same host as the proxy"
        if relay_addr.ip().is_unspecified() {
            relay_addr.set_ip(control.peer_addr()?.ip());
        }

        let bind: SocketAddr = if relay_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let std_socket = std::net::UdpSocket::bind(bind)?;
        protect_socket(std_socket.as_raw_fd());
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        socket.connect(relay_addr).await?;

        debug!("SOCKS5 UDP relay at {}", relay_addr);
        Ok(Self {
            control,
            relay: UdpRelay { socket, relay_addr },
        })
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay.relay_addr
    }

    pub async fn send_to(&self, dst: &TargetAddr, payload: &[u8]) -> Result<()> {
        self.relay.send_to(dst, payload).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(TargetAddr, Range<usize>)> {
        self.relay.recv_from(buf).await
    }

    /// Datagram half plus the control connection, whose EOF ends the association
    pub fn into_split(self) -> (UdpRelay, TcpStream) {
        (self.relay, self.control)
    }
}

impl UdpRelay {
    /// Send one datagram wrapped in the RFC 1928 sec 7 header
    pub async fn send_to(&self, dst: &TargetAddr, payload: &[u8]) -> Result<()> {
        let mut datagram = Vec::with_capacity(payload.len() + 22);
        datagram.extend_from_slice(&[0x00, 0x00, 0x00]); // RSV, FRAG
        dst.write_to(&mut datagram)?;
        datagram.extend_from_slice(payload);
        self.socket.send(&datagram).await?;
        Ok(())
    }

    /// Receive one datagram; returns its source and where the payload sits
    /// in `buf`. Fragmented or malformed datagrams are skipped.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(TargetAddr, Range<usize>)> {
        loop {
            let n = self.socket.recv(buf).await?;
            if n < 4 || buf[2] != 0x00 {
                trace!("dropping fragmented or short SOCKS5 datagram ({} bytes)", n);
                continue;
            }
            match TargetAddr::parse(&buf[3..n]) {
                Some((src, used)) => return Ok((src, 3 + used..n)),
                None => trace!("dropping SOCKS5 datagram with bad header"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, ProxyConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, ProxyConfig::new("127.0.0.1", port))
    }

    /// Accept one client, check the greeting, and answer with `method`
    async fn accept_greeting(listener: &TcpListener, method: u8) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 5);
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();
        stream.write_all(&[5, method]).await.unwrap();
        stream
    }

    async fn read_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let n = stream.read(&mut buf).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn connect_without_auth_relays_bytes() {
        let (listener, proxy) = listener().await;
        let server = tokio::spawn(async move {
            let mut stream = accept_greeting(&listener, METHOD_NO_AUTH).await;
            let request = read_request(&mut stream).await;
            assert_eq!(request, [5, 1, 0, 1, 93, 184, 216, 34, 0, 80]);
            stream.write_all(&[5, 0, 0, 1, 10, 0, 0, 1, 0x1f, 0x90]).await.unwrap();

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let target: SocketAddr = "93.184.216.34:80".parse().unwrap();
        let mut relay = RelayConnection::open(&proxy, target, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(relay.state(), RelayState::Relaying);

        relay.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            read += relay.receive(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf, b"ping");

        relay.close().await.unwrap();
        assert_eq!(relay.state(), RelayState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn username_password_auth() {
        let (listener, mut proxy) = listener().await;
        proxy.auth = Some(ProxyAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        });

        let server = tokio::spawn(async move {
            let mut stream = accept_greeting(&listener, METHOD_USER_PASS).await;
            let auth = read_request(&mut stream).await;
            assert_eq!(auth, [1, 4, b'u', b's', b'e', b'r', 4, b'p', b'a', b's', b's']);
            stream.write_all(&[1, 0]).await.unwrap();

            let request = read_request(&mut stream).await;
            assert_eq!(&request[..5], &[5, 1, 0, 3, 11]);
            assert_eq!(&request[5..16], b"example.com");
            stream.write_all(&[5, 0, 0, 3, 2, b'o', b'k', 0, 0]).await.unwrap();
        });

        let relay = RelayConnection::open(
            &proxy,
            TargetAddr::Domain("example.com".to_string(), 443),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(relay.target().port(), 443);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn auth_rejection_is_reported() {
        let (listener, mut proxy) = listener().await;
        proxy.auth = Some(ProxyAuth {
            username: "user".to_string(),
            password: "wrong".to_string(),
        });

        tokio::spawn(async move {
            let mut stream = accept_greeting(&listener, METHOD_USER_PASS).await;
            read_request(&mut stream).await;
            stream.write_all(&[1, 1]).await.unwrap();
        });

        let target: SocketAddr = "1.1.1.1:443".parse().unwrap();
        let err = RelayConnection::open(&proxy, target, Duration::from_secs(5)).await.err().unwrap();
        assert!(matches!(err, StackError::ProxyAuthFailed));
    }

    #[tokio::test]
    async fn auth_reply_with_wrong_version_is_rejected() {
        let (listener, mut proxy) = listener().await;
        proxy.auth = Some(ProxyAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        });

        tokio::spawn(async move {
            let mut stream = accept_greeting(&listener, METHOD_USER_PASS).await;
            read_request(&mut stream).await;
            // SOCKS version byte where the sub-negotiation version belongs
            stream.write_all(&[5, 0]).await.unwrap();
        });

        let target: SocketAddr = "1.1.1.1:443".parse().unwrap();
        let err = RelayConnection::open(&proxy, target, Duration::from_secs(5)).await.err().unwrap();
        assert!(matches!(err, StackError::ProxyProtocol(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn rejected_connect_names_reply_code() {
        let (listener, proxy) = listener().await;
        tokio::spawn(async move {
            let mut stream = accept_greeting(&listener, METHOD_NO_AUTH).await;
            read_request(&mut stream).await;
            stream.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let target: SocketAddr = "[2001:db8::1]:22".parse().unwrap();
        let err = RelayConnection::open(&proxy, target, Duration::from_secs(5)).await.err().unwrap();
        match err {
            StackError::ProxyRejected { code, reason, target } => {
                assert_eq!(code, 5);
                assert_eq!(reason, "Connection refused");
                assert_eq!(target, "[2001:db8::1]:22");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let (listener, proxy) = listener().await;
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let target: SocketAddr = "1.1.1.1:80".parse().unwrap();
        let err = RelayConnection::open(&proxy, target, Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StackError::ConnectTimeout(_)));
        assert!(err.is_flow_local());
    }

    #[tokio::test]
    async fn unreachable_proxy_is_reported() {
        let (listener, proxy) = listener().await;
        drop(listener);

        let target: SocketAddr = "1.1.1.1:80".parse().unwrap();
        let err = RelayConnection::open(&proxy, target, Duration::from_secs(5)).await.err().unwrap();
        assert!(matches!(err, StackError::ProxyUnreachable { .. }));
    }

    #[tokio::test]
    async fn udp_associate_wraps_datagrams() {
        let (listener, proxy) = listener().await;
        let relay_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay_socket.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut control = accept_greeting(&listener, METHOD_NO_AUTH).await;
            let request = read_request(&mut control).await;
            assert_eq!(&request[..2], &[5, 3]);
            let mut reply = vec![5, 0, 0, 1, 0, 0, 0, 0];
            reply.extend_from_slice(&relay_port.to_be_bytes());
            control.write_all(&reply).await.unwrap();

            let mut buf = [0u8; 1500];
            let (n, client) = relay_socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..10], &[0, 0, 0, 1, 8, 8, 8, 8, 0, 53]);
            assert_eq!(&buf[10..n], b"query");

            let mut answer = vec![0, 0, 0, 1, 8, 8, 8, 8, 0, 53];
            answer.extend_from_slice(b"answer");
            relay_socket.send_to(&answer, client).await.unwrap();
            control
        });

        let assoc = UdpAssociation::open(&proxy, Duration::from_secs(5)).await.unwrap();
        assert_eq!(assoc.relay_addr().port(), relay_port);
        assert!(assoc.relay_addr().ip().is_loopback());

        let dst = TargetAddr::Ip("8.8.8.8:53".parse().unwrap());
        assoc.send_to(&dst, b"query").await.unwrap();

        let mut buf = [0u8; 1500];
        let (src, range) = assoc.recv_from(&mut buf).await.unwrap();
        assert_eq!(src, dst);
        assert_eq!(&buf[range], b"answer");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn protect_hook_sees_upstream_sockets() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        set_protect_callback(|fd| {
            assert!(fd >= 0);
            CALLS.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert!(has_protect_callback());

        let (listener, proxy) = listener().await;
        tokio::spawn(async move {
            let mut stream = accept_greeting(&listener, METHOD_NO_AUTH).await;
            read_request(&mut stream).await;
            stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let target: SocketAddr = "1.1.1.1:80".parse().unwrap();
        RelayConnection::open(&proxy, target, Duration::from_secs(5)).await.unwrap();
        assert!(CALLS.load(Ordering::SeqCst) >= 1);
        clear_protect_callback();
    }

    #[test]
    fn datagram_header_parsing() {
        let (addr, used) = TargetAddr::parse(&[1, 127, 0, 0, 1, 0x1f, 0x90]).unwrap();
        assert_eq!(addr, TargetAddr::Ip("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(used, 7);

        let (addr, used) = TargetAddr::parse(&[3, 1, b'a', 0, 80, 0xff]).unwrap();
        assert_eq!(addr, TargetAddr::Domain("a".to_string(), 80));
        assert_eq!(used, 5);

        assert!(TargetAddr::parse(&[4, 0, 0]).is_none());
        assert!(TargetAddr::parse(&[9]).is_none());
        assert_eq!(reply_reason(0x04), "Host unreachable");
        assert_eq!(reply_reason(0x42), "Unknown error");
    }
}
