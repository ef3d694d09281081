//! TUN device abstraction
//!
//! [`FdTun`] wraps a descriptor handed over by the host (Android's
//! `VpnService.establish()`), [`ChannelTun`] is an in-memory device for tests
//! and embedders that move packets themselves.

use crate::error::{Result, StackError};
use async_trait::async_trait;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Read side of a TUN device; one IP packet per call
#[async_trait]
pub trait TunReader: Send {
    /// Read one packet into `buf`. `Ok(0)` means the device is gone.
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write side of a TUN device
#[async_trait]
pub trait TunWriter: Send {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// A device the scheduler can drive. Splitting happens on the worker's
/// runtime, so implementations may register with its reactor.
pub trait TunDevice: Send {
    fn split(self: Box<Self>) -> io::Result<(Box<dyn TunReader>, Box<dyn TunWriter>)>;
}

/// TUN backed by a file descriptor the engine owns
#[derive(Debug)]
pub struct FdTun {
    file: File,
}

impl FdTun {
    /// Validate `fd` and take a duplicate of it. The caller keeps ownership
    /// of `fd`; the duplicate is closed when the device is dropped.
    pub fn dup(fd: RawFd) -> Result<Self> {
        if fd < 0 {
            return Err(StackError::Tun(format!("invalid fd {}", fd)));
        }
        // SAFETY: F_GETFD only inspects the descriptor table
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(StackError::Tun(format!(
                "fd {} is not open: {}",
                fd,
                io::Error::last_os_error()
            )));
        }

        // SAFETY: fd was just checked to be open
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(StackError::Tun(format!(
                "failed to duplicate fd {}: {}",
                fd,
                io::Error::last_os_error()
            )));
        }
        // SAFETY: dup_fd is a fresh descriptor nobody else owns
        let file = unsafe { File::from_raw_fd(dup_fd) };
        set_nonblocking(dup_fd)?;

        debug!("Duplicated TUN fd: {} -> {}", fd, dup_fd);
        Ok(Self { file })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: plain flag manipulation on an owned descriptor
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(StackError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

impl TunDevice for FdTun {
    fn split(self: Box<Self>) -> io::Result<(Box<dyn TunReader>, Box<dyn TunWriter>)> {
        let fd = self.raw_fd();
        let async_fd = Arc::new(AsyncFd::new(self.file)?);
        info!("TUN device fd={} registered", fd);
        Ok((
            Box::new(FdTunReader { fd: async_fd.clone() }),
            Box::new(FdTunWriter { fd: async_fd }),
        ))
    }
}

struct FdTunReader {
    fd: Arc<AsyncFd<File>>,
}

struct FdTunWriter {
    fd: Arc<AsyncFd<File>>,
}

#[async_trait]
impl TunReader for FdTunReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl TunWriter for FdTunWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(packet)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// In-memory TUN device. Packets sent through the paired [`TunPeer`] are read
/// by the engine; packets the engine writes show up on the peer.
pub struct ChannelTun {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// The "kernel" end of a [`ChannelTun`]
pub struct TunPeer {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelTun {
    pub fn pair(capacity: usize) -> (ChannelTun, TunPeer) {
        let (to_engine, inbound) = mpsc::channel(capacity);
        let (outbound, from_engine) = mpsc::channel(capacity);
        (
            ChannelTun { inbound, outbound },
            TunPeer { tx: to_engine, rx: from_engine },
        )
    }
}

impl TunPeer {
    /// Inject a packet as if the app had sent it
    pub async fn send(&self, packet: Vec<u8>) -> Result<()> {
        self.tx.send(packet).await.map_err(|_| StackError::ChannelClosed)
    }

    /// Next packet the engine wrote, `None` once the engine is gone
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

impl TunDevice for ChannelTun {
    fn split(self: Box<Self>) -> io::Result<(Box<dyn TunReader>, Box<dyn TunWriter>)> {
        let ChannelTun { inbound, outbound } = *self;
        Ok((
            Box::new(ChannelTunReader { inbound }),
            Box::new(ChannelTunWriter { outbound }),
        ))
    }
}

struct ChannelTunReader {
    inbound: mpsc::Receiver<Vec<u8>>,
}

struct ChannelTunWriter {
    outbound: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl TunReader for ChannelTunReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbound.recv().await {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl TunWriter for ChannelTunWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "TUN peer dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn dup_rejects_closed_fd() {
        assert!(matches!(FdTun::dup(-1), Err(StackError::Tun(_))));
        assert!(matches!(FdTun::dup(1_000_000), Err(StackError::Tun(_))));
    }

    #[tokio::test]
    async fn fd_tun_moves_whole_packets() {
        let (engine_end, kernel_end) = UnixDatagram::pair().unwrap();
        let tun = FdTun::dup(engine_end.as_raw_fd()).unwrap();
        assert_ne!(tun.raw_fd(), engine_end.as_raw_fd());
        drop(engine_end);

        let (mut reader, mut writer) = Box::new(tun).split().unwrap();

        kernel_end.send(b"first packet").unwrap();
        kernel_end.send(b"second").unwrap();
        let mut buf = [0u8; 64];
        let n = reader.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first packet");
        let n = reader.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");

        writer.write_packet(b"reply").await.unwrap();
        let n = kernel_end.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[tokio::test]
    async fn channel_tun_reports_eof_when_peer_drops() {
        let (tun, mut peer) = ChannelTun::pair(4);
        let (mut reader, mut writer) = Box::new(tun).split().unwrap();

        peer.send(vec![1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read_packet(&mut buf).await.unwrap(), 3);

        writer.write_packet(&[9]).await.unwrap();
        assert_eq!(peer.recv().await, Some(vec![9]));

        drop(peer);
        assert_eq!(reader.read_packet(&mut buf).await.unwrap(), 0);
        assert!(writer.write_packet(&[1]).await.is_err());
    }
}
