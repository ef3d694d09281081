//! I/O scheduler
//!
//! One event loop owns the TUN device and every relay. Packets from the TUN
//! are decoded, routed through the flow table and handed to per-flow relay
//! tasks; relay tasks report back over a single event channel, and replies
//! are synthesized into packets queued for the TUN writer.

use crate::config::EngineConfig;
use crate::error::{Result, StackError};
use crate::flow::{Flow, FlowKey, FlowRef, FlowTable, Outbound, Protocol};
use crate::packet::{self, ParsedPacket, TcpSegment, Transport, UdpDatagram};
use crate::socks5::{RelayConnection, TargetAddr, UdpAssociation};
use crate::stats::StackStats;
use crate::tcp::{self, OutSegment, Reply, TcpReassembly, TimerAction};
use crate::tun::{TunDevice, TunWriter};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

const TUN_READ_BUFFER: usize = 65535;
const RELAY_READ_CHUNK: usize = 16 * 1024;
const UDP_RECV_BUFFER: usize = 65535;
/// Relay events handled per loop turn on top of the polled one
const EVENT_BATCH: usize = 64;

/// Report from a relay task to the event loop
#[derive(Debug)]
pub enum RelayEvent {
    Connected { key: FlowKey },
    ConnectFailed { key: FlowKey, error: StackError },
    Data { key: FlowKey, data: Bytes },
    Datagram { key: FlowKey, src: TargetAddr, data: Bytes },
    Eof { key: FlowKey },
    Error { key: FlowKey, error: StackError },
    Written { key: FlowKey, bytes: usize },
}

/// Keeps `relays_active` honest: dropped with the relay task's sockets
struct RelayGuard(Arc<StackStats>);

impl RelayGuard {
    fn new(stats: Arc<StackStats>) -> Self {
        stats.record_relay_opened();
        Self(stats)
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        self.0.record_relay_closed();
    }
}

pub struct Scheduler {
    config: Arc<EngineConfig>,
    table: Arc<FlowTable>,
    stats: Arc<StackStats>,
    events_tx: mpsc::Sender<RelayEvent>,
    events_rx: mpsc::Receiver<RelayEvent>,
    /// Packets waiting for room in the TUN writer queue
    outbox: VecDeque<BytesMut>,
}

impl Scheduler {
    pub fn new(config: EngineConfig, stats: Arc<StackStats>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.tun_queue_len);
        let table = Arc::new(FlowTable::new(config.max_flows, stats.clone()));
        Self {
            config: Arc::new(config),
            table,
            stats,
            events_tx,
            events_rx,
            outbox: VecDeque::new(),
        }
    }

    pub fn flow_table(&self) -> Arc<FlowTable> {
        self.table.clone()
    }

    pub fn stats(&self) -> Arc<StackStats> {
        self.stats.clone()
    }

    /// Drive `device` until `shutdown` flips to true or the device goes away.
    /// Every flow is closed before this returns.
    pub async fn run(
        mut self,
        device: Box<dyn TunDevice>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, writer) = device.split()?;
        let (tun_tx, tun_rx) = mpsc::channel::<BytesMut>(self.config.tun_queue_len);
        let writer_task = tokio::spawn(tun_write_loop(writer, tun_rx, self.stats.clone()));

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; TUN_READ_BUFFER];

        info!(
            "Scheduler running: proxy={} mtu={} max_flows={}",
            self.config.proxy.address(),
            self.config.mtu,
            self.config.max_flows
        );

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }

                permit = tun_tx.reserve(), if !self.outbox.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(packet) = self.outbox.pop_front() {
                                permit.send(packet);
                            }
                        }
                        Err(_) => break Err(StackError::ChannelClosed),
                    }
                }

                read = reader.read_packet(&mut buf) => {
                    match read {
                        Ok(0) => {
                            info!("TUN device closed");
                            break Ok(());
                        }
                        Ok(n) => self.on_tun_packet(&buf[..n]),
                        Err(e) if is_transient(&e) => {}
                        Err(e) => break Err(StackError::Tun(e.to_string())),
                    }
                }

                Some(event) = self.events_rx.recv(), if self.outbox.is_empty() => {
                    self.on_relay_event(event);
                }

                _ = ticker.tick() => self.on_tick(Instant::now()),
            }

            self.flush_outbox(&tun_tx);
            self.drain_events(&tun_tx);
        };

        let closed = self.table.drain();
        info!("Scheduler stopped, closed {} flows", closed);
        drop(tun_tx);
        writer_task.abort();
        let _ = writer_task.await;
        result
    }

    fn flush_outbox(&mut self, tun_tx: &mpsc::Sender<BytesMut>) {
        while !self.outbox.is_empty() {
            match tun_tx.try_reserve() {
                Ok(permit) => {
                    if let Some(packet) = self.outbox.pop_front() {
                        permit.send(packet);
                    }
                }
                Err(_) => break,
            }
        }
    }

    /// Handle queued relay events while the TUN side keeps up
    fn drain_events(&mut self, tun_tx: &mpsc::Sender<BytesMut>) {
        for _ in 0..EVENT_BATCH {
            if !self.outbox.is_empty() {
                break;
            }
            match self.events_rx.try_recv() {
                Ok(event) => {
                    self.on_relay_event(event);
                    self.flush_outbox(tun_tx);
                }
                Err(_) => break,
            }
        }
    }

    fn push_packet(&mut self, packet: Vec<u8>) {
        if self.outbox.len() >= self.config.tun_queue_len {
            trace!("TUN outbox full, dropping {} byte packet", packet.len());
            self.stats.record_dropped();
            return;
        }
        self.outbox.push_back(BytesMut::from(&packet[..]));
    }

    /// Process an incoming IP packet from TUN
    fn on_tun_packet(&mut self, raw: &[u8]) {
        self.stats.record_tun_in(raw.len());

        let parsed = match packet::decode(raw, self.config.verify_checksums) {
            Ok(p) => p,
            Err(e) => {
                if e.is_malformed_input() {
                    self.stats.record_malformed();
                } else {
                    self.stats.record_dropped();
                }
                debug!("Dropping TUN packet: {}", e);
                return;
            }
        };

        let now = Instant::now();
        match &parsed.transport {
            Transport::Tcp(seg) => {
                let src = SocketAddr::new(parsed.src_addr, seg.src_port);
                let dst = SocketAddr::new(parsed.dst_addr, seg.dst_port);
                trace!(
                    "TCP {} -> {} flags={:?} seq={} ack={} len={}",
                    src, dst, seg.flags, seg.seq, seg.ack, seg.payload.len()
                );
                self.on_tcp_segment(src, dst, seg, now);
            }
            Transport::Udp(dgram) => {
                let src = SocketAddr::new(parsed.src_addr, dgram.src_port);
                let dst = SocketAddr::new(parsed.dst_addr, dgram.dst_port);
                trace!("UDP {} -> {} len={}", src, dst, dgram.payload.len());
                self.on_udp_datagram(src, dst, dgram, raw, now);
            }
            Transport::Other { protocol } => {
                trace!("Ignoring IP protocol {} from {}", protocol, parsed.src_addr);
                self.stats.record_dropped();
            }
        }
    }

    fn on_tcp_segment(&mut self, src: SocketAddr, dst: SocketAddr, seg: &TcpSegment<'_>, now: Instant) {
        let key = FlowKey::tcp(src, dst);
        let is_syn = seg.flags.syn && !seg.flags.ack;

        let mut existing = self.table.get(&key);
        // A new SYN on a finished flow's address pair starts over
        if is_syn && existing.as_ref().is_some_and(|f| f.lock().is_finished()) {
            self.table.remove(&key);
            existing = None;
        }

        let flow = match existing {
            Some(flow) => flow,
            None if is_syn => {
                if let Err(e) = self.open_tcp_flow(key, seg, now) {
                    warn!("Cannot open flow {}: {}", key, e);
                    self.stats.record_dropped();
                }
                return;
            }
            None => {
                // Mid-stream segment for an unknown flow
                if !seg.flags.rst {
                    let (seq, ack, flags) = tcp::reset_reply(seg);
                    self.push_tcp(&key, &OutSegment {
                        seq,
                        ack,
                        flags,
                        window: 0,
                        mss: None,
                        payload: Vec::new(),
                        retransmission: false,
                    });
                }
                self.stats.record_dropped();
                return;
            }
        };

        let mut reset = false;
        let mut segments = Vec::new();
        {
            let mut f = flow.lock();
            f.touch(now);
            let Some(tcp) = f.tcp.as_mut() else { return };
            let outcome = tcp.on_segment(seg, now);

            if outcome.retransmit {
                self.stats.record_retransmit();
            }
            let sent = tcp.poll_segments(now);
            match outcome.reply {
                Reply::Ack if sent.is_empty() => segments.push(tcp.ack_segment()),
                Reply::SynAck => segments.push(tcp.syn_ack(now)),
                Reply::Rst => {
                    let (seq, ack, flags) = tcp::reset_reply(seg);
                    segments.push(OutSegment {
                        seq,
                        ack,
                        flags,
                        window: 0,
                        mss: None,
                        payload: Vec::new(),
                        retransmission: false,
                    });
                }
                _ => {}
            }
            segments.extend(sent);
            if tcp.phase() == tcp::TcpPhase::Reset {
                reset = true;
            }

            if outcome.established {
                debug!("TCP flow {} established", key);
            }
            if !outcome.deliver.is_empty() {
                let len = outcome.deliver.len();
                match f.send_stream(Bytes::from(outcome.deliver)) {
                    Ok(()) => self.stats.record_tx_segments(outcome.delivered_segments, len),
                    Err(e) => {
                        debug!("Relay writer gone for {}: {}", key, e);
                        reset = true;
                    }
                }
            }
            f.release_credits(outcome.acked);
            if outcome.peer_fin {
                f.finish_stream();
            }
        }

        for out in &segments {
            self.push_tcp(&key, out);
        }
        if reset {
            self.reset_flow(&key);
        }
    }

    fn open_tcp_flow(&mut self, key: FlowKey, syn: &TcpSegment<'_>, now: Instant) -> Result<()> {
        let link_mss = link_mss(key.src.ip(), self.config.mtu);
        let tcp_config = &self.config.tcp;
        let (flow, created) = self.table.lookup_or_create(key, || {
            Flow::new_tcp(key, TcpReassembly::new(syn, tcp_config, link_mss), tcp_config.flow_buffer, now)
        })?;
        if !created {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let credits = {
            let mut f = flow.lock();
            f.set_outbound(Outbound::Stream(tx));
            f.credits()
        };
        let task = tokio::spawn(tcp_relay(
            key,
            self.config.clone(),
            rx,
            credits,
            self.events_tx.clone(),
            self.stats.clone(),
        ));
        flow.lock().attach_task(task);
        debug!("TCP flow {} opening relay", key);
        Ok(())
    }

    fn on_udp_datagram(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        dgram: &UdpDatagram<'_>,
        raw: &[u8],
        now: Instant,
    ) {
        let key = FlowKey::udp(src, dst);
        let flow = match self.table.lookup_or_create(key, || Flow::new_udp(key, raw, now)) {
            Ok((flow, created)) => {
                if created {
                    self.open_udp_relay(key, &flow);
                }
                flow
            }
            Err(e) => {
                warn!("Cannot open flow {}: {}", key, e);
                self.stats.record_dropped();
                return;
            }
        };

        let mut f = flow.lock();
        f.touch(now);
        let len = dgram.payload.len();
        match f.send_datagram(Bytes::copy_from_slice(dgram.payload)) {
            Ok(true) => self.stats.record_tx(len),
            Ok(false) => {
                trace!("UDP queue full for {}, dropping datagram", key);
                self.stats.record_dropped();
            }
            Err(e) => {
                trace!("UDP relay gone for {}: {}", key, e);
                self.stats.record_dropped();
            }
        }
    }

    fn open_udp_relay(&mut self, key: FlowKey, flow: &FlowRef) {
        let (tx, rx) = mpsc::channel(self.config.udp.max_pending_datagrams.max(1));
        flow.lock().set_outbound(Outbound::Datagram(tx));
        let task = tokio::spawn(udp_relay(
            key,
            self.config.clone(),
            rx,
            self.events_tx.clone(),
            self.stats.clone(),
        ));
        flow.lock().attach_task(task);
        debug!("UDP flow {} opening association", key);
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        let now = Instant::now();
        match event {
            RelayEvent::Connected { key } => {
                let Some(flow) = self.table.get(&key) else { return };
                let syn_ack = {
                    let mut f = flow.lock();
                    f.touch(now);
                    match f.tcp.as_mut() {
                        Some(tcp) if tcp.phase() == tcp::TcpPhase::SynReceived => Some(tcp.syn_ack(now)),
                        _ => None,
                    }
                };
                if let Some(syn_ack) = syn_ack {
                    self.push_tcp(&key, &syn_ack);
                }
                debug!("Relay connected for {}", key);
            }

            RelayEvent::ConnectFailed { key, error } => {
                self.stats.record_relay_error();
                warn!("Relay for {} failed: {}", key, error);
                let Some(flow) = self.table.remove(&key) else { return };
                match key.protocol {
                    Protocol::Tcp => {
                        let rst = flow.lock().tcp.as_mut().map(|tcp| tcp.abort());
                        if let Some(rst) = rst {
                            self.push_tcp(&key, &rst);
                        }
                    }
                    Protocol::Udp => {
                        let unreachable = flow.lock().first_datagram().and_then(packet::icmp_unreachable);
                        if let Some(icmp) = unreachable {
                            self.push_packet(icmp);
                        }
                    }
                }
            }

            RelayEvent::Data { key, data } => {
                let Some(flow) = self.table.get(&key) else { return };
                let segments = {
                    let mut f = flow.lock();
                    f.touch(now);
                    match f.tcp.as_mut() {
                        Some(tcp) => {
                            tcp.queue_send(&data);
                            tcp.poll_segments(now)
                        }
                        None => Vec::new(),
                    }
                };
                for out in &segments {
                    self.push_tcp(&key, out);
                }
            }

            RelayEvent::Datagram { key, src, data } => {
                let Some(flow) = self.table.get(&key) else { return };
                flow.lock().touch(now);

                // Answer from the address the proxy reports when it is usable
                let from = match src.as_socket_addr() {
                    Some(addr) if addr.is_ipv4() == key.src.is_ipv4() => addr,
                    _ => key.dst,
                };
                let overhead = if key.src.is_ipv4() { 28 } else { 48 };
                if data.len() + overhead > self.config.mtu as usize {
                    trace!("UDP reply of {} bytes exceeds MTU, dropping", data.len());
                    self.stats.record_dropped();
                    return;
                }
                match packet::encode(&ParsedPacket::udp(from, key.src, &data)) {
                    Ok(raw) => {
                        self.stats.record_rx(data.len());
                        self.push_packet(raw);
                    }
                    Err(e) => debug!("Cannot encode UDP reply for {}: {}", key, e),
                }
            }

            RelayEvent::Eof { key } => {
                let Some(flow) = self.table.get(&key) else { return };
                let segments = {
                    let mut f = flow.lock();
                    f.touch(now);
                    match f.tcp.as_mut() {
                        Some(tcp) => {
                            tcp.close_send();
                            tcp.poll_segments(now)
                        }
                        None => Vec::new(),
                    }
                };
                debug!("Relay EOF for {}", key);
                for out in &segments {
                    self.push_tcp(&key, out);
                }
            }

            RelayEvent::Error { key, error } => {
                self.stats.record_relay_error();
                debug!("Relay error for {}: {}", key, error);
                self.reset_flow(&key);
            }

            RelayEvent::Written { key, bytes } => {
                let Some(flow) = self.table.get(&key) else { return };
                let update = {
                    let mut f = flow.lock();
                    match f.tcp.as_mut() {
                        Some(tcp) => tcp.on_relay_written(bytes).then(|| tcp.ack_segment()),
                        None => None,
                    }
                };
                if let Some(ack) = update {
                    self.push_tcp(&key, &ack);
                }
            }
        }
    }

    /// Remove a flow; a TCP flow the app still considers open gets a RST
    fn reset_flow(&mut self, key: &FlowKey) {
        let Some(flow) = self.table.remove(key) else { return };
        let rst = {
            let mut f = flow.lock();
            match f.tcp.as_mut() {
                Some(tcp) if !tcp.is_terminal() => Some(tcp.abort()),
                _ => None,
            }
        };
        if let Some(rst) = rst {
            self.push_tcp(key, &rst);
        }
    }

    /// Retransmission timers and the idle sweep
    fn on_tick(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for key in self.table.keys() {
            let Some(flow) = self.table.get(&key) else { continue };
            let segments = {
                let mut f = flow.lock();
                let Some(tcp) = f.tcp.as_mut() else { continue };
                match tcp.on_tick(now) {
                    TimerAction::None => Vec::new(),
                    TimerAction::ResendSynAck => {
                        self.stats.record_retransmit();
                        vec![tcp.syn_ack(now)]
                    }
                    TimerAction::Resend => tcp.poll_segments(now),
                    TimerAction::GiveUp => {
                        expired.push(key);
                        vec![tcp.abort()]
                    }
                }
            };
            for out in &segments {
                if out.retransmission {
                    self.stats.record_retransmit();
                }
                self.push_tcp(&key, out);
            }
        }
        for key in expired {
            self.table.remove(&key);
        }

        self.table
            .sweep_idle(now, self.config.tcp.idle_timeout, self.config.udp.idle_timeout);
    }

    /// Encode a segment from the remote side of `key` back to the app
    fn push_tcp(&mut self, key: &FlowKey, out: &OutSegment) {
        let packet = ParsedPacket::tcp(
            key.dst,
            key.src,
            out.seq,
            out.ack,
            out.flags,
            out.window,
            out.mss,
            &out.payload,
        );
        match packet::encode(&packet) {
            Ok(raw) => {
                if !out.payload.is_empty() && !out.retransmission {
                    self.stats.record_rx(out.payload.len());
                }
                self.push_packet(raw);
            }
            Err(e) => debug!("Cannot encode segment for {}: {}", key, e),
        }
    }
}

/// Largest TCP payload for a packet to `addr`'s family under `mtu`
fn link_mss(addr: IpAddr, mtu: u16) -> u16 {
    let headers = if addr.is_ipv4() {
        packet::IPV4_HEADER_LEN
    } else {
        packet::IPV6_HEADER_LEN
    } + packet::TCP_HEADER_LEN;
    mtu.saturating_sub(headers as u16).max(1)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

async fn tun_write_loop(
    mut writer: Box<dyn TunWriter>,
    mut rx: mpsc::Receiver<BytesMut>,
    stats: Arc<StackStats>,
) {
    while let Some(packet) = rx.recv().await {
        match writer.write_packet(&packet).await {
            Ok(()) => stats.record_tun_out(packet.len()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("TUN writer closed: {}", e);
                break;
            }
            Err(e) => {
                warn!("TUN write error: {}", e);
                stats.record_dropped();
            }
        }
    }
    debug!("TUN write task stopped");
}

/// Open the SOCKS5 tunnel for a TCP flow, then pump bytes both ways
async fn tcp_relay(
    key: FlowKey,
    config: Arc<EngineConfig>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    credits: Arc<Semaphore>,
    events: mpsc::Sender<RelayEvent>,
    stats: Arc<StackStats>,
) {
    let relay = match RelayConnection::open(&config.proxy, key.dst, config.tcp.connect_timeout).await {
        Ok(relay) => relay,
        Err(error) => {
            let _ = events.send(RelayEvent::ConnectFailed { key, error }).await;
            return;
        }
    };
    let _guard = RelayGuard::new(stats);
    if events.send(RelayEvent::Connected { key }).await.is_err() {
        return;
    }

    let (read_half, write_half) = relay.into_split();
    tokio::join!(
        relay_writer(key, write_half, outbound, events.clone()),
        relay_reader(key, read_half, credits, events),
    );
    trace!("Relay task for {} finished", key);
}

/// App -> proxy. Ends with a half-close once the flow drops its sender.
async fn relay_writer(
    key: FlowKey,
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::Sender<RelayEvent>,
) {
    while let Some(chunk) = outbound.recv().await {
        if let Err(e) = write_half.write_all(&chunk).await {
            let _ = events.send(RelayEvent::Error { key, error: e.into() }).await;
            return;
        }
        let written = RelayEvent::Written { key, bytes: chunk.len() };
        if events.send(written).await.is_err() {
            return;
        }
    }
    if let Err(e) = write_half.shutdown().await {
        trace!("Relay half-close for {} failed: {}", key, e);
    }
}

/// Proxy -> app, reading no more than the flow's unacknowledged-byte credit
async fn relay_reader(
    key: FlowKey,
    mut read_half: OwnedReadHalf,
    credits: Arc<Semaphore>,
    events: mpsc::Sender<RelayEvent>,
) {
    let mut buf = vec![0u8; RELAY_READ_CHUNK];
    loop {
        // Credits are only taken here, so the count can only grow until we read
        let Ok(permit) = credits.acquire().await else { return };
        permit.forget();
        let window = (credits.available_permits() + 1).min(buf.len());

        let event = match read_half.read(&mut buf[..window]).await {
            Ok(0) => {
                credits.add_permits(1);
                let _ = events.send(RelayEvent::Eof { key }).await;
                return;
            }
            Ok(n) => {
                if n > 1 {
                    if let Ok(taken) = credits.try_acquire_many((n - 1) as u32) {
                        taken.forget();
                    }
                }
                RelayEvent::Data { key, data: Bytes::copy_from_slice(&buf[..n]) }
            }
            Err(e) => {
                let _ = events.send(RelayEvent::Error { key, error: e.into() }).await;
                return;
            }
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

/// Open a UDP association for a flow and shuttle datagrams until the
/// control connection or the flow goes away
async fn udp_relay(
    key: FlowKey,
    config: Arc<EngineConfig>,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<RelayEvent>,
    stats: Arc<StackStats>,
) {
    let assoc = match UdpAssociation::open(&config.proxy, config.tcp.connect_timeout).await {
        Ok(assoc) => assoc,
        Err(error) => {
            let _ = events.send(RelayEvent::ConnectFailed { key, error }).await;
            return;
        }
    };
    let _guard = RelayGuard::new(stats);
    if events.send(RelayEvent::Connected { key }).await.is_err() {
        return;
    }

    let (relay, mut control) = assoc.into_split();
    let target = TargetAddr::Ip(key.dst);
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    let mut control_buf = [0u8; 64];

    loop {
        tokio::select! {
            read = control.read(&mut control_buf) => {
                let error = match read {
                    Ok(0) => StackError::RelayClosed(key.dst),
                    Ok(_) => continue,
                    Err(e) => e.into(),
                };
                let _ = events.send(RelayEvent::Error { key, error }).await;
                return;
            }
            datagram = outbound.recv() => {
                let Some(datagram) = datagram else { return };
                if let Err(error) = relay.send_to(&target, &datagram).await {
                    let _ = events.send(RelayEvent::Error { key, error }).await;
                    return;
                }
            }
            received = relay.recv_from(&mut buf) => {
                let event = match received {
                    Ok((src, range)) => RelayEvent::Datagram {
                        key,
                        src,
                        data: Bytes::copy_from_slice(&buf[range]),
                    },
                    Err(error) => {
                        let _ = events.send(RelayEvent::Error { key, error }).await;
                        return;
                    }
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::ChannelTun;
    use std::time::Duration;

    #[test]
    fn link_mss_depends_on_family() {
        assert_eq!(link_mss("10.0.0.1".parse().unwrap(), 1500), 1460);
        assert_eq!(link_mss("fd00::1".parse().unwrap(), 1500), 1440);
        assert_eq!(link_mss("10.0.0.1".parse().unwrap(), 30), 1);
    }

    #[tokio::test]
    async fn stops_on_shutdown_signal() {
        let scheduler = Scheduler::new(EngineConfig::default(), Arc::new(StackStats::new()));
        let (tun, _peer) = ChannelTun::pair(8);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(Box::new(tun), rx));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stops_when_tun_goes_away() {
        let scheduler = Scheduler::new(EngineConfig::default(), Arc::new(StackStats::new()));
        let (tun, peer) = ChannelTun::pair(8);
        let (_tx, rx) = watch::channel(false);

        let handle = tokio::spawn(scheduler.run(Box::new(tun), rx));
        drop(peer);
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
