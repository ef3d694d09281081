//! Per-flow TCP state
//!
//! The engine terminates the app's TCP connection itself. Inbound segments are
//! reordered into one byte stream for the relay; relay bytes are cut into
//! segments toward the app and kept until acknowledged. There is no congestion
//! control: the app's advertised window is the only send limit.

use crate::config::TcpConfig;
use crate::packet::{TcpFlags, TcpSegment, DEFAULT_MSS};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const DUP_ACK_THRESHOLD: u32 = 3;
const MAX_WINDOW: usize = u16::MAX as usize;
const MAX_RTO: Duration = Duration::from_secs(60);

/// Connection phase (RFC 793 names, seen from the engine's side)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPhase {
    /// SYN seen, relay still opening; nothing sent to the app yet
    SynReceived,
    /// SYN-ACK sent, waiting for the app's ACK
    SynSent,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    Closed,
    Reset,
}

impl TcpPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TcpPhase::Closed | TcpPhase::Reset)
    }

    fn is_synchronized(self) -> bool {
        !matches!(self, TcpPhase::SynReceived | TcpPhase::SynSent) && !self.is_terminal()
    }

    fn accepts_data(self) -> bool {
        matches!(self, TcpPhase::Established | TcpPhase::FinWait1 | TcpPhase::FinWait2)
    }
}

impl std::fmt::Display for TcpPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Control packet to answer an inbound segment with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reply {
    #[default]
    None,
    Ack,
    SynAck,
    Rst,
}

/// Result of feeding one inbound segment
#[derive(Debug, Default)]
pub struct SegmentOutcome {
    pub reply: Reply,
    /// In-order bytes released toward the relay
    pub deliver: Vec<u8>,
    /// Inbound segments contributing to `deliver`, buffered ones included
    pub delivered_segments: usize,
    /// Bytes of relay data the app newly acknowledged
    pub acked: usize,
    pub established: bool,
    /// The app's FIN was consumed; half-close the relay
    pub peer_fin: bool,
    /// Fast retransmit triggered; poll for segments
    pub retransmit: bool,
}

/// Timer outcome from [`TcpReassembly::on_tick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    None,
    ResendSynAck,
    Resend,
    GiveUp,
}

/// Segment to synthesize toward the app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutSegment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
    pub retransmission: bool,
}

/// Check if seq1 is before seq2 (handling wraparound)
pub fn seq_before(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// Check if seq1 is after seq2 (handling wraparound)
pub fn seq_after(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

pub fn seq_before_eq(seq1: u32, seq2: u32) -> bool {
    seq1 == seq2 || seq_before(seq1, seq2)
}

/// `(seq, ack, flags)` of the RST answering `seg` when no connection exists
/// (RFC 793 "Reset Generation")
pub fn reset_reply(seg: &TcpSegment<'_>) -> (u32, u32, TcpFlags) {
    if seg.flags.ack {
        (seg.ack, 0, TcpFlags::rst_only())
    } else {
        (0, seg.seq.wrapping_add(seg.seq_len()), TcpFlags::rst_ack())
    }
}

pub struct TcpReassembly {
    phase: TcpPhase,
    irs: u32,
    rcv_nxt: u32,
    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_max: u32,
    peer_window: u32,
    mss: u16,
    our_mss: u16,
    ooo: BTreeMap<u32, Vec<u8>>,
    ooo_bytes: usize,
    ooo_fin: Option<u32>,
    max_ooo_bytes: usize,
    recv_capacity: usize,
    relay_backlog: usize,
    /// Relay bytes starting at `snd_una` (in flight first, then unsent)
    send_buf: VecDeque<u8>,
    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,
    peer_fin: bool,
    dup_acks: u32,
    base_rto: Duration,
    rto: Duration,
    rto_deadline: Option<Instant>,
    force_probe: bool,
    retransmits: u32,
    max_retransmits: u32,
}

impl TcpReassembly {
    /// State for a flow opened by `syn`. `link_mss` is the largest payload
    /// that fits the TUN MTU for this address family.
    pub fn new(syn: &TcpSegment<'_>, config: &TcpConfig, link_mss: u16) -> Self {
        Self::with_iss(syn, config, link_mss, rand::random())
    }

    pub fn with_iss(syn: &TcpSegment<'_>, config: &TcpConfig, link_mss: u16, iss: u32) -> Self {
        let mss = syn.mss.unwrap_or(DEFAULT_MSS).min(link_mss).max(1);
        Self {
            phase: TcpPhase::SynReceived,
            irs: syn.seq,
            rcv_nxt: syn.seq.wrapping_add(1),
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_max: iss,
            peer_window: syn.window as u32,
            mss,
            our_mss: link_mss,
            ooo: BTreeMap::new(),
            ooo_bytes: 0,
            ooo_fin: None,
            max_ooo_bytes: config.max_ooo_bytes,
            recv_capacity: config.flow_buffer,
            relay_backlog: 0,
            send_buf: VecDeque::new(),
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            peer_fin: false,
            dup_acks: 0,
            base_rto: config.retransmit_timeout,
            rto: config.retransmit_timeout,
            rto_deadline: None,
            force_probe: false,
            retransmits: 0,
            max_retransmits: config.max_retransmits,
        }
    }

    pub fn phase(&self) -> TcpPhase { self.phase }
    pub fn rcv_nxt(&self) -> u32 { self.rcv_nxt }
    pub fn snd_una(&self) -> u32 { self.snd_una }
    pub fn snd_nxt(&self) -> u32 { self.snd_nxt }
    pub fn mss(&self) -> u16 { self.mss }
    pub fn relay_backlog(&self) -> usize { self.relay_backlog }
    pub fn ooo_bytes(&self) -> usize { self.ooo_bytes }
    pub fn send_queued(&self) -> usize { self.send_buf.len() }
    pub fn is_terminal(&self) -> bool { self.phase.is_terminal() }

    /// Free space in the relay-bound buffer, as advertised to the app
    pub fn window(&self) -> u16 {
        self.recv_capacity
            .saturating_sub(self.relay_backlog)
            .min(MAX_WINDOW) as u16
    }

    fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// The relay is up: answer the app's SYN
    pub fn syn_ack(&mut self, now: Instant) -> OutSegment {
        if self.phase == TcpPhase::SynReceived {
            self.phase = TcpPhase::SynSent;
            self.snd_nxt = self.iss.wrapping_add(1);
            self.snd_max = self.snd_nxt;
        }
        self.rto_deadline = Some(now + self.rto);
        OutSegment {
            seq: self.iss,
            ack: self.rcv_nxt,
            flags: TcpFlags::syn_ack(),
            window: self.window(),
            mss: Some(self.our_mss),
            payload: Vec::new(),
            retransmission: false,
        }
    }

    pub fn ack_segment(&self) -> OutSegment {
        OutSegment {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::ack_only(),
            window: self.window(),
            mss: None,
            payload: Vec::new(),
            retransmission: false,
        }
    }

    /// Tear the connection down; the returned RST tells the app
    pub fn abort(&mut self) -> OutSegment {
        self.phase = TcpPhase::Reset;
        self.rto_deadline = None;
        OutSegment {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::rst_ack(),
            window: 0,
            mss: None,
            payload: Vec::new(),
            retransmission: false,
        }
    }

    /// Queue relay bytes for the app
    pub fn queue_send(&mut self, data: &[u8]) {
        if self.fin_queued {
            warn!("dropping {} relay bytes queued after FIN", data.len());
            return;
        }
        self.send_buf.extend(data);
    }

    /// The relay reached EOF: send FIN once queued data is out
    pub fn close_send(&mut self) {
        self.fin_queued = true;
    }

    /// `n` relay-bound bytes were written upstream. Returns true when the
    /// receive window reopened enough to be worth advertising.
    pub fn on_relay_written(&mut self, n: usize) -> bool {
        let threshold = (self.mss as usize).min(self.recv_capacity);
        let before = self.window() as usize;
        self.relay_backlog = self.relay_backlog.saturating_sub(n);
        let after = self.window() as usize;
        before < threshold && after >= threshold && self.phase.is_synchronized()
    }

    /// Process one inbound segment from the app
    pub fn on_segment(&mut self, seg: &TcpSegment<'_>, now: Instant) -> SegmentOutcome {
        let mut out = SegmentOutcome::default();

        if self.phase.is_terminal() {
            // Late FIN or retransmission after close: keep the app quiet
            if self.phase == TcpPhase::Closed && !seg.flags.rst && (seg.flags.fin || !seg.payload.is_empty()) {
                out.reply = Reply::Ack;
            }
            return out;
        }

        if seg.flags.rst {
            if self.rst_acceptable(seg.seq) {
                debug!("TCP RST from app in {}", self.phase);
                self.phase = TcpPhase::Reset;
                self.rto_deadline = None;
            }
            return out;
        }

        if seg.flags.syn {
            if seg.seq == self.irs {
                out.reply = match self.phase {
                    TcpPhase::SynReceived => Reply::None,
                    TcpPhase::SynSent => Reply::SynAck,
                    _ => Reply::Ack,
                };
            } else {
                // A SYN inside a live connection (RFC 793 sec 3.9)
                self.phase = TcpPhase::Reset;
                out.reply = Reply::Rst;
            }
            return out;
        }

        match self.phase {
            TcpPhase::SynReceived => return out,
            TcpPhase::SynSent => {
                if !seg.flags.ack {
                    return out;
                }
                if seg.ack != self.iss.wrapping_add(1) {
                    out.reply = Reply::Rst;
                    return out;
                }
                self.snd_una = seg.ack;
                self.peer_window = seg.window as u32;
                self.retransmits = 0;
                self.rto = self.base_rto;
                self.rto_deadline = None;
                self.phase = TcpPhase::Established;
                out.established = true;
                trace!("TCP established, iss={} irs={}", self.iss, self.irs);
            }
            _ => {
                if !seg.flags.ack {
                    return out;
                }
                if seq_after(seg.ack, self.snd_max) {
                    out.reply = Reply::Ack;
                    return out;
                }
                self.process_ack(seg, now, &mut out);
            }
        }

        if self.phase.accepts_data() && !seg.payload.is_empty() {
            self.process_data(seg.seq, seg.payload, &mut out);
            out.reply = Reply::Ack;
        }

        if seg.flags.fin {
            let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
            if self.peer_fin {
                out.reply = Reply::Ack;
            } else if fin_seq == self.rcv_nxt {
                self.consume_fin(&mut out);
            } else if seq_after(fin_seq, self.rcv_nxt) {
                self.ooo_fin = Some(fin_seq);
                out.reply = Reply::Ack;
            }
        }
        if !self.peer_fin && self.ooo_fin == Some(self.rcv_nxt) {
            self.consume_fin(&mut out);
        }

        out
    }

    fn rst_acceptable(&self, seq: u32) -> bool {
        let window = (self.window() as u32).max(1);
        seq.wrapping_sub(self.rcv_nxt) < window
    }

    fn process_ack(&mut self, seg: &TcpSegment<'_>, now: Instant, out: &mut SegmentOutcome) {
        let ack = seg.ack;
        if seq_after(ack, self.snd_una) {
            let advanced = ack.wrapping_sub(self.snd_una) as usize;
            let data_acked = advanced.min(self.send_buf.len());
            self.send_buf.drain(..data_acked);
            if advanced > data_acked && self.fin_sent {
                self.fin_acked = true;
            }
            self.snd_una = ack;
            if seq_before(self.snd_nxt, ack) {
                self.snd_nxt = ack;
            }
            self.peer_window = seg.window as u32;
            self.dup_acks = 0;
            self.retransmits = 0;
            self.rto = self.base_rto;
            self.rto_deadline = if self.in_flight() > 0 { Some(now + self.rto) } else { None };
            out.acked = data_acked;

            if self.fin_acked {
                self.phase = match self.phase {
                    TcpPhase::FinWait1 => TcpPhase::FinWait2,
                    TcpPhase::Closing | TcpPhase::LastAck => TcpPhase::Closed,
                    other => other,
                };
            }
            return;
        }

        if ack == self.snd_una {
            let window_changed = seg.window as u32 != self.peer_window;
            self.peer_window = seg.window as u32;
            let pure = seg.payload.is_empty() && !seg.flags.fin;
            if pure && !window_changed && self.in_flight() > 0 {
                self.dup_acks += 1;
                if self.dup_acks == DUP_ACK_THRESHOLD {
                    debug!("fast retransmit from seq {}", self.snd_una);
                    self.go_back();
                    out.retransmit = true;
                }
            }
        }
    }

    fn go_back(&mut self) {
        self.snd_nxt = self.snd_una;
        if !self.fin_acked {
            self.fin_sent = false;
        }
    }

    fn process_data(&mut self, seq: u32, data: &[u8], out: &mut SegmentOutcome) {
        let seq_end = seq.wrapping_add(data.len() as u32);
        if seq_before_eq(seq_end, self.rcv_nxt) {
            trace!("duplicate segment seq={} len={} rcv_nxt={}", seq, data.len(), self.rcv_nxt);
            return;
        }

        // Trim the part already received
        let (seq, data) = if seq_before(seq, self.rcv_nxt) {
            let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
            (self.rcv_nxt, &data[skip..])
        } else {
            (seq, data)
        };

        let window = self.window() as usize;
        let offset = seq.wrapping_sub(self.rcv_nxt) as usize;
        if offset >= window {
            trace!("segment beyond window: offset={} window={}", offset, window);
            return;
        }
        let data = &data[..data.len().min(window - offset)];

        if offset == 0 {
            self.accept_in_order(data, out);
            self.drain_ooo(out);
        } else if self.ooo_bytes + data.len() <= self.max_ooo_bytes {
            let longer = self.ooo.get(&seq).map_or(true, |d| d.len() < data.len());
            if longer {
                if let Some(old) = self.ooo.insert(seq, data.to_vec()) {
                    self.ooo_bytes -= old.len();
                }
                self.ooo_bytes += data.len();
                debug!("buffered out-of-order seq={} len={} gap={}", seq, data.len(), offset);
            }
        } else {
            warn!("out-of-order buffer full ({} bytes), dropping seq={}", self.ooo_bytes, seq);
        }
    }

    fn accept_in_order(&mut self, data: &[u8], out: &mut SegmentOutcome) {
        let room = self.window() as usize;
        let data = &data[..data.len().min(room)];
        if data.is_empty() {
            return;
        }
        out.delivered_segments += 1;
        out.deliver.extend_from_slice(data);
        self.relay_backlog += data.len();
        self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
    }

    /// Move buffered segments that now touch `rcv_nxt` into the stream
    fn drain_ooo(&mut self, out: &mut SegmentOutcome) {
        loop {
            let rcv_nxt = self.rcv_nxt;
            let next = self
                .ooo
                .keys()
                .copied()
                .find(|&seq| seq_before_eq(seq, rcv_nxt));
            let Some(seq) = next else { break };
            let Some(data) = self.ooo.remove(&seq) else { break };
            self.ooo_bytes -= data.len();

            let seg_end = seq.wrapping_add(data.len() as u32);
            if seq_after(seg_end, rcv_nxt) {
                let skip = rcv_nxt.wrapping_sub(seq) as usize;
                self.accept_in_order(&data[skip..], out);
            }
        }
    }

    fn consume_fin(&mut self, out: &mut SegmentOutcome) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        self.peer_fin = true;
        self.ooo_fin = None;
        out.peer_fin = true;
        out.reply = Reply::Ack;

        let next = match self.phase {
            TcpPhase::Established => TcpPhase::CloseWait,
            TcpPhase::FinWait1 if self.fin_acked => TcpPhase::Closed,
            TcpPhase::FinWait1 => TcpPhase::Closing,
            TcpPhase::FinWait2 => TcpPhase::Closed,
            other => other,
        };
        debug!("TCP FIN from app: {} -> {}", self.phase, next);
        self.phase = next;
    }

    /// Cut queued relay bytes (and a pending FIN) into segments the app's
    /// window allows
    pub fn poll_segments(&mut self, now: Instant) -> Vec<OutSegment> {
        let mut segments = Vec::new();
        if !self.phase.is_synchronized() || self.fin_acked {
            return segments;
        }

        let mut offset = self.in_flight() as usize;
        if self.fin_sent {
            return segments;
        }
        let mut window_left = (self.peer_window as usize).saturating_sub(offset);
        if self.force_probe && window_left == 0 && offset < self.send_buf.len() {
            window_left = 1;
        }
        self.force_probe = false;

        while offset < self.send_buf.len() && window_left > 0 {
            let len = (self.mss as usize)
                .min(self.send_buf.len() - offset)
                .min(window_left);
            let payload: Vec<u8> = self.send_buf.range(offset..offset + len).copied().collect();
            segments.push(OutSegment {
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                flags: TcpFlags::psh_ack(),
                window: self.window(),
                mss: None,
                payload,
                retransmission: seq_before(self.snd_nxt, self.snd_max),
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
            offset += len;
            window_left -= len;
        }

        if self.fin_queued && offset == self.send_buf.len() {
            segments.push(OutSegment {
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                flags: TcpFlags::fin_ack(),
                window: self.window(),
                mss: None,
                payload: Vec::new(),
                retransmission: seq_before(self.snd_nxt, self.snd_max),
            });
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
            self.phase = match self.phase {
                TcpPhase::Established => TcpPhase::FinWait1,
                TcpPhase::CloseWait => TcpPhase::LastAck,
                other => other,
            };
        }

        if seq_after(self.snd_nxt, self.snd_max) {
            self.snd_max = self.snd_nxt;
        }
        let waiting = offset < self.send_buf.len();
        if self.rto_deadline.is_none() && (self.in_flight() > 0 || waiting) {
            self.rto_deadline = Some(now + self.rto);
        }
        segments
    }

    /// Service the retransmission timer
    pub fn on_tick(&mut self, now: Instant) -> TimerAction {
        let Some(deadline) = self.rto_deadline else {
            return TimerAction::None;
        };
        if now < deadline || self.phase.is_terminal() {
            return TimerAction::None;
        }

        let unacked = self.in_flight() > 0;
        if unacked || self.phase == TcpPhase::SynSent {
            if self.retransmits >= self.max_retransmits {
                warn!("TCP gave up after {} retransmissions in {}", self.retransmits, self.phase);
                self.phase = TcpPhase::Reset;
                self.rto_deadline = None;
                return TimerAction::GiveUp;
            }
            self.retransmits += 1;
        }
        self.rto = (self.rto * 2).min(MAX_RTO);
        self.rto_deadline = Some(now + self.rto);

        if self.phase == TcpPhase::SynSent {
            return TimerAction::ResendSynAck;
        }
        if unacked {
            self.go_back();
            return TimerAction::Resend;
        }
        if !self.send_buf.is_empty() && self.peer_window == 0 {
            // Zero window persist probe
            self.force_probe = true;
            return TimerAction::Resend;
        }
        self.rto_deadline = None;
        TimerAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISS: u32 = 5000;
    const IRS: u32 = 1000;

    fn seg(seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            src_port: 40000,
            dst_port: 80,
            seq,
            ack,
            flags,
            window: 65535,
            mss: None,
            payload,
        }
    }

    fn established() -> (TcpReassembly, Instant) {
        let now = Instant::now();
        let syn = TcpSegment { mss: Some(1460), ..seg(IRS, 0, TcpFlags::syn_only(), &[]) };
        let mut tcp = TcpReassembly::with_iss(&syn, &TcpConfig::default(), 1460, ISS);
        assert_eq!(tcp.phase(), TcpPhase::SynReceived);

        let syn_ack = tcp.syn_ack(now);
        assert_eq!(syn_ack.seq, ISS);
        assert_eq!(syn_ack.ack, IRS + 1);
        assert_eq!(syn_ack.mss, Some(1460));
        assert_eq!(tcp.phase(), TcpPhase::SynSent);

        let out = tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::ack_only(), &[]), now);
        assert!(out.established);
        assert_eq!(tcp.phase(), TcpPhase::Established);
        (tcp, now)
    }

    #[test]
    fn in_order_data_is_delivered() {
        let (mut tcp, now) = established();
        let out = tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::psh_ack(), b"hello"), now);
        assert_eq!(out.deliver, b"hello");
        assert_eq!(out.reply, Reply::Ack);
        assert_eq!(tcp.rcv_nxt(), IRS + 6);
        assert_eq!(tcp.relay_backlog(), 5);
    }

    #[test]
    fn duplicate_is_reacked_not_redelivered() {
        let (mut tcp, now) = established();
        tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::psh_ack(), b"abc"), now);
        let out = tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::psh_ack(), b"abc"), now);
        assert!(out.deliver.is_empty());
        assert_eq!(out.delivered_segments, 0);
        assert_eq!(out.reply, Reply::Ack);
    }

    #[test]
    fn partial_overlap_is_trimmed() {
        let (mut tcp, now) = established();
        tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::psh_ack(), b"abc"), now);
        let out = tcp.on_segment(&seg(IRS + 2, ISS + 1, TcpFlags::psh_ack(), b"bcdef"), now);
        assert_eq!(out.deliver, b"def");
    }

    #[test]
    fn gap_is_buffered_then_filled() {
        let (mut tcp, now) = established();
        let out = tcp.on_segment(&seg(IRS + 4, ISS + 1, TcpFlags::psh_ack(), b"def"), now);
        assert!(out.deliver.is_empty());
        assert_eq!(tcp.ooo_bytes(), 3);

        let out = tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::psh_ack(), b"abc"), now);
        assert_eq!(out.deliver, b"abcdef");
        assert_eq!(out.delivered_segments, 2);
        assert_eq!(tcp.ooo_bytes(), 0);
    }

    #[test]
    fn ooo_cap_drops_excess() {
        let now = Instant::now();
        let config = TcpConfig { max_ooo_bytes: 4, ..TcpConfig::default() };
        let syn = seg(IRS, 0, TcpFlags::syn_only(), &[]);
        let mut tcp = TcpReassembly::with_iss(&syn, &config, 1460, ISS);
        tcp.syn_ack(now);
        tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::ack_only(), &[]), now);

        tcp.on_segment(&seg(IRS + 10, ISS + 1, TcpFlags::psh_ack(), b"xyz"), now);
        tcp.on_segment(&seg(IRS + 20, ISS + 1, TcpFlags::psh_ack(), b"uvw"), now);
        assert_eq!(tcp.ooo_bytes(), 3);
    }

    #[test]
    fn sequence_space_wraps() {
        let now = Instant::now();
        let irs = u32::MAX - 1;
        let syn = seg(irs, 0, TcpFlags::syn_only(), &[]);
        let mut tcp = TcpReassembly::with_iss(&syn, &TcpConfig::default(), 1460, ISS);
        tcp.syn_ack(now);
        tcp.on_segment(&seg(u32::MAX, ISS + 1, TcpFlags::ack_only(), &[]), now);

        let out = tcp.on_segment(&seg(u32::MAX, ISS + 1, TcpFlags::psh_ack(), b"wrap"), now);
        assert_eq!(out.deliver, b"wrap");
        assert_eq!(tcp.rcv_nxt(), 3);
        assert!(seq_before(u32::MAX, 3));
        assert!(seq_after(3, u32::MAX));
    }

    #[test]
    fn receive_window_tracks_relay_backlog() {
        let now = Instant::now();
        let config = TcpConfig { flow_buffer: 8, ..TcpConfig::default() };
        let syn = seg(IRS, 0, TcpFlags::syn_only(), &[]);
        let mut tcp = TcpReassembly::with_iss(&syn, &config, 4, ISS);
        tcp.syn_ack(now);
        tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::ack_only(), &[]), now);

        let out = tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::psh_ack(), b"0123456789"), now);
        assert_eq!(out.deliver, b"01234567");
        assert_eq!(tcp.window(), 0);
        assert_eq!(tcp.ack_segment().window, 0);

        assert!(tcp.on_relay_written(8));
        assert_eq!(tcp.window(), 8);
    }

    #[test]
    fn relay_data_is_segmented_to_window_and_mss() {
        let (mut tcp, now) = established();
        tcp.on_segment(&TcpSegment { window: 2000, ..seg(IRS + 1, ISS + 1, TcpFlags::ack_only(), &[]) }, now);
        tcp.queue_send(&[7u8; 4000]);

        let segments = tcp.poll_segments(now);
        let sizes: Vec<_> = segments.iter().map(|s| s.payload.len()).collect();
        assert_eq!(sizes, vec![1460, 540]);
        assert_eq!(segments[0].seq, ISS + 1);
        assert_eq!(segments[1].seq, ISS + 1461);
        assert!(tcp.poll_segments(now).is_empty());

        let out = tcp.on_segment(&TcpSegment { window: 2000, ..seg(IRS + 1, ISS + 2001, TcpFlags::ack_only(), &[]) }, now);
        assert_eq!(out.acked, 2000);
        assert_eq!(tcp.send_queued(), 2000);
        assert_eq!(tcp.poll_segments(now).len(), 2);
    }

    #[test]
    fn triple_dup_ack_retransmits() {
        let (mut tcp, now) = established();
        tcp.queue_send(b"0123456789");
        assert_eq!(tcp.poll_segments(now).len(), 1);

        let dup = seg(IRS + 1, ISS + 1, TcpFlags::ack_only(), &[]);
        assert!(!tcp.on_segment(&dup, now).retransmit);
        assert!(!tcp.on_segment(&dup, now).retransmit);
        assert!(tcp.on_segment(&dup, now).retransmit);

        let resent = tcp.poll_segments(now);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].seq, ISS + 1);
        assert!(resent[0].retransmission);
    }

    #[test]
    fn rto_retransmits_then_gives_up() {
        let now = Instant::now();
        let config = TcpConfig { max_retransmits: 2, ..TcpConfig::default() };
        let syn = seg(IRS, 0, TcpFlags::syn_only(), &[]);
        let mut tcp = TcpReassembly::with_iss(&syn, &config, 1460, ISS);
        tcp.syn_ack(now);
        tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::ack_only(), &[]), now);
        tcp.queue_send(b"data");
        tcp.poll_segments(now);

        let mut at = now;
        for _ in 0..2 {
            at += Duration::from_secs(120);
            assert_eq!(tcp.on_tick(at), TimerAction::Resend);
            assert_eq!(tcp.poll_segments(at)[0].seq, ISS + 1);
        }
        at += Duration::from_secs(120);
        assert_eq!(tcp.on_tick(at), TimerAction::GiveUp);
        assert_eq!(tcp.phase(), TcpPhase::Reset);
    }

    #[test]
    fn syn_ack_is_retransmitted_until_acked() {
        let now = Instant::now();
        let syn = seg(IRS, 0, TcpFlags::syn_only(), &[]);
        let mut tcp = TcpReassembly::with_iss(&syn, &TcpConfig::default(), 1460, ISS);
        tcp.syn_ack(now);
        assert_eq!(tcp.on_tick(now), TimerAction::None);
        assert_eq!(tcp.on_tick(now + Duration::from_secs(2)), TimerAction::ResendSynAck);

        let out = tcp.on_segment(&syn, now);
        assert_eq!(out.reply, Reply::SynAck);
    }

    #[test]
    fn app_closes_first() {
        let (mut tcp, now) = established();
        let out = tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::fin_ack(), &[]), now);
        assert!(out.peer_fin);
        assert_eq!(tcp.phase(), TcpPhase::CloseWait);

        tcp.close_send();
        let fin = tcp.poll_segments(now);
        assert_eq!(fin.len(), 1);
        assert!(fin[0].flags.fin);
        assert_eq!(tcp.phase(), TcpPhase::LastAck);

        tcp.on_segment(&seg(IRS + 2, ISS + 2, TcpFlags::ack_only(), &[]), now);
        assert_eq!(tcp.phase(), TcpPhase::Closed);
    }

    #[test]
    fn relay_closes_first() {
        let (mut tcp, now) = established();
        tcp.close_send();
        tcp.poll_segments(now);
        assert_eq!(tcp.phase(), TcpPhase::FinWait1);

        tcp.on_segment(&seg(IRS + 1, ISS + 2, TcpFlags::ack_only(), &[]), now);
        assert_eq!(tcp.phase(), TcpPhase::FinWait2);

        tcp.on_segment(&seg(IRS + 1, ISS + 2, TcpFlags::fin_ack(), &[]), now);
        assert_eq!(tcp.phase(), TcpPhase::Closed);
    }

    #[test]
    fn simultaneous_close_goes_through_closing() {
        let (mut tcp, now) = established();
        tcp.close_send();
        tcp.poll_segments(now);

        // App's FIN crosses ours without acknowledging it
        tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::fin_ack(), &[]), now);
        assert_eq!(tcp.phase(), TcpPhase::Closing);

        tcp.on_segment(&seg(IRS + 2, ISS + 2, TcpFlags::ack_only(), &[]), now);
        assert_eq!(tcp.phase(), TcpPhase::Closed);
    }

    #[test]
    fn fin_acking_our_fin_closes_directly() {
        let (mut tcp, now) = established();
        tcp.close_send();
        tcp.poll_segments(now);

        tcp.on_segment(&seg(IRS + 1, ISS + 2, TcpFlags::fin_ack(), &[]), now);
        assert_eq!(tcp.phase(), TcpPhase::Closed);
    }

    #[test]
    fn out_of_order_fin_waits_for_data() {
        let (mut tcp, now) = established();
        let out = tcp.on_segment(&seg(IRS + 4, ISS + 1, TcpFlags::fin_ack(), b"def"), now);
        assert!(!out.peer_fin);

        let out = tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::psh_ack(), b"abc"), now);
        assert_eq!(out.deliver, b"abcdef");
        assert!(out.peer_fin);
        assert_eq!(tcp.phase(), TcpPhase::CloseWait);
    }

    #[test]
    fn rst_is_absorbing() {
        let (mut tcp, now) = established();
        tcp.on_segment(&seg(IRS + 1, 0, TcpFlags::rst_only(), &[]), now);
        assert_eq!(tcp.phase(), TcpPhase::Reset);

        let out = tcp.on_segment(&seg(IRS + 1, ISS + 1, TcpFlags::psh_ack(), b"late"), now);
        assert!(out.deliver.is_empty());
        assert_eq!(tcp.phase(), TcpPhase::Reset);
    }

    #[test]
    fn out_of_window_rst_is_ignored() {
        let (mut tcp, now) = established();
        tcp.on_segment(&seg(IRS + 1 + 1_000_000, 0, TcpFlags::rst_only(), &[]), now);
        assert_eq!(tcp.phase(), TcpPhase::Established);
    }

    #[test]
    fn reset_reply_follows_rfc793() {
        let with_ack = seg(10, 77, TcpFlags::psh_ack(), b"xx");
        assert_eq!(reset_reply(&with_ack), (77, 0, TcpFlags::rst_only()));

        let bare = seg(10, 0, TcpFlags { fin: true, ..Default::default() }, b"xx");
        assert_eq!(reset_reply(&bare), (0, 13, TcpFlags::rst_ack()));
    }
}
