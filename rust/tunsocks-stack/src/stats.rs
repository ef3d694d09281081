//! Statistics counters for the engine
//!
//! Mutated from the worker on every packet, read from any thread through
//! [`StackStats::snapshot`] without blocking.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide statistics
#[derive(Debug, Default)]
pub struct StackStats {
    // Forwarded payload
    /// TUN-originated segments/datagrams whose payload went upstream; a
    /// buffered out-of-order segment counts when it is released
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    /// Synthesized packets carrying upstream payload back to the TUN
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,

    // Raw TUN traffic
    pub tun_packets_in: AtomicU64,
    pub tun_bytes_in: AtomicU64,
    pub tun_packets_out: AtomicU64,
    pub tun_bytes_out: AtomicU64,

    // Drops
    pub packets_dropped: AtomicU64,
    pub packets_malformed: AtomicU64,

    // Flows
    pub tcp_flows_total: AtomicU64,
    pub tcp_flows_active: AtomicU64,
    pub udp_flows_total: AtomicU64,
    pub udp_flows_active: AtomicU64,

    // Relays
    pub relays_active: AtomicU64,
    pub relay_errors: AtomicU64,
    pub retransmits: AtomicU64,
}

impl StackStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record payload forwarded upstream
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record `segments` TCP segments, `bytes` in total, released upstream
    /// together (an in-order segment plus buffered ones it unblocked)
    pub fn record_tx_segments(&self, segments: usize, bytes: usize) {
        self.tx_packets.fetch_add(segments as u64, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record upstream payload written back toward the app
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_tun_in(&self, bytes: usize) {
        self.tun_packets_in.fetch_add(1, Ordering::Relaxed);
        self.tun_bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_tun_out(&self, bytes: usize) {
        self.tun_packets_out.fetch_add(1, Ordering::Relaxed);
        self.tun_bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Malformed packets count as dropped too
    pub fn record_malformed(&self) {
        self.packets_malformed.fetch_add(1, Ordering::Relaxed);
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_flow(&self) {
        self.tcp_flows_total.fetch_add(1, Ordering::Relaxed);
        self.tcp_flows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_closed(&self) {
        self.tcp_flows_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_udp_flow(&self) {
        self.udp_flows_total.fetch_add(1, Ordering::Relaxed);
        self.udp_flows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_closed(&self) {
        self.udp_flows_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_relay_opened(&self) {
        self.relays_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_closed(&self) {
        self.relays_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_relay_error(&self) {
        self.relay_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tun_packets_in: self.tun_packets_in.load(Ordering::Relaxed),
            tun_bytes_in: self.tun_bytes_in.load(Ordering::Relaxed),
            tun_packets_out: self.tun_packets_out.load(Ordering::Relaxed),
            tun_bytes_out: self.tun_bytes_out.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
            tcp_flows_total: self.tcp_flows_total.load(Ordering::Relaxed),
            tcp_flows_active: self.tcp_flows_active.load(Ordering::Relaxed),
            udp_flows_total: self.udp_flows_total.load(Ordering::Relaxed),
            udp_flows_active: self.udp_flows_active.load(Ordering::Relaxed),
            relays_active: self.relays_active.load(Ordering::Relaxed),
            relay_errors: self.relay_errors.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tun_packets_in: u64,
    pub tun_bytes_in: u64,
    pub tun_packets_out: u64,
    pub tun_bytes_out: u64,
    pub packets_dropped: u64,
    pub packets_malformed: u64,
    pub tcp_flows_total: u64,
    pub tcp_flows_active: u64,
    pub udp_flows_total: u64,
    pub udp_flows_active: u64,
    pub relays_active: u64,
    pub relay_errors: u64,
    pub retransmits: u64,
}

impl StatsSnapshot {
    /// Active flows (TCP + UDP)
    pub fn active_flows(&self) -> u64 {
        self.tcp_flows_active + self.udp_flows_active
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TX: {} packets, {} bytes", self.tx_packets, self.tx_bytes)?;
        writeln!(f, "RX: {} packets, {} bytes", self.rx_packets, self.rx_bytes)?;
        writeln!(
            f,
            "TUN: {} in / {} out, {} dropped ({} malformed)",
            self.tun_packets_in, self.tun_packets_out, self.packets_dropped, self.packets_malformed
        )?;
        writeln!(
            f,
            "Flows: {} TCP / {} UDP active ({} / {} total)",
            self.tcp_flows_active, self.udp_flows_active, self.tcp_flows_total, self.udp_flows_total
        )?;
        write!(
            f,
            "Relays: {} open, {} errors, {} retransmits",
            self.relays_active, self.relay_errors, self.retransmits
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = StackStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());

        stats.record_tx(100);
        stats.record_tx(50);
        stats.record_rx(10);
        stats.record_malformed();
        stats.record_tcp_flow();
        stats.record_udp_flow();
        stats.record_udp_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.tx_packets, 2);
        assert_eq!(snap.tx_bytes, 150);
        assert_eq!(snap.rx_bytes, 10);
        assert_eq!(snap.packets_dropped, 1);
        assert_eq!(snap.packets_malformed, 1);
        assert_eq!(snap.active_flows(), 1);
        assert_eq!(snap.udp_flows_total, 1);
    }

    #[test]
    fn snapshot_serializes_and_displays() {
        let stats = StackStats::new();
        stats.record_tx(3);
        let snap = stats.snapshot();

        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["tx_packets"], 1);
        assert_eq!(json["tx_bytes"], 3);
        assert!(snap.to_string().starts_with("TX: 1 packets, 3 bytes"));
    }
}
