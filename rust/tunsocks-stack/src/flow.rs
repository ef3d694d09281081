//! Flow table: one entry per relayed TCP connection or UDP session

use crate::error::{Result, StackError};
use crate::stats::StackStats;
use crate::tcp::TcpReassembly;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Flow key: `src` is the app side, `dst` the remote destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn new(protocol: Protocol, src: SocketAddr, dst: SocketAddr) -> Self {
        Self { protocol, src, dst }
    }

    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Protocol::Tcp, src, dst)
    }

    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Protocol::Udp, src, dst)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}

/// Relay-bound side of a flow's upstream connection
#[derive(Debug)]
pub enum Outbound {
    /// TCP bytes; the receive window bounds what is queued here
    Stream(mpsc::UnboundedSender<Bytes>),
    /// UDP payloads, bounded while the association is set up
    Datagram(mpsc::Sender<Bytes>),
}

pub struct Flow {
    key: FlowKey,
    created: Instant,
    last_activity: Instant,
    /// Reassembly state; `None` for UDP
    pub tcp: Option<TcpReassembly>,
    /// Credits for upstream reads, returned as the app acknowledges data
    credits: Arc<Semaphore>,
    outbound: Option<Outbound>,
    tasks: Vec<JoinHandle<()>>,
    /// First datagram of a UDP flow, quoted by ICMP if the relay fails
    first_datagram: Option<Vec<u8>>,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("key", &self.key)
            .field("phase", &self.tcp.as_ref().map(|t| t.phase()))
            .field("credits", &self.credits.available_permits())
            .field("relay_open", &self.outbound.is_some())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl Flow {
    pub fn new_tcp(key: FlowKey, tcp: TcpReassembly, flow_buffer: usize, now: Instant) -> Self {
        Self {
            key,
            created: now,
            last_activity: now,
            tcp: Some(tcp),
            credits: Arc::new(Semaphore::new(flow_buffer)),
            outbound: None,
            tasks: Vec::new(),
            first_datagram: None,
        }
    }

    pub fn new_udp(key: FlowKey, first_packet: &[u8], now: Instant) -> Self {
        Self {
            key,
            created: now,
            last_activity: now,
            tcp: None,
            credits: Arc::new(Semaphore::new(0)),
            outbound: None,
            tasks: Vec::new(),
            first_datagram: Some(first_packet.to_vec()),
        }
    }

    pub fn key(&self) -> FlowKey { self.key }
    pub fn created(&self) -> Instant { self.created }
    pub fn last_activity(&self) -> Instant { self.last_activity }
    pub fn credits(&self) -> Arc<Semaphore> { self.credits.clone() }
    pub fn first_datagram(&self) -> Option<&[u8]> { self.first_datagram.as_deref() }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn set_outbound(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    /// TCP flow whose connection reached Closed or Reset
    pub fn is_finished(&self) -> bool {
        self.tcp.as_ref().is_some_and(|t| t.is_terminal())
    }

    pub fn is_idle(&self, now: Instant, tcp_idle: Duration, udp_idle: Duration) -> bool {
        let limit = match self.key.protocol {
            Protocol::Tcp => tcp_idle,
            Protocol::Udp => udp_idle,
        };
        now.saturating_duration_since(self.last_activity) > limit
    }

    /// Queue in-order TCP bytes for the relay writer
    pub fn send_stream(&self, data: Bytes) -> Result<()> {
        match &self.outbound {
            Some(Outbound::Stream(tx)) => tx
                .send(data)
                .map_err(|_| StackError::RelayClosed(self.key.dst)),
            _ => Err(StackError::RelayClosed(self.key.dst)),
        }
    }

    /// Queue a datagram. `Ok(false)` means the queue was full and the datagram dropped.
    pub fn send_datagram(&self, data: Bytes) -> Result<bool> {
        match &self.outbound {
            Some(Outbound::Datagram(tx)) => match tx.try_send(data) {
                Ok(()) => Ok(true),
                Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(StackError::RelayClosed(self.key.dst))
                }
            },
            _ => Err(StackError::RelayClosed(self.key.dst)),
        }
    }

    /// The app finished sending: let the writer drain and half-close upstream
    pub fn finish_stream(&mut self) {
        if matches!(self.outbound, Some(Outbound::Stream(_))) {
            self.outbound = None;
        }
    }

    /// Return credits for bytes the app acknowledged
    pub fn release_credits(&self, n: usize) {
        if n > 0 {
            self.credits.add_permits(n);
        }
    }

    /// Stop every relay task and drop the upstream connection
    pub fn close_relay(&mut self) {
        self.outbound = None;
        self.credits.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.close_relay();
    }
}

pub type FlowRef = Arc<Mutex<Flow>>;

/// Owner of every flow; the only place flows are created or destroyed
pub struct FlowTable {
    flows: DashMap<FlowKey, FlowRef>,
    count: AtomicUsize,
    max_flows: usize,
    stats: Arc<StackStats>,
}

impl FlowTable {
    pub fn new(max_flows: usize, stats: Arc<StackStats>) -> Self {
        Self {
            flows: DashMap::new(),
            count: AtomicUsize::new(0),
            max_flows,
            stats,
        }
    }

    /// Existing flow for `key`, or a new one built by `make`. At most one
    /// flow per key exists; concurrent callers for the same key all get it.
    pub fn lookup_or_create<F>(&self, key: FlowKey, make: F) -> Result<(FlowRef, bool)>
    where
        F: FnOnce() -> Flow,
    {
        match self.flows.entry(key) {
            Entry::Occupied(e) => Ok((e.get().clone(), false)),
            Entry::Vacant(e) => {
                if self.count.fetch_add(1, Ordering::AcqRel) >= self.max_flows {
                    self.count.fetch_sub(1, Ordering::AcqRel);
                    return Err(StackError::FlowTableFull(self.max_flows));
                }
                let flow = Arc::new(Mutex::new(make()));
                e.insert(flow.clone());
                match key.protocol {
                    Protocol::Tcp => self.stats.record_tcp_flow(),
                    Protocol::Udp => self.stats.record_udp_flow(),
                }
                trace!("flow created: {}", key);
                Ok((flow, true))
            }
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<FlowRef> {
        self.flows.get(key).map(|f| f.clone())
    }

    /// Remove a flow and close its relay connection
    pub fn remove(&self, key: &FlowKey) -> Option<FlowRef> {
        let (_, flow) = self.flows.remove(key)?;
        self.on_removed(key, &flow);
        Some(flow)
    }

    fn on_removed(&self, key: &FlowKey, flow: &FlowRef) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        flow.lock().close_relay();
        match key.protocol {
            Protocol::Tcp => self.stats.record_tcp_closed(),
            Protocol::Udp => self.stats.record_udp_closed(),
        }
        trace!("flow removed: {}", key);
    }

    /// Remove flows idle past their protocol's timeout, plus finished TCP
    /// flows. Returns the number removed.
    pub fn sweep_idle(&self, now: Instant, tcp_idle: Duration, udp_idle: Duration) -> usize {
        let expired = |flow: &FlowRef| {
            let flow = flow.lock();
            flow.is_finished() || flow.is_idle(now, tcp_idle, udp_idle)
        };

        let candidates: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|entry| expired(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for key in candidates {
            // Re-check under the shard lock; the flow may have seen traffic since
            if let Some((_, flow)) = self.flows.remove_if(&key, |_, flow| expired(flow)) {
                self.on_removed(&key, &flow);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("swept {} flows, {} remain", removed, self.len());
        }
        removed
    }

    /// Remove every flow (engine shutdown)
    pub fn drain(&self) -> usize {
        let keys: Vec<FlowKey> = self.flows.iter().map(|e| *e.key()).collect();
        keys.iter().filter(|key| self.remove(key).is_some()).count()
    }

    pub fn keys(&self) -> Vec<FlowKey> {
        self.flows.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpConfig;
    use crate::packet::{TcpFlags, TcpSegment};
    use std::thread;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn udp_key(port: u16) -> FlowKey {
        FlowKey::udp(SocketAddr::new("10.0.0.2".parse().unwrap(), port), addr("8.8.8.8:53"))
    }

    fn table(max: usize) -> (FlowTable, Arc<StackStats>) {
        let stats = Arc::new(StackStats::new());
        (FlowTable::new(max, stats.clone()), stats)
    }

    #[test]
    fn lookup_or_create_reuses_existing() {
        let (table, stats) = table(16);
        let now = Instant::now();
        let key = udp_key(5000);

        let (a, created) = table.lookup_or_create(key, || Flow::new_udp(key, b"q", now)).unwrap();
        assert!(created);
        let (b, created) = table.lookup_or_create(key, || panic!("must not build twice")).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        assert_eq!(stats.snapshot().udp_flows_active, 1);
    }

    #[test]
    fn concurrent_creation_yields_one_flow() {
        let (table, stats) = table(16);
        let table = Arc::new(table);
        let key = udp_key(6000);
        let now = Instant::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    let (flow, created) = table
                        .lookup_or_create(key, || Flow::new_udp(key, b"x", now))
                        .unwrap();
                    (flow, created)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        let first = &results[0].0;
        assert!(results.iter().all(|(f, _)| Arc::ptr_eq(f, first)));
        assert_eq!(table.len(), 1);
        assert_eq!(stats.snapshot().udp_flows_total, 1);
    }

    #[test]
    fn table_full_is_reported() {
        let (table, _) = table(2);
        let now = Instant::now();
        for port in 1..=2 {
            let key = udp_key(port);
            table.lookup_or_create(key, || Flow::new_udp(key, b"", now)).unwrap();
        }
        let key = udp_key(3);
        let err = table.lookup_or_create(key, || Flow::new_udp(key, b"", now)).unwrap_err();
        assert!(matches!(err, StackError::FlowTableFull(2)));
        assert_eq!(table.len(), 2);

        table.remove(&udp_key(1));
        assert!(table.lookup_or_create(key, || Flow::new_udp(key, b"", now)).is_ok());
    }

    #[test]
    fn debug_output_skips_task_handles() {
        let key = udp_key(9);
        let flow = Flow::new_udp(key, b"", Instant::now());
        let text = format!("{:?}", flow);
        assert!(text.contains("Flow"));
        assert!(text.contains("relay_open: false"));
        assert!(text.contains("tasks: 0"));
    }

    #[test]
    fn sweep_removes_only_idle_flows() {
        let (table, stats) = table(16);
        let start = Instant::now();
        let idle = udp_key(1);
        let busy = udp_key(2);
        table.lookup_or_create(idle, || Flow::new_udp(idle, b"", start)).unwrap();
        table.lookup_or_create(busy, || Flow::new_udp(busy, b"", start)).unwrap();

        let later = start + Duration::from_secs(61);
        table.get(&busy).unwrap().lock().touch(start + Duration::from_secs(30));

        let removed = table.sweep_idle(later, Duration::from_secs(300), Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert!(table.get(&idle).is_none());
        assert!(table.get(&busy).is_some());
        assert_eq!(stats.snapshot().udp_flows_active, 1);
    }

    #[test]
    fn sweep_reaps_finished_tcp_flows() {
        let (table, _) = table(16);
        let now = Instant::now();
        let key = FlowKey::tcp(addr("10.0.0.2:40000"), addr("93.184.216.34:80"));
        let syn = TcpSegment {
            src_port: 40000,
            dst_port: 80,
            seq: 1,
            ack: 0,
            flags: TcpFlags::syn_only(),
            window: 65535,
            mss: None,
            payload: &[],
        };
        let config = TcpConfig::default();
        table
            .lookup_or_create(key, || {
                Flow::new_tcp(key, TcpReassembly::new(&syn, &config, 1460), config.flow_buffer, now)
            })
            .unwrap();

        assert_eq!(table.sweep_idle(now, config.idle_timeout, Duration::from_secs(60)), 0);
        if let Some(tcp) = table.get(&key).unwrap().lock().tcp.as_mut() {
            tcp.abort();
        }
        assert_eq!(table.sweep_idle(now, config.idle_timeout, Duration::from_secs(60)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn removal_closes_relay_side() {
        let (table, _) = table(4);
        let now = Instant::now();
        let key = udp_key(9);
        let (flow, _) = table.lookup_or_create(key, || Flow::new_udp(key, b"", now)).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        flow.lock().set_outbound(Outbound::Datagram(tx));
        assert!(flow.lock().send_datagram(Bytes::from_static(b"a")).unwrap());

        let credits = flow.lock().credits();
        table.remove(&key);
        assert!(credits.is_closed());
        assert!(flow.lock().send_datagram(Bytes::from_static(b"b")).is_err());
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert!(rx.try_recv().is_err());
        assert_eq!(table.drain(), 0);
    }
}
