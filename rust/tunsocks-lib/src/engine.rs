//! Lifecycle controller
//!
//! One authoritative state variable behind one lock drives
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. Everything that
//! can be rejected (double start, bad fd, bad config) is rejected before the
//! worker thread exists.

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tunsocks_stack::{EngineConfig, FdTun, Scheduler, StackStats, StatsSnapshot, TunDevice};

/// At most one engine runs per process
static ENGINE_CLAIMED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    thread: JoinHandle<()>,
    started: Instant,
}

struct Inner {
    state: EngineState,
    worker: Option<Worker>,
    stats: Arc<StackStats>,
    restart_count: u32,
}

pub struct Engine {
    inner: Mutex<Inner>,
    /// Written by callers on rejected starts and by the worker on failure
    last_error: Arc<Mutex<Option<String>>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: EngineState::Stopped,
                worker: None,
                stats: Arc::new(StackStats::new()),
                restart_count: 0,
            }),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Start relaying packets from `tun_fd`. The descriptor is duplicated;
    /// the caller keeps its own copy.
    pub fn start(&self, tun_fd: RawFd, config: EngineConfig) -> Result<()> {
        let result = self.try_start(|| {
            let device = FdTun::dup(tun_fd).map_err(|e| EngineError::InvalidTunFd(e.to_string()))?;
            Ok(Box::new(device) as Box<dyn TunDevice>)
        }, config);
        self.record(result)
    }

    /// Start on an arbitrary device (in-memory TUN, tests, embedders)
    pub fn start_with_device(&self, device: Box<dyn TunDevice>, config: EngineConfig) -> Result<()> {
        let result = self.try_start(|| Ok(device), config);
        self.record(result)
    }

    /// Stop, then start again with a new descriptor and configuration.
    /// Inputs are checked first so a bad restart leaves the engine running.
    pub fn restart(&self, tun_fd: RawFd, config: EngineConfig) -> Result<()> {
        let checked = config
            .validate()
            .map_err(EngineError::from)
            .and_then(|()| FdTun::dup(tun_fd).map_err(|e| EngineError::InvalidTunFd(e.to_string())));
        let device = match checked {
            Ok(device) => device,
            Err(e) => return self.record(Err(e)),
        };

        info!("Restarting engine");
        self.stop();
        let result = self.try_start(|| Ok(Box::new(device) as Box<dyn TunDevice>), config);
        if result.is_ok() {
            self.inner.lock().restart_count += 1;
        }
        self.record(result)
    }

    fn try_start<F>(&self, open_device: F, config: EngineConfig) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn TunDevice>>,
    {
        let mut inner = self.inner.lock();
        if inner.state == EngineState::Running && Self::worker_exited(&inner) {
            self.reap(&mut inner);
        }
        if inner.state != EngineState::Stopped {
            return Err(EngineError::AlreadyRunning);
        }
        config.validate()?;
        let device = open_device()?;

        if ENGINE_CLAIMED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning);
        }
        inner.state = EngineState::Starting;
        info!(
            "Starting engine: proxy={} mtu={} max_flows={}",
            config.proxy.address(),
            config.mtu,
            config.max_flows
        );

        let stats = Arc::new(StackStats::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_stats = stats.clone();
        let last_error = self.last_error.clone();
        let stack_size = config.worker_stack_size;

        let spawned = std::thread::Builder::new()
            .name("tunsocks-worker".to_string())
            .stack_size(stack_size)
            .spawn(move || run_worker(config, device, worker_stats, shutdown_rx, last_error));

        match spawned {
            Ok(thread) => {
                inner.worker = Some(Worker {
                    shutdown: shutdown_tx,
                    thread,
                    started: Instant::now(),
                });
                inner.stats = stats;
                inner.state = EngineState::Running;
                info!("Engine running");
                Ok(())
            }
            Err(e) => {
                inner.state = EngineState::Stopped;
                ENGINE_CLAIMED.store(false, Ordering::Release);
                Err(EngineError::InitFailed(format!("failed to spawn worker: {}", e)))
            }
        }
    }

    fn record(&self, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => *self.last_error.lock() = None,
            Err(e) => {
                warn!("Engine start rejected: {}", e);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
        result
    }

    /// Signal the worker, wait for it to close every flow and exit.
    /// Returns immediately unless the engine is running.
    pub fn stop(&self) {
        let worker = {
            let mut inner = self.inner.lock();
            if inner.state != EngineState::Running {
                return;
            }
            inner.state = EngineState::Stopping;
            inner.worker.take()
        };

        info!("Stopping engine");
        if let Some(worker) = worker {
            // The worker may already be gone
            let _ = worker.shutdown.send(true);
            if worker.thread.join().is_err() {
                error!("Engine worker panicked");
                *self.last_error.lock() = Some("engine worker panicked".to_string());
            }
        }

        self.inner.lock().state = EngineState::Stopped;
        ENGINE_CLAIMED.store(false, Ordering::Release);
        info!("Engine stopped");
    }

    fn worker_exited(inner: &Inner) -> bool {
        inner.worker.as_ref().map_or(true, |w| w.thread.is_finished())
    }

    /// Clean up after a worker that ended on its own (TUN closed, fatal I/O)
    fn reap(&self, inner: &mut Inner) {
        if let Some(worker) = inner.worker.take() {
            if worker.thread.join().is_err() {
                error!("Engine worker panicked");
            }
        }
        inner.state = EngineState::Stopped;
        ENGINE_CLAIMED.store(false, Ordering::Release);
        info!("Reaped exited engine worker");
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// Running and the worker thread still alive
    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == EngineState::Running && !Self::worker_exited(&inner)
    }

    /// Counters of the current (or last) run; zero if never started
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.lock().stats.snapshot()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn uptime(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match (&inner.worker, inner.state) {
            (Some(worker), EngineState::Running) => Some(worker.started.elapsed()),
            _ => None,
        }
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.lock().restart_count
    }

    /// Multi-line human-readable status
    pub fn status_report(&self) -> String {
        let (state, thread_alive) = {
            let inner = self.inner.lock();
            (inner.state, !Self::worker_exited(&inner))
        };
        let running = state == EngineState::Running && thread_alive;

        let mut report = String::new();
        let _ = writeln!(report, "Tunnel Running: {}", running);
        let _ = writeln!(report, "Thread Running: {}", thread_alive);
        let _ = writeln!(report, "State: {:?}", state);
        if let Some(uptime) = self.uptime() {
            let _ = writeln!(report, "Uptime: {}s", uptime.as_secs());
        }
        let _ = writeln!(report, "Restarts: {}", self.restart_count());
        if let Some(err) = self.last_error() {
            let _ = writeln!(report, "Last Error: {}", err);
        }
        let _ = write!(report, "{}", self.stats());
        report
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    config: EngineConfig,
    device: Box<dyn TunDevice>,
    stats: Arc<StackStats>,
    shutdown: watch::Receiver<bool>,
    last_error: Arc<Mutex<Option<String>>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build worker runtime: {}", e);
            *last_error.lock() = Some(EngineError::InitFailed(e.to_string()).to_string());
            return;
        }
    };

    let scheduler = Scheduler::new(config, stats);
    if let Err(e) = runtime.block_on(scheduler.run(device, shutdown)) {
        error!("Engine worker failed: {}", e);
        *last_error.lock() = Some(EngineError::from(e).to_string());
    }
    // Dropping the runtime drops every aborted relay task and its socket
    drop(runtime);
    info!("Engine worker exited");
}
