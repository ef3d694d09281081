//! Process-global control surface
//!
//! Thin wrappers over one shared [`Engine`], returning the numeric codes in
//! [`codes`](crate::codes) so hosts do not need Rust types.

use crate::engine::Engine;
use crate::error::codes;
use crate::logging;
use once_cell::sync::Lazy;
use std::os::unix::io::RawFd;
use tunsocks_stack::{EngineConfig, StatsSnapshot};

static ENGINE: Lazy<Engine> = Lazy::new(Engine::new);

/// The process-wide engine
pub fn engine() -> &'static Engine {
    &ENGINE
}

/// Start the engine on `tun_fd`; 0 on success, a negative code otherwise
pub fn start(tun_fd: RawFd, config: EngineConfig) -> i32 {
    logging::init_logging(&config.log_level);
    match ENGINE.start(tun_fd, config) {
        Ok(()) => codes::OK,
        Err(e) => e.code(),
    }
}

pub fn restart(tun_fd: RawFd, config: EngineConfig) -> i32 {
    logging::init_logging(&config.log_level);
    match ENGINE.restart(tun_fd, config) {
        Ok(()) => codes::OK,
        Err(e) => e.code(),
    }
}

/// Blocks until every flow is closed and the worker has exited
pub fn stop() {
    ENGINE.stop();
}

pub fn is_running() -> bool {
    ENGINE.is_running()
}

pub fn stats() -> StatsSnapshot {
    ENGINE.stats()
}

pub fn last_error() -> Option<String> {
    ENGINE.last_error()
}

pub fn status_report() -> String {
    ENGINE.status_report()
}

pub fn recent_logs(lines: usize) -> Vec<String> {
    logging::recent_logs(lines)
}
