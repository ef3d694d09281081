//! Tunsocks lifecycle library
//!
//! Owns the worker thread that runs the `tunsocks-stack` scheduler and
//! exposes start/stop/status to the host, both as Rust ([`Engine`],
//! [`api`]) and as a C ABI ([`ffi`]).

pub mod api;
pub mod engine;
mod error;
pub mod ffi;
pub mod logging;

pub use engine::{Engine, EngineState};
pub use error::{codes, EngineError, Result};
pub use logging::{init_logging, recent_logs};
pub use tunsocks_stack::{EngineConfig, EngineConfigBuilder, StatsSnapshot};
