//! Tracing setup and an in-memory ring of recent log lines for the host UI

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Once;
use tracing_subscriber::layer::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MAX_RECENT_LOGS: usize = 2000;

static INIT: Once = Once::new();

static RECENT_LOGS: Lazy<Mutex<LogRing>> = Lazy::new(|| Mutex::new(LogRing::new(MAX_RECENT_LOGS)));

/// Bounded buffer of formatted log lines, oldest dropped first
pub struct LogRing {
    lines: VecDeque<String>,
    max_size: usize,
}

impl LogRing {
    pub fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size.min(256)),
            max_size,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// The last `count` lines; everything for 0
    pub fn last(&self, count: usize) -> Vec<String> {
        let skip = if count == 0 { 0 } else { self.lines.len().saturating_sub(count) };
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Install the global subscriber. `level` is the default directive for the
/// engine crates; `RUST_LOG` overrides it. Later calls are no-ops.
pub fn init_logging(level: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "warn,tunsocks_stack={level},tunsocks_lib={level}",
                level = level
            ))
        });

        #[cfg(target_os = "android")]
        let fmt_layer = fmt::layer().with_target(true).with_thread_names(true).without_time();

        #[cfg(not(target_os = "android"))]
        let fmt_layer = fmt::layer().with_target(true).compact();

        let result = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(RecentLogLayer)
            .try_init();

        if result.is_err() {
            push_line("[INFO] Tracing already initialized, using existing subscriber".to_string());
        } else {
            tracing::info!("Logging initialized at level {}", level);
        }
    });
}

/// Recent log lines, newest last; `count == 0` returns all of them
pub fn recent_logs(count: usize) -> Vec<String> {
    RECENT_LOGS.lock().last(count)
}

pub fn clear_logs() {
    RECENT_LOGS.lock().clear();
}

fn push_line(line: String) {
    RECENT_LOGS.lock().push(line);
}

/// Layer copying every event into the recent-log ring
pub(crate) struct RecentLogLayer;

impl<S> tracing_subscriber::Layer<S> for RecentLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with("tokio") {
            return;
        }

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        push_line(format!("[{}] [{}] {}", timestamp, metadata.level(), visitor.message));
    }
}

#[derive(Default)]
struct LogVisitor {
    message: String,
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = value.to_string();
        } else {
            self.message.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = format!("{:?}", value);
        } else {
            self.message.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest() {
        let mut ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(format!("line {}", i));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.last(0), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(ring.last(2), vec!["line 3", "line 4"]);
        assert_eq!(ring.last(10).len(), 3);

        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn layer_captures_events() {
        use tracing_subscriber::layer::SubscriberExt;

        let subscriber = tracing_subscriber::registry().with(RecentLogLayer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(flows = 3, "sweep done");
        });

        let logs = recent_logs(0);
        let line = logs
            .iter()
            .find(|l| l.contains("sweep done"))
            .expect("event captured");
        assert!(line.contains("[INFO]"));
        assert!(line.contains("flows=3"));
    }
}
