//! Process-wide `tracing` setup.
//!
//! Library crates only emit events. The binary calls [`init_logging`] once
//! and keeps the returned [`LogGuard`] alive for the life of the process so
//! buffered file output is flushed on exit.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Where and how log records are written.
#[derive(Debug, Clone)]
pub struct LogOptions<'a> {
    /// Fallback filter when `RUST_LOG` is unset, e.g. `"info"` or
    /// `"fb_td=debug,info"`.
    pub level: &'a str,
    /// Directory for daily-rotated log files. Console only when `None`.
    pub dir: Option<&'a str>,
    /// Log file prefix.
    pub file_prefix: &'a str,
    /// Emit one JSON object per line in the file instead of plain text.
    pub json_file: bool,
}

impl<'a> LogOptions<'a> {
    pub fn console(level: &'a str) -> Self {
        Self { level, dir: None, file_prefix: "fb", json_file: false }
    }
}

/// Flushes the file writer when dropped.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// A second call is ignored (the first subscriber stays installed).
pub fn init_logging(opts: &LogOptions<'_>) -> LogGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(opts.level));
    let console = fmt::layer().with_target(true).with_thread_ids(true);

    let Some(dir) = opts.dir else {
        let _ = tracing_subscriber::registry().with(filter).with(console).try_init();
        return LogGuard { _file: None };
    };

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, opts.file_prefix));
    let file = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
    let registry = tracing_subscriber::registry().with(filter).with(console);
    let _ = if opts.json_file {
        registry.with(file.json()).try_init()
    } else {
        registry.with(file).try_init()
    };
    LogGuard { _file: Some(guard) }
}
