use std::{path::PathBuf, sync::Once};

use snafu::{ResultExt, Whatever};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration for the service logging.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// A directory to create daily rolling log files in. No files are
    /// written when unspecified.
    pub dir:           Option<PathBuf>,
    /// The default filter directive (in the sense of
    /// [tracing_subscriber::filter::EnvFilter]). Will be overridden by the
    /// `RUST_LOG` environment variable if set.
    pub level:         String,
    /// Whether to duplicate logs to stdout in addition to the log directory.
    pub append_stdout: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            dir:           None,
            level:         DEFAULT_LOG_LEVEL.to_string(),
            append_stdout: true,
        }
    }
}

/// Installs the global subscriber.
///
/// The returned guards flush the non-blocking file writer on drop, keep them
/// alive until the process exits.
pub fn init_global_logging(
    app_name: &str,
    opts: &LoggingOptions,
) -> Result<Vec<WorkerGuard>, Whatever> {
    let mut guards = vec![];
    // Don't create the files or subscribers if we'll never emit any logs
    if create_env_filter(&opts.level).max_level_hint() == Some(LevelFilter::OFF) {
        return Ok(guards);
    }

    let stdout_layer = if opts.append_stdout {
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
            .with_filter(create_env_filter(&opts.level));
        Some(layer)
    } else {
        None
    };

    let file_layer = match &opts.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_whatever_context(|_| format!("failed to create log dir {:?}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, app_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(create_env_filter(&opts.level));
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .whatever_context("failed to install the global tracing subscriber")?;

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing_panic_hook(info);
        prev_hook(info);
    }));
    tracing::info!(app = app_name, "logging started");
    Ok(guards)
}

/// Used by tests, installs a stdout subscriber once per process.
pub fn install_fmt_log() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(create_env_filter("debug"))
            .with_test_writer()
            .try_init();
    });
}

/// [EnvFilter] isn't [Clone], so each [Layer] builds its own.
fn create_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Logs the panic through tracing so it lands in the log files too.
fn tracing_panic_hook(info: &std::panic::PanicInfo) {
    let msg = match info.payload().downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match info.payload().downcast_ref::<String>() {
            Some(s) => &s[..],
            None => "Box<dyn Any>",
        },
    };
    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_default();
    let backtrace = std::backtrace::Backtrace::capture();

    if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
        tracing::error!(%thread, %location, "{msg}\n\nStack backtrace:\n{backtrace}");
    } else {
        tracing::error!(%thread, %location, "{msg}");
    }
}
