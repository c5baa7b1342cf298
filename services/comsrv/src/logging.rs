//! Logging setup
//!
//! Console output uses a bracketed level format, `timestamp [LEVEL] message`.
//! An optional daily rolling file receives the same events without colors.
//! `RUST_LOG` overrides the configured level.

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;
use crate::error::{ComSrvError, Result};

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// `2026-03-02T00:50:44.809123Z [INFO] Ch1 started (modbus_tcp)`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter from `RUST_LOG`, falling back to the given level
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
            .map_err(|e| ComSrvError::config(format!("invalid RUST_LOG: {}", e))),
        _ => EnvFilter::try_new(level)
            .map_err(|e| ComSrvError::config(format!("invalid log level '{}': {}", level, e))),
    }
}

/// Install the global subscriber
///
/// `level_override` (from the command line) wins over the configured level.
/// The returned guard flushes the file writer and must live until exit.
pub fn init_logging(config: &LoggingConfig, level_override: Option<&str>) -> Result<Option<WorkerGuard>> {
    let level = level_override.unwrap_or(&config.level);
    let filter = build_filter(level)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if config.console {
        layers.push(if config.json {
            fmt::layer().json().with_target(false).boxed()
        } else {
            fmt::layer().event_format(BracketedLevelFormat).boxed()
        });
    }

    let guard = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.file_prefix));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(if config.json {
                fmt::layer().json().with_writer(writer).with_ansi(false).boxed()
            } else {
                fmt::layer()
                    .event_format(BracketedLevelFormat)
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed()
            });
            Some(guard)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| ComSrvError::internal(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}
