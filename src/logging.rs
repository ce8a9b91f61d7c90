//! # Diagnostics Setup
//!
//! Layered tracing initialisation for the operator binaries: a colored,
//! metadata-free console formatter on stderr, plus an optional
//! daily-rolling file with full detail.

use colored::Colorize;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Console formatter: a colored level tag in front of the bare message,
/// no timestamps or targets.
pub struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let tag = match *event.metadata().level() {
            Level::ERROR => "error".red().bold(),
            Level::WARN => "warn".yellow().bold(),
            Level::INFO => "info".green(),
            Level::DEBUG => "debug".blue(),
            Level::TRACE => "trace".purple(),
        };
        write!(writer, "[{tag}] ")?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initialise the global subscriber.
///
/// `verbosity` 0 is info, 1 debug, 2+ trace. `quiet` drops the console
/// layer entirely. When `log_file` is given, full-detail diagnostics are
/// appended to a daily-rolling file next to it; the returned guard must
/// stay alive for the file writer to keep flushing.
pub fn init(
    verbosity: u8,
    quiet: bool,
    log_file: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("logrelay.log"));
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = if quiet {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .event_format(ConsoleFormatter)
                .with_filter(level),
        )
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();
    guard
}
