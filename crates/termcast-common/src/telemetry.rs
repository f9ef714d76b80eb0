#![expect(clippy::print_stderr, reason = "Tracing not initialized yet")]

//! Process-wide `tracing` setup for the termcast binary.
//!
//! `RUST_LOG` selects levels. `TERMCAST_LOG` sends output to a file through
//! a non-blocking appender instead of stderr, and `TERMCAST_LOG_FORMAT=json`
//! switches to one JSON object per event.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_FILE_ENV: &str = "TERMCAST_LOG";
const LOG_FORMAT_ENV: &str = "TERMCAST_LOG_FORMAT";

/// Keeps the non-blocking log writer alive; drop it only at process exit.
#[derive(Debug)]
#[must_use = "dropping the guard stops file logging"]
pub struct TelemetryGuard {
    _guard: Option<WorkerGuard>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TelemetrySettings {
    file: Option<PathBuf>,
    format: LogFormat,
}

impl TelemetrySettings {
    fn from_env() -> Self {
        Self::parse(
            std::env::var(LOG_FILE_ENV).ok().as_deref(),
            std::env::var(LOG_FORMAT_ENV).ok().as_deref(),
        )
    }

    fn parse(file: Option<&str>, format: Option<&str>) -> Self {
        let file = file
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let format = match format.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        Self { file, format }
    }
}

/// Installs the global subscriber. A second call leaves the first
/// subscriber in place and returns an inert guard.
pub fn init_tracing(default_level: &str) -> TelemetryGuard {
    let settings = TelemetrySettings::from_env();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (writer, guard, ansi) = open_writer(&settings);

    let layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_thread_ids(true)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    };

    match tracing_subscriber::registry().with(filter).with(layer).try_init() {
        Ok(()) => TelemetryGuard { _guard: guard },
        Err(_) => TelemetryGuard { _guard: None },
    }
}

fn open_writer(settings: &TelemetrySettings) -> (BoxMakeWriter, Option<WorkerGuard>, bool) {
    let stderr = || {
        (
            BoxMakeWriter::new(std::io::stderr),
            None,
            std::io::stderr().is_terminal(),
        )
    };
    let Some(path) = &settings.file else {
        return stderr();
    };
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        Err(err) => {
            eprintln!(
                "termcast: cannot open log file {} ({}); logging to stderr",
                path.display(),
                err
            );
            stderr()
        }
    }
}
