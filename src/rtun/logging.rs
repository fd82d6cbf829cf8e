use std::{io, path::PathBuf, str::FromStr};

use anyhow::Context;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::rtun::config;

/// Keeps the non-blocking writer flushing; drop it only at process exit.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("logging: unknown format {other:?} (expected text or json)"),
        }
    }
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    /// Appended to, never rotated.
    File(PathBuf),
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            "discard" => LogOutput::Discard,
            path => LogOutput::File(PathBuf::from(path)),
        })
    }
}

impl LogOutput {
    fn open(&self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        let pair = match self {
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Discard => tracing_appender::non_blocking(io::sink()),
            LogOutput::File(path) => {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("logging: no file name in {}", path.display()))?;
                let dir = match path.parent() {
                    Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("logging: mkdir {}", dir.display()))?;
                let appender = RollingFileAppender::builder()
                    .rotation(Rotation::NEVER)
                    .filename_prefix(name)
                    .build(&dir)
                    .with_context(|| format!("logging: open {}", path.display()))?;
                tracing_appender::non_blocking(appender)
            }
        };
        Ok(pair)
    }
}

/// Level names accepted in config; anything unknown logs at `info`.
fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// `RUST_LOG` wins over the configured level.
fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level_directive(level)).context("logging: init filter"),
    }
}

pub fn init(logging: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let format: LogFormat = logging.format.parse()?;
    let output: LogOutput = logging.output.parse()?;
    let filter = build_filter(&logging.level)?;
    let (writer, guard) = output.open()?;
    let ansi =
        format == LogFormat::Text && matches!(output, LogOutput::Stderr | LogOutput::Stdout);

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let layer = match format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive(" warning "), "warn");
        assert_eq!(level_directive("verbose"), "info");
    }

    #[test]
    fn formats_and_outputs_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Text);
        let err = "logfmt".parse::<LogFormat>().unwrap_err();
        assert!(err.to_string().contains("logfmt"));

        assert_eq!(" stdout ".parse::<LogOutput>().unwrap(), LogOutput::Stdout);
        assert_eq!("".parse::<LogOutput>().unwrap(), LogOutput::Stderr);
        assert_eq!(
            "/var/log/rtun.log".parse::<LogOutput>().unwrap(),
            LogOutput::File(PathBuf::from("/var/log/rtun.log"))
        );
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("rtun_log_test_{}", std::process::id()));
        let path = dir.join("nested").join("rtun.log");
        let (_w, _guard) = LogOutput::File(path.clone()).open().expect("writer");
        assert!(path.is_file());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
