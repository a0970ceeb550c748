//! Tracing subscriber setup

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;
use crate::error::{GateError, Result};

/// Log sink shared by every layer.
///
/// Each event is formatted and written while the lock is held, so lines
/// from concurrent connections never interleave.
#[derive(Clone)]
pub struct SerializedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SerializedWriter {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Append to `path`, creating it and its parent directories
    pub fn file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| GateError::from_write(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| GateError::from_write(path, e))?;
        Ok(Self::new(Box::new(file)))
    }

    fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }
}

pub struct SerializedGuard<'a>(MutexGuard<'a, Box<dyn Write + Send>>);

impl Write for SerializedGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for SerializedWriter {
    type Writer = SerializedGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SerializedGuard(self.inner.lock())
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));

    let writer = match config.file.as_deref() {
        Some(path) => SerializedWriter::file(path)?,
        None => SerializedWriter::stdout(),
    };
    let ansi = config.file.is_none();

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(ansi)
                    .with_writer(writer),
            )
            .try_init()
    };

    installed.map_err(|e| GateError::Internal(format!("failed to install logger: {}", e)))
}

/// Filter used when `RUST_LOG` is unset
pub fn default_directive(config: &LogConfig) -> String {
    let level = if config.verbose {
        "debug"
    } else {
        match config.level.to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        }
    };
    format!("frontgate={},tokio_socks=warn", level)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_config(level: &str, verbose: bool) -> LogConfig {
        LogConfig {
            level: level.to_string(),
            format: "pretty".to_string(),
            verbose,
            file: None,
        }
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(
            default_directive(&log_config("info", false)),
            "frontgate=info,tokio_socks=warn"
        );
        assert_eq!(
            default_directive(&log_config("WARN", false)),
            "frontgate=warn,tokio_socks=warn"
        );
    }

    #[test]
    fn test_verbose_lowers_level() {
        assert_eq!(
            default_directive(&log_config("error", true)),
            "frontgate=debug,tokio_socks=warn"
        );
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        assert_eq!(
            default_directive(&log_config("loud", false)),
            "frontgate=info,tokio_socks=warn"
        );
    }

    #[test]
    fn test_file_writer_appends_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/frontgate.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "earlier\n").unwrap();

        let writer = SerializedWriter::file(&path).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let writer = writer.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let mut guard = writer.make_writer();
                        guard.write_all(format!("line-{}\n", i).as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 201);
        assert_eq!(lines[0], "earlier");
        assert!(lines[1..].iter().all(|l| l.starts_with("line-") && l.len() == 6));
    }

    #[test]
    fn test_file_writer_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs/frontgate.log");

        SerializedWriter::file(&path).unwrap();
        assert!(path.exists());
    }
}
