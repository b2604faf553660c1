//! Tracing setup with independent terminal and file layers.
//!
//! Terminal filter: `--debug` > `--verbose` > `RUST_LOG` > `warn`.
//! File filter: `logging.file_level` (default `debug`), always independent
//! of the terminal one.
//!
//! The file layer writes through [`LogFile`], which buffers each event and
//! appends it under a lock in one write, so lines from concurrent tasks
//! never interleave.

use mia_runtime::config::LoggingConfig;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// File name inside the log directory.
pub const LOG_FILE_NAME: &str = "launcher.log";

/// HTTP and WebSocket internals are held at `warn` on the terminal too.
const QUIET_DEPS: &str = "hyper=warn,h2=warn,reqwest=warn,rustls=warn,tungstenite=warn,axum=warn";

/// Installs the global subscriber.
///
/// Returns the log file path when file logging is active. A log file that
/// cannot be opened is reported on stderr and skipped.
pub fn init(debug: bool, verbose: bool, logging: &LoggingConfig) -> Option<PathBuf> {
    let terminal_layer = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(terminal_filter(debug, verbose));

    let log_file = if logging.file {
        open_log_file(&logging.resolved_file_path())
    } else {
        None
    };

    match log_file {
        Some((path, file)) => {
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(file)
                .with_filter(EnvFilter::new(logging.file_filter_directive()));

            tracing_subscriber::registry()
                .with(terminal_layer)
                .with(file_layer)
                .init();
            Some(path)
        }
        None => {
            tracing_subscriber::registry().with(terminal_layer).init();
            None
        }
    }
}

fn terminal_filter(debug: bool, verbose: bool) -> EnvFilter {
    if debug {
        EnvFilter::new(format!("debug,{QUIET_DEPS}"))
    } else if verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    }
}

/// Opens `<log_dir>/launcher.log` in append mode, creating the directory.
fn open_log_file(log_dir: &Path) -> Option<(PathBuf, LogFile)> {
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Warning: cannot create log directory {}: {e}",
            log_dir.display()
        );
        return None;
    }

    let path = log_dir.join(LOG_FILE_NAME);
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        Ok(file) => Some((path, LogFile::new(file))),
        Err(e) => {
            eprintln!("Warning: cannot open log file {}: {e}", path.display());
            None
        }
    }
}

/// [`MakeWriter`](tracing_subscriber::fmt::MakeWriter) appending to the
/// shared log file.
#[derive(Clone)]
pub struct LogFile {
    file: Arc<Mutex<File>>,
}

impl LogFile {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl<'a> fmt::MakeWriter<'a> for LogFile {
    type Writer = LogLine;

    fn make_writer(&'a self) -> Self::Writer {
        LogLine {
            file: Arc::clone(&self.file),
            buf: Vec::with_capacity(256),
        }
    }
}

/// One formatted event, flushed to the file on drop.
pub struct LogLine {
    file: Arc<Mutex<File>>,
    buf: Vec<u8>,
}

impl Write for LogLine {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogLine {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let mut file = self.file.lock();
        // Nowhere left to report a failed log write.
        let _ = file.write_all(&self.buf);
        let _ = file.flush();
    }
}
