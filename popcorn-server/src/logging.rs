//! Logging setup with a SIGHUP-reopenable log file

use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// Log severity levels understood by the server and client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Everything from informational messages up
    Info,
    /// Warnings and errors only
    Warning,
    /// Errors only
    Error,
}

impl Severity {
    /// Maximum tracing level for this severity
    pub fn max_level(self) -> Level {
        match self {
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("Unknown log severity: {other}")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("INFO"),
            Self::Warning => f.write_str("WARNING"),
            Self::Error => f.write_str("ERROR"),
        }
    }
}

fn open_log_file(path: &PathBuf) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Log destination that can reopen its file on demand, so log rotation
/// works with a plain SIGHUP
#[derive(Clone)]
pub struct LogWriter {
    path: Option<PathBuf>,
    file: Arc<Mutex<Option<File>>>,
}

impl LogWriter {
    /// Writer for `path`, or stdout when no path is given
    pub fn new(path: Option<PathBuf>) -> io::Result<Self> {
        let file = match &path {
            Some(p) => Some(open_log_file(p)?),
            None => None,
        };
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Reopen the log file (after rotation moved the old one away)
    pub fn reopen(&self) -> io::Result<()> {
        if let Some(path) = &self.path {
            *self.file.lock() = Some(open_log_file(path)?);
        }
        Ok(())
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock().as_mut() {
            Some(file) => file.write(buf),
            None => io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock().as_mut() {
            Some(file) => file.flush(),
            None => io::stdout().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber and return the writer handle for reopening
pub fn init(filename: Option<PathBuf>, severity: Severity) -> io::Result<LogWriter> {
    let writer = LogWriter::new(filename)?;
    let with_file = writer.path.is_some();
    tracing_subscriber::fmt()
        .with_max_level(severity.max_level())
        .with_ansi(!with_file)
        .with_target(false)
        .with_writer(writer.clone())
        .init();
    Ok(writer)
}
