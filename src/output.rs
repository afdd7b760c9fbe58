//! Per-line output sinks for remote commands.
//!
//! Each stream of a command gets its own list of handlers. Handlers are
//! invoked in registration order, one line at a time, in the order the agent
//! emitted the lines.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use colored::ColoredString;
use tokio::sync::watch;
use tracing::warn;

use crate::error::DistexpError;

pub trait OutputHandler: Send + 'static {
    fn on_line(&mut self, line: &str);
}

impl<F: FnMut(&str) + Send + 'static> OutputHandler for F {
    fn on_line(&mut self, line: &str) {
        self(line)
    }
}

/// Prints every line to stdout behind a colored server prefix.
pub struct Console {
    prefix: ColoredString,
}

impl Console {
    pub fn new(prefix: ColoredString) -> Self {
        Self { prefix }
    }
}

impl OutputHandler for Console {
    fn on_line(&mut self, line: &str) {
        // Without the lock, lines from different commands get mixed.
        let stdout = std::io::stdout();
        let mut guard = stdout.lock();
        if let Err(e) = writeln!(guard, "{} {}", self.prefix, line) {
            warn!("Failed to print output line: {}", e);
        }
    }
}

/// Writes every line to a local file.
pub struct FileSink {
    writer: BufWriter<File>,
    flush_each_line: bool,
}

impl FileSink {
    /// Appends to `path`, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Self, DistexpError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::from_file(file))
    }

    /// Starts `path` over from an empty file.
    pub fn truncate(path: impl AsRef<Path>) -> Result<Self, DistexpError> {
        Ok(Self::from_file(File::create(path.as_ref())?))
    }

    fn from_file(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
            flush_each_line: true,
        }
    }

    /// Whether to flush after every line. On by default; turning it off
    /// batches writes until the sink is dropped.
    pub fn flush_each_line(mut self, flush: bool) -> Self {
        self.flush_each_line = flush;
        self
    }
}

impl OutputHandler for FileSink {
    fn on_line(&mut self, line: &str) {
        let mut result = writeln!(self.writer, "{}", line);
        if self.flush_each_line {
            result = result.and_then(|_| self.writer.flush());
        }
        if let Err(e) = result {
            warn!("Failed to write output line: {}", e);
        }
    }
}

/// Keeps every line in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct Collector {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl OutputHandler for Collector {
    fn on_line(&mut self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Fires once when a line containing `needle` shows up.
///
/// Typical use is waiting for a server to print that it is ready before
/// starting the client.
pub struct SubstrMatcher {
    needle: String,
    matched: watch::Sender<bool>,
}

/// The waiting side of a [`SubstrMatcher`].
#[derive(Clone)]
pub struct Match(watch::Receiver<bool>);

impl SubstrMatcher {
    pub fn new(needle: impl Into<String>) -> (Self, Match) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                needle: needle.into(),
                matched: tx,
            },
            Match(rx),
        )
    }
}

impl OutputHandler for SubstrMatcher {
    fn on_line(&mut self, line: &str) {
        if !*self.matched.borrow() && line.contains(&self.needle) {
            self.matched.send_replace(true);
        }
    }
}

impl Match {
    pub fn matched(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits for the match. Returns `false` if the stream ended without one.
    pub async fn wait(&mut self) -> bool {
        let _ = self.0.wait_for(|matched| *matched).await;
        *self.0.borrow()
    }
}
