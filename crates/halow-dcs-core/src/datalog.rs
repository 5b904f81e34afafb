//! Data-log sinks: append-only trace files, one per subsystem per run.
//!
//! Every run creates one timestamped directory under the configured root;
//! each subsystem (the DCS CSV, backend Tx/Rx traces) writes its own
//! `<name>.log` inside it. Sinks are opt-in per name through
//! [`DatalogConfig`](crate::config::DatalogConfig); a disabled sink is a
//! no-op object, so writers never branch on configuration.
//!
//! Failure to create a sink degrades to the no-op sink with a warning;
//! logging must never take the controller down.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::DatalogConfig;
use crate::time::run_dir_stamp;

/// A line-oriented append-only log sink.
pub trait LogSink: Send + Sync {
    /// Appends one line (the newline is added by the sink).
    fn write_line(&self, line: &str);

    /// `false` for the no-op sink, letting callers skip building expensive
    /// lines.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Sink that discards everything. Stands in for disabled or failed sinks.
pub struct NullSink;

impl LogSink for NullSink {
    fn write_line(&self, _line: &str) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Sink appending to a file, flushed per line so logs survive a crash.
pub struct FileSink {
    file: Mutex<File>,
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) {
        let mut file = self.file.lock();
        if writeln!(file, "{line}").and_then(|()| file.flush()).is_err() {
            warn!("data-log write failed");
        }
    }
}

/// Creates sinks inside this run's timestamped directory.
pub struct DataLogFactory {
    config: DatalogConfig,
    run_dir: PathBuf,
}

impl DataLogFactory {
    /// Binds a factory to its configuration. The run directory name is
    /// fixed here; nothing is created on disk until an enabled sink is
    /// requested.
    pub fn new(config: &DatalogConfig) -> Self {
        let run_dir = config.root_dir.join(run_dir_stamp(Utc::now()));
        Self {
            config: config.clone(),
            run_dir,
        }
    }

    /// Returns the sink for `name`: a file sink writing
    /// `<run_dir>/<name>.log` when enabled, the no-op sink otherwise.
    pub fn create(&self, name: &str) -> Arc<dyn LogSink> {
        if !self.config.sink_enabled(name) {
            return Arc::new(NullSink);
        }

        if let Err(err) = fs::create_dir_all(&self.run_dir) {
            warn!(dir = %self.run_dir.display(), %err, "cannot create data-log directory");
            return Arc::new(NullSink);
        }

        let path = self.run_dir.join(format!("{name}.log"));
        match File::create(&path) {
            Ok(file) => Arc::new(FileSink {
                file: Mutex::new(file),
            }),
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot open data-log file");
                Arc::new(NullSink)
            }
        }
    }

    /// The directory this run's sinks write into.
    pub fn run_dir(&self) -> &PathBuf {
        &self.run_dir
    }
}
