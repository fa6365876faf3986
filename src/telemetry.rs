// src/telemetry.rs
//
// CSV telemetry for policy runs.
//
// Columns are collected during the first row and frozen when it is written;
// later keys that were not in the header are dropped, and header keys missing
// from a row are left blank. Vectors expand to `key_0..key_n`. Floats are
// written with 4 decimals.
//
// The control thread never touches the file. It fills a `Row` snapshot and
// queues it to a `TelemetryWriter`, whose thread owns the `DataLogger`. The
// queue is bounded; when it is full the row is dropped and counted.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Local};
use crossbeam_channel::{Sender, TrySendError};
use thiserror::Error;

use crate::scheduler::OVERRUN_REPORT_EVERY;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry io error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("telemetry csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// `run_data_<YYYY-mm-dd_HH-MM-SS>.csv`
pub fn run_file_name(at: DateTime<Local>) -> String {
    format!("run_data_{}.csv", at.format("%Y-%m-%d_%H-%M-%S"))
}

pub struct DataLogger<W: Write = File> {
    writer: csv::Writer<W>,
    headers: Vec<String>,
    row: HashMap<String, String>,
    header_written: bool,
    rows: u64,
}

impl DataLogger<File> {
    /// Create `path`, including missing parent directories.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        let io_err = |e| TelemetryError::Io {
            path: path.display().to_string(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let file = File::create(path).map_err(io_err)?;
        Ok(Self::from_writer(file))
    }

    /// New timestamped file inside `dir`. Returns the logger and its path.
    pub fn create_in(dir: &Path) -> Result<(Self, PathBuf), TelemetryError> {
        let path = dir.join(run_file_name(Local::now()));
        let logger = Self::create(&path)?;
        Ok((logger, path))
    }
}

impl<W: Write> DataLogger<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new().flexible(false).from_writer(writer),
            headers: Vec::new(),
            row: HashMap::new(),
            header_written: false,
            rows: 0,
        }
    }

    fn insert(&mut self, key: String, value: String) {
        if !self.header_written && !self.headers.contains(&key) {
            self.headers.push(key.clone());
        }
        self.row.insert(key, value);
    }

    pub fn add_scalar(&mut self, key: &str, value: f64) {
        self.insert(key.to_string(), format!("{value:.4}"));
    }

    pub fn add_text(&mut self, key: &str, value: impl Into<String>) {
        self.insert(key.to_string(), value.into());
    }

    pub fn add_vector(&mut self, key: &str, values: &[f32]) {
        for (i, v) in values.iter().enumerate() {
            self.insert(format!("{key}_{i}"), format!("{v:.4}"));
        }
    }

    /// Emit the pending row (and the header, the first time).
    pub fn write(&mut self) -> Result<(), TelemetryError> {
        if !self.header_written {
            self.writer.write_record(&self.headers)?;
            self.header_written = true;
        }
        let row = std::mem::take(&mut self.row);
        let record = self
            .headers
            .iter()
            .map(|k| row.get(k).map(String::as_str).unwrap_or(""));
        self.writer.write_record(record)?;
        self.writer.flush().map_err(|e| TelemetryError::Io {
            path: "<telemetry>".to_string(),
            source: e,
        })?;
        self.rows += 1;
        Ok(())
    }

    /// Apply a queued snapshot and emit it.
    pub fn write_row(&mut self, row: Row) -> Result<(), TelemetryError> {
        for (key, field) in row.fields {
            match field {
                Field::Scalar(v) => self.add_scalar(key, v),
                Field::Text(v) => self.add_text(key, v),
                Field::Vector(v) => self.add_vector(key, &v),
            }
        }
        self.write()
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    pub fn into_inner(self) -> Option<W> {
        self.writer.into_inner().ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Scalar(f64),
    Text(String),
    Vector(Vec<f32>),
}

/// Ordered column values for one telemetry row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: Vec<(&'static str, Field)>,
}

impl Row {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            fields: Vec::with_capacity(n),
        }
    }

    pub fn scalar(&mut self, key: &'static str, value: f64) {
        self.fields.push((key, Field::Scalar(value)));
    }

    pub fn text(&mut self, key: &'static str, value: impl Into<String>) {
        self.fields.push((key, Field::Text(value.into())));
    }

    pub fn vector(&mut self, key: &'static str, values: impl Into<Vec<f32>>) {
        self.fields.push((key, Field::Vector(values.into())));
    }
}

/// Rows queued ahead of the writer thread before new ones are dropped.
pub const WRITER_QUEUE_CAPACITY: usize = 256;

/// Background thread owning a `DataLogger`.
///
/// `send` never blocks. The thread stops at the first write error; later
/// sends then report the writer as gone. Dropping the writer drains the
/// queue and joins the thread.
pub struct TelemetryWriter {
    name: String,
    tx: Option<Sender<Row>>,
    handle: Option<JoinHandle<u64>>,
    dropped: u64,
}

impl TelemetryWriter {
    pub fn spawn<W: Write + Send + 'static>(name: &str, mut logger: DataLogger<W>) -> Result<Self, TelemetryError> {
        let (tx, rx) = crossbeam_channel::bounded::<Row>(WRITER_QUEUE_CAPACITY);
        let label = name.to_string();
        let thread_name = format!("telemetry-{name}");
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for row in rx.iter() {
                    if let Err(e) = logger.write_row(row) {
                        log::warn!("[{label}] telemetry writer stopping after error: {e}");
                        break;
                    }
                }
                logger.rows_written()
            })
            .map_err(|e| TelemetryError::Io {
                path: thread_name,
                source: e,
            })?;
        Ok(Self {
            name: name.to_string(),
            tx: Some(tx),
            handle: Some(handle),
            dropped: 0,
        })
    }

    /// Queue a row. Returns false once the writer thread has gone away.
    pub fn send(&mut self, row: Row) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(row) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped == 1 || self.dropped % OVERRUN_REPORT_EVERY == 0 {
                    log::warn!("[{}] telemetry queue full; {} rows dropped", self.name, self.dropped);
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Close the queue, wait for pending rows and return how many were written.
    pub fn finish(&mut self) -> u64 {
        self.tx = None;
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(rows)) => rows,
            Some(Err(_)) => {
                log::error!("[{}] telemetry writer panicked", self.name);
                0
            }
            None => 0,
        }
    }
}

impl Drop for TelemetryWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(logger: DataLogger<Vec<u8>>) -> String {
        String::from_utf8(logger.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn header_frozen_after_first_row() {
        let mut log = DataLogger::from_writer(Vec::new());
        log.add_scalar("time", 0.5);
        log.add_vector("q", &[1.0, -2.0]);
        log.write().unwrap();

        log.add_vector("q", &[3.0, 4.0]);
        log.add_scalar("late", 1.0);
        log.write().unwrap();

        let text = contents(log);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "time,q_0,q_1");
        assert_eq!(lines[1], "0.5000,1.0000,-2.0000");
        assert_eq!(lines[2], ",3.0000,4.0000");
    }

    #[test]
    fn text_cells_are_kept_verbatim() {
        let mut log = DataLogger::from_writer(Vec::new());
        log.add_text("wall_time", "12:00:00.05");
        log.write().unwrap();
        assert_eq!(log.rows_written(), 1);
        assert!(contents(log).contains("12:00:00.05"));
    }

    #[derive(Clone, Default)]
    struct SharedBuf(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writer_thread_drains_rows_on_finish() {
        let buf = SharedBuf::default();
        let mut writer = TelemetryWriter::spawn("test", DataLogger::from_writer(buf.clone())).unwrap();
        for i in 0..3 {
            let mut row = Row::with_capacity(2);
            row.scalar("time", i as f64);
            row.vector("q", [1.0_f32, 2.0]);
            assert!(writer.send(row));
        }
        assert_eq!(writer.finish(), 3);
        assert!(!writer.send(Row::default()), "closed writer refuses rows");

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "time,q_0,q_1");
        assert_eq!(lines[3], "2.0000,1.0000,2.0000");
    }

    #[test]
    fn file_name_uses_timestamp() {
        let at = chrono::TimeZone::with_ymd_and_hms(&Local, 2025, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(run_file_name(at), "run_data_2025-03-04_05-06-07.csv");
    }

    #[test]
    fn create_makes_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut log, path) = DataLogger::create_in(&dir.path().join("logs")).unwrap();
        log.add_scalar("x", 1.0);
        log.write().unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text, "x\n1.0000\n");
    }
}
