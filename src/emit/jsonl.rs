use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

use super::{RecordWriter, SubmissionRecord};

/// Line emitted for each newly interned marker label, so the stream is
/// self-describing.
#[derive(Debug, Serialize)]
struct InternedString<'a> {
    string_key: u64,
    text: &'a str,
}

struct Inner {
    writer: BufWriter<File>,
    interned: HashMap<String, u64>,
    write_errors: u64,
}

/// Newline-delimited JSON record sink.
///
/// Stands in for the profiler transport: each submission record is one
/// line, preceded by a string-table line the first time a marker label is
/// seen. Write failures are logged and counted, never propagated into the
/// capture path.
pub struct JsonlWriter {
    inner: Mutex<Inner>,
}

impl JsonlWriter {
    /// Create or truncate the output file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating record output {}", path.display()))?;
        Ok(Self {
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                interned: HashMap::new(),
                write_errors: 0,
            }),
        })
    }

    /// Flush buffered records to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner
            .lock()
            .writer
            .flush()
            .context("flushing record output")
    }

    /// Write failures observed so far.
    pub fn write_errors(&self) -> u64 {
        self.inner.lock().write_errors
    }

    fn write_line<T: Serialize>(inner: &mut Inner, value: &T) {
        let result = serde_json::to_writer(&mut inner.writer, value)
            .map_err(anyhow::Error::from)
            .and_then(|()| inner.writer.write_all(b"\n").map_err(anyhow::Error::from));

        if let Err(e) = result {
            inner.write_errors += 1;
            if inner.write_errors == 1 {
                error!(error = %e, "record write failed");
            }
        }
    }
}

impl RecordWriter for JsonlWriter {
    fn intern_string(&self, text: &str) -> u64 {
        let mut inner = self.inner.lock();
        if let Some(&key) = inner.interned.get(text) {
            return key;
        }
        let key = inner.interned.len() as u64;
        inner.interned.insert(text.to_string(), key);
        Self::write_line(
            &mut inner,
            &InternedString {
                string_key: key,
                text,
            },
        );
        key
    }

    fn write(&self, record: SubmissionRecord) {
        let mut inner = self.inner.lock();
        Self::write_line(&mut inner, &record);
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CommandBufferTiming, SubmitTiming};
    use super::*;

    fn sample_record() -> SubmissionRecord {
        SubmissionRecord {
            meta: SubmitTiming {
                thread_id: 42,
                pre_submit_cpu_ns: 1_000,
                post_submit_cpu_ns: Some(2_000),
            },
            gpu_cpu_offset_ns: -300,
            command_buffers: vec![CommandBufferTiming {
                begin_gpu_ns: 10_000,
                end_gpu_ns: 30_000,
            }],
            markers: Vec::new(),
            num_begin_markers: 0,
        }
    }

    #[test]
    fn test_intern_returns_stable_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = JsonlWriter::create(&dir.path().join("records.jsonl")).expect("create");

        assert_eq!(writer.intern_string("a"), 0);
        assert_eq!(writer.intern_string("b"), 1);
        assert_eq!(writer.intern_string("a"), 0);
        assert_eq!(writer.write_errors(), 0);
    }

    #[test]
    fn test_records_written_one_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.jsonl");
        let writer = JsonlWriter::create(&path).expect("create");

        writer.intern_string("draw");
        writer.write(sample_record());
        writer.write(sample_record());
        writer.flush().expect("flush");

        let contents = std::fs::read_to_string(&path).expect("read back");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"text\":\"draw\""));
        assert!(lines[1].contains("\"begin_gpu_ns\":10000"));

        let parsed: serde_json::Value = serde_json::from_str(lines[1]).expect("valid json");
        assert_eq!(parsed["meta"]["thread_id"], 42);
        assert_eq!(parsed["gpu_cpu_offset_ns"], -300);
    }
}
