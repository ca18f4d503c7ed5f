//! Append-only JSONL activity log.
//!
//! One object per line, `{"time": <RFC 3339>, "type": <event>, ...fields}`.
//! Entries are queued on an unbounded channel and appended by a writer task,
//! so recording never waits on the disk. Write failures are logged and
//! otherwise ignored: the activity log must never take a connection down.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Sink {
    entries: mpsc::UnboundedSender<String>,
    writer: JoinHandle<()>,
}

pub struct ActivityLog {
    sink: Option<Sink>,
}

impl ActivityLog {
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Open (or create) `path` for appending and record `app-start`.
    ///
    /// Must be called within a tokio runtime; the writer task is spawned on it.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (entries, queued) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_entries(
            path.to_path_buf(),
            File::from_std(file),
            queued,
        ));
        let log = Self {
            sink: Some(Sink { entries, writer }),
        };
        log.record("app-start", Value::Null);
        Ok(log)
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Queue one event. `fields` must be an object (or `null`).
    pub fn record(&self, kind: &str, fields: Value) {
        let Some(sink) = &self.sink else {
            return;
        };
        let mut entry = Map::new();
        entry.insert(
            "time".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        entry.insert("type".to_string(), Value::String(kind.to_string()));
        match fields {
            Value::Object(fields) => entry.extend(fields),
            Value::Null => {}
            other => {
                entry.insert("data".to_string(), other);
            }
        }
        let mut line = Value::Object(entry).to_string();
        line.push('\n');
        if sink.entries.send(line).is_err() {
            log::warn!("activity log writer is gone, dropping {kind} entry");
        }
    }

    /// Stop accepting entries and wait until every queued one is written.
    pub async fn close(self) {
        let Some(Sink { entries, writer }) = self.sink else {
            return;
        };
        drop(entries);
        if let Err(e) = writer.await {
            log::error!("activity log writer panicked: {e}");
        }
    }
}

async fn write_entries(path: PathBuf, mut file: File, mut entries: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = entries.recv().await {
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            log::warn!("cannot write activity log {}: {e}", path.display());
        }
    }
}
