//! Segmented recordings.
//!
//! A receiver gets one *record URL* per connection. Its first POST starts a
//! new file and is answered with a continuation URL; every later segment is
//! POSTed to the continuation URL until a segment arrives whose
//! `x-recording-state` is not `recording`, which closes the file.
//!
//! ```text
//! POST <prefix><record token>        (index 0) ─► {"url": "<prefix><continuation>"}
//! POST <prefix><continuation>        (index 1) ─► {"url": "<prefix><continuation>"}
//! POST <prefix><continuation> final  (index n) ─► {}
//! ```
//!
//! Index and offset mismatches are logged and the bytes are written anyway.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use super::{ChannelError, DestinationKey, ReceivedFiles};
use crate::ids::{create_id, short_id};

pub const HEADER_START_TIMESTAMP: &str = "x-recording-start-timestamp";
pub const HEADER_PACKET_OFFSET: &str = "x-recording-packet-offset";
pub const HEADER_PACKET_INDEX: &str = "x-recording-packet-index";
pub const HEADER_STATE: &str = "x-recording-state";

const EXTENSION: &str = "webm";

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("unknown recording token")]
    UnknownToken,
    #[error("missing or invalid header {0}")]
    InvalidHeader(&'static str),
    #[error("recording already finished")]
    Finished,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Metadata sent with every segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub start_timestamp: String,
    pub packet_offset: u64,
    pub packet_index: u64,
    pub final_chunk: bool,
}

impl SegmentHeader {
    /// Read the segment headers through `header(name)`.
    pub fn parse(header: impl Fn(&'static str) -> Option<String>) -> Result<Self, RecordingError> {
        let required = |name: &'static str| header(name).ok_or(RecordingError::InvalidHeader(name));
        let number = |name: &'static str| {
            required(name)?
                .trim()
                .parse::<u64>()
                .map_err(|_| RecordingError::InvalidHeader(name))
        };
        Ok(Self {
            start_timestamp: required(HEADER_START_TIMESTAMP)?,
            packet_offset: number(HEADER_PACKET_OFFSET)?,
            packet_index: number(HEADER_PACKET_INDEX)?,
            final_chunk: required(HEADER_STATE)? != "recording",
        })
    }

    /// File stem derived from the start timestamp, e.g. `20240102T030405678Z`.
    pub fn file_stem(&self) -> Result<String, RecordingError> {
        let raw = self.start_timestamp.trim();
        let start: DateTime<Utc> = match DateTime::parse_from_rfc3339(raw) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(_) => raw
                .parse::<i64>()
                .ok()
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .ok_or(RecordingError::InvalidHeader(HEADER_START_TIMESTAMP))?,
        };
        Ok(start.format("%Y%m%dT%H%M%S%3fZ").to_string())
    }
}

/// Answer to an ingested segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    Finished,
    Continue { token: String },
}

struct AllowedRecording {
    device_id: String,
    active: watch::Sender<usize>,
}

impl AllowedRecording {
    fn finish_one(&self) {
        self.active.send_modify(|active| *active = active.saturating_sub(1));
    }
}

struct SegmentState {
    file: Option<File>,
    packet_offset: u64,
    packet_index: u64,
}

struct StartedRecording {
    id: String,
    key: DestinationKey,
    path: PathBuf,
    allowed: Arc<AllowedRecording>,
    state: tokio::sync::Mutex<SegmentState>,
}

#[derive(Clone)]
enum Entry {
    Allowed(Arc<AllowedRecording>),
    Started(Arc<StartedRecording>),
}

/// Issues record URLs and writes the segments posted to them.
pub struct RecordingManager {
    root: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
    files: ReceivedFiles,
}

impl RecordingManager {
    pub fn new(root: impl Into<PathBuf>, files: ReceivedFiles) -> Self {
        Self {
            root: root.into(),
            entries: Mutex::new(HashMap::new()),
            files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allow recordings for `device_id`; returns the token of the record URL.
    pub fn create_record_url(&self, device_id: &str) -> String {
        let token = create_id();
        let (active, _) = watch::channel(0);
        self.entries.lock().insert(
            token.clone(),
            Entry::Allowed(Arc::new(AllowedRecording {
                device_id: device_id.to_string(),
                active,
            })),
        );
        token
    }

    /// Revoke a record URL and wait for the recordings it started to finish.
    ///
    /// Returns `false` when `token` is not a record URL.
    pub async fn delete_record_url(&self, token: &str) -> bool {
        let allowed = {
            let mut entries = self.entries.lock();
            match entries.get(token) {
                Some(Entry::Allowed(allowed)) => {
                    let allowed = allowed.clone();
                    entries.remove(token);
                    allowed
                }
                _ => return false,
            }
        };
        let mut active = allowed.active.subscribe();
        let pending = *active.borrow();
        if pending > 0 {
            log::info!("Waiting for {pending} recording(s) to finish");
        }
        let _ = active.wait_for(|active| *active == 0).await;
        true
    }

    /// Whether `token` is a live record URL or continuation.
    pub fn contains(&self, token: &str) -> bool {
        self.entries.lock().contains_key(token)
    }

    /// Number of files currently open for a record URL.
    pub fn active_recordings(&self, token: &str) -> Option<usize> {
        match self.entries.lock().get(token) {
            Some(Entry::Allowed(allowed)) => Some(*allowed.active.borrow()),
            _ => None,
        }
    }

    /// Write one segment posted to `token`.
    pub async fn ingest<S, E>(
        &self,
        token: &str,
        header: &SegmentHeader,
        body: S,
    ) -> Result<SegmentOutcome, RecordingError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let entry = self
            .entries
            .lock()
            .get(token)
            .cloned()
            .ok_or(RecordingError::UnknownToken)?;
        let recording = match entry {
            Entry::Allowed(allowed) => self.start(allowed, header).await?,
            Entry::Started(recording) => recording,
        };

        let mut state = recording.state.lock().await;
        let Some(mut file) = state.file.take() else {
            return Err(RecordingError::Finished);
        };
        if state.packet_index != header.packet_index {
            log::warn!(
                "Unexpected packet index {} (expected {}) for {}",
                header.packet_index,
                state.packet_index,
                recording.key
            );
        }
        if state.packet_offset != header.packet_offset {
            log::warn!(
                "Unexpected packet offset {} (expected {}) for {}",
                header.packet_offset,
                state.packet_offset,
                recording.key
            );
        }
        state.packet_index += 1;
        if header.final_chunk {
            self.entries.lock().remove(&recording.id);
            log::info!("Finishing recording of {}", recording.path.display());
        }

        let written = match write_body(&mut file, &recording.path, body).await {
            Ok(written) => written,
            Err(e) => {
                log::warn!("Recording of {} failed: {e}", recording.path.display());
                self.entries.lock().remove(&recording.id);
                self.files.close(&recording.key);
                recording.allowed.finish_one();
                return Err(e.into());
            }
        };
        state.packet_offset += written;

        if header.final_chunk {
            drop(file);
            self.files.update(&recording.key, state.packet_offset, false);
            recording.allowed.finish_one();
            Ok(SegmentOutcome::Finished)
        } else {
            state.file = Some(file);
            self.files.update(&recording.key, state.packet_offset, true);
            Ok(SegmentOutcome::Continue {
                token: recording.id.clone(),
            })
        }
    }

    async fn start(
        &self,
        allowed: Arc<AllowedRecording>,
        header: &SegmentHeader,
    ) -> Result<Arc<StartedRecording>, RecordingError> {
        let key = DestinationKey::new(
            short_id(&allowed.device_id),
            format!("{}.{EXTENSION}", header.file_stem()?),
        );
        let path = self.root.join(key.relative_path()?);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ChannelError::io(parent))?;
        }
        let file = File::create(&path).await.map_err(ChannelError::io(&path))?;
        log::info!("Starting recording of {}", path.display());

        let recording = Arc::new(StartedRecording {
            id: create_id(),
            key,
            path,
            allowed: allowed.clone(),
            state: tokio::sync::Mutex::new(SegmentState {
                file: Some(file),
                packet_offset: 0,
                packet_index: 0,
            }),
        });
        allowed.active.send_modify(|active| *active += 1);
        self.entries
            .lock()
            .insert(recording.id.clone(), Entry::Started(recording.clone()));
        self.files.update(&recording.key, 0, true);
        Ok(recording)
    }
}

async fn write_body<S, E>(file: &mut File, path: &Path, body: S) -> Result<u64, ChannelError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ChannelError::Body(e.to_string()))?;
        file.write_all(&chunk).await.map_err(ChannelError::io(path))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(ChannelError::io(path))?;
    Ok(written)
}
