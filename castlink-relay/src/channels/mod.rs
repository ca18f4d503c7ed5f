//! Resumable byte channels into the recordings folder.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  grant(key, offset)  ┌────────────────┐   PUT <prefix><token>
//! │ admin RPC   │ ───────────────────► │ ChannelManager │ ◄──────────────────── emitter
//! └─────────────┘       token          └───────┬────────┘
//!                                              │ per-key file lock
//! ┌─────────────┐  create_record_url   ┌───────┴──────────┐ POST <prefix><token>
//! │ receiver    │ ───────────────────► │ RecordingManager │ ◄─────────────────── receiver
//! │ connect     │       token          └───────┬──────────┘
//! └─────────────┘                              ▼
//!                     <recordings_folder>/<owner short id>/<file name>
//!                                              │
//!                                              ▼
//!                               ReceivedFiles {"owner/file": {size, open}}
//! ```
//!
//! | Channel   | Token lifetime                          | Resume point          |
//! |-----------|-----------------------------------------|-----------------------|
//! | Upload    | one request, superseded by a new grant  | `start_offset` bytes  |
//! | Recording | one segment, each answer mints the next | continuation token    |

pub mod recording;
pub mod uploads;

pub use recording::{RecordingError, RecordingManager, SegmentHeader, SegmentOutcome};
pub use uploads::{ChannelManager, GrantState};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::signal::Invalidation;

/// Upload channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unknown or already used channel token")]
    UnknownGrant,
    #[error("grant for {0} was superseded or cancelled")]
    Superseded(String),
    #[error("{key} holds {len} bytes, cannot resume at offset {offset}")]
    OffsetBeyondEnd { key: String, len: u64, offset: u64 },
    #[error("invalid destination name {0:?}")]
    InvalidName(String),
    #[error("request body failed: {0}")]
    Body(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ChannelError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ChannelError::Io { path, source }
    }
}

/// Where a channel writes: an owner folder and a file name inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationKey {
    pub owner: String,
    pub file_name: String,
}

impl DestinationKey {
    pub fn new(owner: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            file_name: file_name.into(),
        }
    }

    /// Path relative to the recordings folder; rejects anything that could
    /// escape the owner's folder.
    pub fn relative_path(&self) -> Result<PathBuf, ChannelError> {
        for part in [&self.owner, &self.file_name] {
            let unsafe_name = part.is_empty()
                || part == "."
                || part == ".."
                || part.contains(['/', '\\', '\0']);
            if unsafe_name {
                return Err(ChannelError::InvalidName(part.clone()));
            }
        }
        Ok(PathBuf::from(&self.owner).join(&self.file_name))
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.file_name)
    }
}

/// Progress of one destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReceivedFileInfo {
    pub size: u64,
    pub open: bool,
}

/// Shared view of every file written through a channel, keyed `owner/file`.
#[derive(Clone)]
pub struct ReceivedFiles {
    files: Arc<Mutex<BTreeMap<String, ReceivedFileInfo>>>,
    changes: Invalidation,
}

impl ReceivedFiles {
    pub fn new(changes: Invalidation) -> Self {
        Self {
            files: Arc::new(Mutex::new(BTreeMap::new())),
            changes,
        }
    }

    pub fn update(&self, key: &DestinationKey, size: u64, open: bool) {
        let info = ReceivedFileInfo { size, open };
        let changed = self.files.lock().insert(key.to_string(), info) != Some(info);
        if changed {
            self.changes.bump();
        }
    }

    /// Mark `key` closed, keeping its last known size.
    pub fn close(&self, key: &DestinationKey) {
        let changed = {
            let mut files = self.files.lock();
            match files.get_mut(&key.to_string()) {
                Some(info) if info.open => {
                    info.open = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.changes.bump();
        }
    }

    pub fn forget(&self, key: &DestinationKey) {
        if self.files.lock().remove(&key.to_string()).is_some() {
            self.changes.bump();
        }
    }

    pub fn get(&self, key: &DestinationKey) -> Option<ReceivedFileInfo> {
        self.files.lock().get(&key.to_string()).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ReceivedFileInfo> {
        self.files.lock().clone()
    }
}
