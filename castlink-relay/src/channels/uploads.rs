//! Resumable uploads.
//!
//! A grant binds an unguessable token to a destination and a start offset.
//! The emitter then PUTs the remaining bytes to `<record_prefix><token>`.
//! Minting a new grant for the same destination cancels the previous one; a
//! request still streaming under the old grant stops at its next chunk and
//! fails with [`ChannelError::Superseded`].
//!
//! Writers of one destination are serialized by a per-key lock, so the
//! superseding request only opens the file after the superseded one has
//! released it.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{ChannelError, DestinationKey, ReceivedFiles};
use crate::ids::create_id;

/// Lifecycle of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantState {
    Granted,
    Active,
    Closed,
}

struct Grant {
    key: DestinationKey,
    start_offset: u64,
    state: GrantState,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Grants {
    by_token: HashMap<String, Grant>,
    by_key: HashMap<DestinationKey, String>,
    file_locks: HashMap<DestinationKey, Arc<tokio::sync::Mutex<()>>>,
}

impl Grants {
    fn close_key(&mut self, key: &DestinationKey) -> bool {
        let Some(token) = self.by_key.remove(key) else {
            return false;
        };
        let Some(grant) = self.by_token.get_mut(&token) else {
            return true;
        };
        grant.cancel.cancel();
        // An active grant stays registered until its request finishes.
        if grant.state == GrantState::Active {
            grant.state = GrantState::Closed;
        } else {
            self.by_token.remove(&token);
        }
        true
    }
}

/// Issues and serves upload grants.
pub struct ChannelManager {
    root: PathBuf,
    grants: Mutex<Grants>,
    files: ReceivedFiles,
}

impl ChannelManager {
    pub fn new(root: impl Into<PathBuf>, files: ReceivedFiles) -> Self {
        Self {
            root: root.into(),
            grants: Mutex::new(Grants::default()),
            files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &ReceivedFiles {
        &self.files
    }

    /// Mint a grant for `key`, cancelling any open grant for it.
    pub fn grant(&self, key: DestinationKey, start_offset: u64) -> String {
        let token = create_id();
        let mut grants = self.grants.lock();
        if grants.close_key(&key) {
            log::info!("Upload grant for {key} superseded");
        }
        grants.by_key.insert(key.clone(), token.clone());
        log::info!("Upload grant for {key} from byte {start_offset}");
        grants.by_token.insert(
            token.clone(),
            Grant {
                key,
                start_offset,
                state: GrantState::Granted,
                cancel: CancellationToken::new(),
            },
        );
        token
    }

    /// Close the open grant for `key`, stopping a request served under it.
    pub fn cancel(&self, key: &DestinationKey) -> bool {
        let cancelled = self.grants.lock().close_key(key);
        if cancelled {
            log::info!("Upload grant for {key} cancelled");
        }
        cancelled
    }

    /// Cancel every grant owned by `owner`.
    pub fn cancel_owner(&self, owner: &str) -> usize {
        let mut grants = self.grants.lock();
        let keys: Vec<DestinationKey> = grants
            .by_key
            .keys()
            .filter(|key| key.owner == owner)
            .cloned()
            .collect();
        for key in &keys {
            grants.close_key(key);
        }
        if !keys.is_empty() {
            log::info!("Released {} upload grant(s) of {owner}", keys.len());
        }
        keys.len()
    }

    pub fn grant_state(&self, token: &str) -> GrantState {
        self.grants
            .lock()
            .by_token
            .get(token)
            .map_or(GrantState::Closed, |grant| grant.state)
    }

    /// Stream `body` into the destination of `token`; returns bytes written.
    pub async fn consume<S, E>(&self, token: &str, body: S) -> Result<u64, ChannelError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let (key, offset, cancel, file_lock) = {
            let mut grants = self.grants.lock();
            let grant = grants
                .by_token
                .get_mut(token)
                .filter(|grant| grant.state == GrantState::Granted)
                .ok_or(ChannelError::UnknownGrant)?;
            grant.state = GrantState::Active;
            let (key, offset, cancel) = (grant.key.clone(), grant.start_offset, grant.cancel.clone());
            let lock = grants.file_locks.entry(key.clone()).or_default().clone();
            (key, offset, cancel, lock)
        };

        let outcome = self.write(&key, offset, &cancel, &file_lock, body).await;

        {
            let mut grants = self.grants.lock();
            grants.by_token.remove(token);
            if grants.by_key.get(&key).map(String::as_str) == Some(token) {
                grants.by_key.remove(&key);
            }
            if !grants.by_key.contains_key(&key) && Arc::strong_count(&file_lock) <= 2 {
                grants.file_locks.remove(&key);
            }
        }

        match &outcome {
            Ok(written) => log::info!("Upload of {key} finished, {written} bytes received"),
            Err(e) => log::warn!("Upload of {key} stopped: {e}"),
        }
        outcome
    }

    async fn write<S, E>(
        &self,
        key: &DestinationKey,
        offset: u64,
        cancel: &CancellationToken,
        file_lock: &tokio::sync::Mutex<()>,
        body: S,
    ) -> Result<u64, ChannelError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let _guard = tokio::select! {
            guard = file_lock.lock() => guard,
            _ = cancel.cancelled() => return Err(ChannelError::Superseded(key.to_string())),
        };
        if cancel.is_cancelled() {
            return Err(ChannelError::Superseded(key.to_string()));
        }
        // Only the holder of the file lock marks the key open or closed, so a
        // superseding writer's entry is never closed behind its back.
        let outcome = self.write_locked(key, offset, cancel, body).await;
        self.files.close(key);
        outcome
    }

    async fn write_locked<S, E>(
        &self,
        key: &DestinationKey,
        offset: u64,
        cancel: &CancellationToken,
        body: S,
    ) -> Result<u64, ChannelError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let path = self.root.join(key.relative_path()?);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ChannelError::io(parent))?;
        }
        let mut file = open_at(&path, key, offset).await?;
        let mut size = offset;
        self.files.update(key, size, true);

        let mut body = std::pin::pin!(body);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChannelError::Superseded(key.to_string())),
                next = body.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(ChannelError::Body(e.to_string())),
            };
            file.write_all(&chunk).await.map_err(ChannelError::io(&path))?;
            size += chunk.len() as u64;
            self.files.update(key, size, true);
        }
        file.flush().await.map_err(ChannelError::io(&path))?;
        Ok(size - offset)
    }
}

/// Open `path` for writing at `offset`: truncate when starting over,
/// otherwise cut the file back to `offset` and seek there.
async fn open_at(path: &Path, key: &DestinationKey, offset: u64) -> Result<File, ChannelError> {
    if offset == 0 {
        return File::create(path).await.map_err(ChannelError::io(path));
    }
    let beyond_end = |len| ChannelError::OffsetBeyondEnd {
        key: key.to_string(),
        len,
        offset,
    };
    let mut file = match OpenOptions::new().write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(beyond_end(0)),
        Err(e) => return Err(ChannelError::Io { path: path.to_path_buf(), source: e }),
    };
    let len = file.metadata().await.map_err(ChannelError::io(path))?.len();
    if len < offset {
        return Err(beyond_end(len));
    }
    file.set_len(offset).await.map_err(ChannelError::io(path))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(ChannelError::io(path))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Invalidation;
    use futures_util::stream;
    use std::convert::Infallible;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn manager(dir: &Path) -> ChannelManager {
        ChannelManager::new(dir, ReceivedFiles::new(Invalidation::new()))
    }

    fn body(chunks: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes, Infallible>> {
        stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok(Bytes::from_static(chunk)))
                .collect::<Vec<_>>(),
        )
    }

    /// Body fed chunk by chunk from the test.
    fn channel_body() -> (
        mpsc::UnboundedSender<Bytes>,
        impl Stream<Item = Result<Bytes, Infallible>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let body = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        });
        (tx, body)
    }

    #[tokio::test]
    async fn test_upload_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path());
        let key = DestinationKey::new("alice", "clip.webm");
        let token = uploads.grant(key.clone(), 0);
        assert_eq!(uploads.grant_state(&token), GrantState::Granted);

        let written = uploads.consume(&token, body(&[b"hello ", b"world"])).await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(
            std::fs::read(dir.path().join("alice/clip.webm")).unwrap(),
            b"hello world"
        );
        let info = uploads.files().get(&key).unwrap();
        assert_eq!((info.size, info.open), (11, false));
        assert_eq!(uploads.grant_state(&token), GrantState::Closed);
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path());
        let token = uploads.grant(DestinationKey::new("alice", "a.webm"), 0);
        uploads.consume(&token, body(&[b"x"])).await.unwrap();
        let err = uploads.consume(&token, body(&[b"y"])).await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownGrant));
        let err = uploads.consume("bogus", body(&[b"y"])).await.unwrap_err();
        assert!(matches!(err, ChannelError::UnknownGrant));
    }

    #[tokio::test]
    async fn test_resume_truncates_to_offset() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path());
        let key = DestinationKey::new("alice", "clip.webm");
        let first = uploads.grant(key.clone(), 0);
        uploads.consume(&first, body(&[b"0123456789"])).await.unwrap();

        let resume = uploads.grant(key.clone(), 4);
        let written = uploads.consume(&resume, body(&[b"abc"])).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(
            std::fs::read(dir.path().join("alice/clip.webm")).unwrap(),
            b"0123abc"
        );
        assert_eq!(uploads.files().get(&key).unwrap().size, 7);
    }

    #[tokio::test]
    async fn test_offset_beyond_end() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path());
        let key = DestinationKey::new("alice", "short.webm");
        let token = uploads.grant(key.clone(), 0);
        uploads.consume(&token, body(&[b"abc"])).await.unwrap();

        let token = uploads.grant(key.clone(), 10);
        let err = uploads.consume(&token, body(&[b"def"])).await.unwrap_err();
        assert!(
            matches!(err, ChannelError::OffsetBeyondEnd { len: 3, offset: 10, .. }),
            "{err}"
        );

        let token = uploads.grant(DestinationKey::new("alice", "missing.webm"), 1);
        let err = uploads.consume(&token, body(&[b"x"])).await.unwrap_err();
        assert!(matches!(err, ChannelError::OffsetBeyondEnd { len: 0, .. }));
    }

    #[tokio::test]
    async fn test_superseded_writer_keeps_only_latest_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = Arc::new(manager(dir.path()));
        let key = DestinationKey::new("alice", "clip.webm");

        let first = uploads.grant(key.clone(), 0);
        let (tx, slow_body) = channel_body();
        let writer = tokio::spawn({
            let uploads = uploads.clone();
            async move { uploads.consume(&first, slow_body).await }
        });
        tx.send(Bytes::from_static(b"old-bytes-")).unwrap();
        timeout(Duration::from_secs(1), async {
            while uploads.files().get(&key).map(|info| info.size) != Some(10) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let second = uploads.grant(key.clone(), 0);
        let err = timeout(Duration::from_secs(1), writer).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Superseded(_)), "{err}");
        let _ = tx.send(Bytes::from_static(b"late"));

        uploads.consume(&second, body(&[b"new"])).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("alice/clip.webm")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_superseded_writer_leaves_new_upload_open() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = Arc::new(manager(dir.path()));
        let key = DestinationKey::new("alice", "clip.webm");
        let state = || uploads.files().get(&key).map(|info| (info.size, info.open));

        let first = uploads.grant(key.clone(), 0);
        let (old_tx, old_body) = channel_body();
        let old_writer = tokio::spawn({
            let uploads = uploads.clone();
            async move { uploads.consume(&first, old_body).await }
        });
        old_tx.send(Bytes::from_static(b"old-bytes-")).unwrap();
        timeout(Duration::from_secs(1), async {
            while state() != Some((10, true)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let second = uploads.grant(key.clone(), 0);
        let (new_tx, new_body) = channel_body();
        let new_writer = tokio::spawn({
            let uploads = uploads.clone();
            async move { uploads.consume(&second, new_body).await }
        });
        let err = timeout(Duration::from_secs(1), old_writer).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Superseded(_)), "{err}");

        // The new writer owns the file and has not received anything yet.
        timeout(Duration::from_secs(1), async {
            while state() != Some((0, true)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state(), Some((0, true)));

        new_tx.send(Bytes::from_static(b"new")).unwrap();
        drop(new_tx);
        let written = timeout(Duration::from_secs(1), new_writer).await.unwrap().unwrap().unwrap();
        assert_eq!(written, 3);
        assert_eq!(state(), Some((3, false)));
        assert_eq!(std::fs::read(dir.path().join("alice/clip.webm")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_cancel_owner() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path());
        let a = uploads.grant(DestinationKey::new("alice", "a.webm"), 0);
        let b = uploads.grant(DestinationKey::new("alice", "b.webm"), 0);
        let c = uploads.grant(DestinationKey::new("bob", "c.webm"), 0);

        assert_eq!(uploads.cancel_owner("alice"), 2);
        assert_eq!(uploads.grant_state(&a), GrantState::Closed);
        assert_eq!(uploads.grant_state(&b), GrantState::Closed);
        assert_eq!(uploads.grant_state(&c), GrantState::Granted);
        assert!(!uploads.cancel(&DestinationKey::new("alice", "a.webm")));
        assert!(uploads.cancel(&DestinationKey::new("bob", "c.webm")));
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = manager(dir.path());
        let token = uploads.grant(DestinationKey::new("alice", ".."), 0);
        let err = uploads.consume(&token, body(&[b"x"])).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidName(_)));
    }
}
