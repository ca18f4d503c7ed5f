//! Cancellable serial derivation.
//!
//! A [`SerialDerivation`] runs an async reaction for every value of a
//! changing input, one reaction at a time:
//!
//! ```text
//! input:     v1 ────────── v2 ── v3 ─────────────
//! reaction:  [run(v1) ...abort→teardown] [run(v3) ...
//!                          ▲
//!                          v2 superseded before it started
//! ```
//!
//! When the input changes, the running reaction is signalled through its
//! [`AbortSignal`] and awaited to completion before the next one starts with
//! the latest value. Intermediate values may be skipped; two reactions of
//! one derivation never overlap.

use std::future::Future;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::rpc::RpcError;

/// Why a reaction ended early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactionError {
    /// Aborted, or overtaken by a state change. Never reported as a failure.
    #[error("reaction cancelled")]
    Cancelled,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("{0}")]
    Failed(String),
}

/// Cooperative cancellation handle passed to each reaction.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Err(Cancelled)` once abort was signalled.
    pub fn check(&self) -> Result<(), ReactionError> {
        if self.is_aborted() {
            Err(ReactionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Park until abort is signalled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Handle to a running derivation.
///
/// Dropping the handle signals the driver to stop without waiting for it.
pub struct SerialDerivation {
    name: String,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SerialDerivation {
    /// Start reacting to `input`, beginning with its current value.
    pub fn spawn<T, F, Fut>(name: impl Into<String>, input: watch::Receiver<T>, reaction: F) -> Self
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(T, AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ReactionError>> + Send + 'static,
    {
        let name = name.into();
        let stop = CancellationToken::new();
        let task = tokio::spawn(drive(name.clone(), input, reaction, stop.clone()));
        Self {
            name,
            stop,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Abort the current reaction, wait for it, and end the driver.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("{}: derivation driver panicked: {e}", self.name);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for SerialDerivation {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

enum Wake {
    Finished(Result<(), ReactionError>),
    Changed(bool),
    Stopped,
}

async fn drive<T, F, Fut>(name: String, mut input: watch::Receiver<T>, mut reaction: F, stop: CancellationToken)
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(T, AbortSignal) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ReactionError>> + Send + 'static,
{
    loop {
        let value = input.borrow_and_update().clone();
        let abort = stop.child_token();
        let run = reaction(value, AbortSignal::new(abort.clone()));
        tokio::pin!(run);

        let wake = tokio::select! {
            outcome = &mut run => Wake::Finished(outcome),
            changed = input.changed() => Wake::Changed(changed.is_ok()),
            _ = stop.cancelled() => Wake::Stopped,
        };

        let keep_going = match wake {
            Wake::Finished(outcome) => {
                report(&name, outcome);
                tokio::select! {
                    changed = input.changed() => changed.is_ok(),
                    _ = stop.cancelled() => false,
                }
            }
            Wake::Changed(open) => {
                abort.cancel();
                report(&name, run.await);
                open
            }
            Wake::Stopped => {
                abort.cancel();
                report(&name, run.await);
                false
            }
        };
        if !keep_going {
            break;
        }
    }
    log::trace!("{name}: derivation stopped");
}

fn report(name: &str, outcome: Result<(), ReactionError>) {
    match outcome {
        Ok(()) => {}
        Err(ReactionError::Cancelled) => log::debug!("{name}: reaction cancelled"),
        Err(e) => log::error!("{name}: reaction failed: {e}"),
    }
}
