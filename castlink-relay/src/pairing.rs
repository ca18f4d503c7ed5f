//! WebRTC signaling between a paired emitter and receiver.
//!
//! Each receiver runs one [`SerialDerivation`] over [`PairingInput`]. A
//! reaction negotiates the session when both sides are still linked and the
//! emitter offers media, holds it while active, and tears it down when the
//! input changes:
//!
//! ```text
//!            emitter                    relay                    receiver
//!               │ ◄── createRTCConnection ─┼─ createRTCConnection ──► │
//!               │ ◄── createOfferRTCConnection                        │
//!               │ ──────── offer ─────────►┼── createAnswerRTCConnection ─► │
//!               │ ◄── completeOfferRTCConnection ◄──── answer ─────── │
//!               │            ... active until the input changes ...  │
//!               │ ◄── deleteRTCConnection ─┼─ deleteRTCConnection ──► │
//! ```
//!
//! | State         | Entered when                                  |
//! |---------------|-----------------------------------------------|
//! | `idle`        | no session, or teardown finished              |
//! | `negotiating` | first `createRTCConnection` sent              |
//! | `active`      | `completeOfferRTCConnection` succeeded        |
//! | `tearingDown` | negotiation ended (abort, failure, or stale)  |
//!
//! After every awaited step the reaction re-checks its abort signal and that
//! both peers still point at each other. If either fails it stops issuing
//! negotiation calls and reports [`ReactionError::Cancelled`].

use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;

use crate::activity::ActivityLog;
use crate::derive::{AbortSignal, ReactionError, SerialDerivation};
use crate::hub::{Connection, StreamInfo};
use crate::protocol::PeerCall;
use crate::rpc::RpcError;
use crate::signal::{computed, Invalidation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PairingState {
    #[default]
    Idle,
    Negotiating,
    Active,
    TearingDown,
}

/// What a pairing reaction depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingInput {
    pub still_paired: bool,
    pub stream_info: Option<StreamInfo>,
}

impl PairingInput {
    pub fn wants_session(&self) -> bool {
        self.still_paired && self.stream_info.is_some_and(|info| info.has_media())
    }
}

/// An emitter and the receiver attached to it.
#[derive(Clone)]
pub struct Pair {
    emitter: Arc<Connection>,
    receiver: Arc<Connection>,
    configuration: Value,
    activity: Arc<ActivityLog>,
}

impl Pair {
    pub fn new(
        emitter: Arc<Connection>,
        receiver: Arc<Connection>,
        configuration: Value,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            emitter,
            receiver,
            configuration,
            activity,
        }
    }

    pub fn emitter(&self) -> &Arc<Connection> {
        &self.emitter
    }

    pub fn receiver(&self) -> &Arc<Connection> {
        &self.receiver
    }

    /// Both connections still point at each other.
    pub fn still_paired(&self) -> bool {
        self.emitter.is_linked_to(&self.receiver) && self.receiver.is_linked_to(&self.emitter)
    }

    pub fn input(&self) -> PairingInput {
        PairingInput {
            still_paired: self.still_paired(),
            stream_info: self.emitter.stream_info(),
        }
    }

    /// One reaction: negotiate if wanted, hold until aborted, tear down.
    pub async fn run(self, input: PairingInput, abort: AbortSignal) -> Result<(), ReactionError> {
        if !input.wants_session() {
            return Ok(());
        }
        self.set_state(PairingState::Negotiating);
        let outcome = self.negotiate(&abort).await;
        self.set_state(PairingState::TearingDown);
        self.teardown().await;
        self.set_state(PairingState::Idle);
        outcome
    }

    async fn negotiate(&self, abort: &AbortSignal) -> Result<(), ReactionError> {
        let params = json!({ "configuration": self.configuration });
        let created = async {
            let (emitter, receiver) = tokio::join!(
                self.emitter.call(PeerCall::CreateRtcConnection, params.clone()),
                self.receiver.call(PeerCall::CreateRtcConnection, params),
            );
            emitter.and(receiver)
        };
        self.step(abort, created).await?;

        let offer = self
            .step(abort, self.emitter.call(PeerCall::CreateOfferRtcConnection, json!({})))
            .await?;
        let answer = self
            .step(
                abort,
                self.receiver.call(PeerCall::CreateAnswerRtcConnection, json!({ "offer": offer })),
            )
            .await?;
        self.step(
            abort,
            self.emitter.call(PeerCall::CompleteOfferRtcConnection, json!({ "answer": answer })),
        )
        .await?;

        self.set_state(PairingState::Active);
        abort.cancelled().await;
        Ok(())
    }

    /// Await `call` unless aborted first, then check the outcome.
    async fn step<T>(
        &self,
        abort: &AbortSignal,
        call: impl Future<Output = Result<T, RpcError>>,
    ) -> Result<T, ReactionError> {
        tokio::select! {
            biased;
            _ = abort.cancelled() => Err(ReactionError::Cancelled),
            outcome = call => self.checked(abort, outcome),
        }
    }

    /// Abort and staleness win over the call's own outcome, so a failure
    /// caused by the other side leaving reads as a cancellation.
    fn checked<T>(&self, abort: &AbortSignal, outcome: Result<T, RpcError>) -> Result<T, ReactionError> {
        abort.check()?;
        if !self.still_paired() {
            return Err(ReactionError::Cancelled);
        }
        outcome.map_err(ReactionError::from)
    }

    async fn teardown(&self) {
        if !self.still_paired() {
            return;
        }
        let (emitter, receiver) = tokio::join!(
            self.emitter.call(PeerCall::DeleteRtcConnection, json!({})),
            self.receiver.call(PeerCall::DeleteRtcConnection, json!({})),
        );
        for (side, outcome) in [("emitter", emitter), ("receiver", receiver)] {
            if let Err(e) = outcome {
                log::debug!("deleteRTCConnection on {side} of {} failed: {e}", self.emitter.short_id());
            }
        }
    }

    fn set_state(&self, state: PairingState) {
        if self.receiver.set_pairing_state(state) {
            log::debug!("Pairing {}: {state:?}", self.emitter.short_id());
            self.activity.record(
                "pairing",
                json!({ "id": self.emitter.short_id(), "state": state }),
            );
        }
    }
}

/// Drive `pair` from `changes` until the returned derivation is stopped.
pub fn spawn_pairing(changes: &Invalidation, pair: Pair) -> SerialDerivation {
    let watched = pair.clone();
    let input = computed(changes.subscribe(), move || watched.input());
    let name = format!("pairing {}", pair.emitter.short_id());
    SerialDerivation::spawn(name, input, move |input, abort| pair.clone().run(input, abort))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wants_session() {
        let media = Some(StreamInfo {
            has_audio: false,
            has_video: true,
        });
        assert!(PairingInput { still_paired: true, stream_info: media }.wants_session());
        assert!(!PairingInput { still_paired: false, stream_info: media }.wants_session());
        assert!(!PairingInput { still_paired: true, stream_info: None }.wants_session());
        assert!(!PairingInput {
            still_paired: true,
            stream_info: Some(StreamInfo::default()),
        }
        .wants_session());
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(serde_json::to_value(PairingState::TearingDown).unwrap(), "tearingDown");
        assert_eq!(PairingState::default(), PairingState::Idle);
    }
}
