//! Pairing races, driven over in-memory transports.

use castlink_relay::{
    ActivityLog, BoxError, Hub, LogSceneSync, Methods, PairingState, PeerCall, RpcEngine, RpcPeer,
    ServerConfig, Transport,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout, Duration};

/// Fake browser peer. Records calls; `hold` never answers and wakes `reached`.
#[derive(Clone)]
struct Script {
    calls: Arc<Mutex<Vec<String>>>,
    hold: Option<PeerCall>,
    reached: Arc<Notify>,
}

impl Script {
    fn new(hold: Option<PeerCall>) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            hold,
            reached: Arc::new(Notify::new()),
        }
    }

    fn names(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl Methods for Script {
    type Method = PeerCall;

    fn resolve(&self, name: &str) -> Option<PeerCall> {
        PeerCall::from_name(name)
    }

    fn call(&self, method: PeerCall, _params: Value) -> BoxFuture<'static, Result<Value, BoxError>> {
        self.calls.lock().push(method.name().to_string());
        if self.hold == Some(method) {
            self.reached.notify_one();
            return futures_util::future::pending().boxed();
        }
        let result = match method {
            PeerCall::CreateOfferRtcConnection => json!({"type": "offer", "sdp": "o"}),
            PeerCall::CreateAnswerRtcConnection => json!({"type": "answer", "sdp": "a"}),
            _ => Value::Null,
        };
        futures_util::future::ready(Ok(result)).boxed()
    }
}

fn hub() -> Arc<Hub> {
    Hub::new(ServerConfig::default(), Arc::new(LogSceneSync), ActivityLog::disabled())
}

/// Accept `path` on the hub and run a peer engine on the other end.
fn attach(hub: &Arc<Hub>, path: &str, script: Script, state: Value) -> (RpcPeer, watch::Sender<Value>) {
    let (server_side, peer_side) = Transport::pair();
    hub.accept(path, server_side, "127.0.0.1".into());
    let (tx, rx) = watch::channel(state);
    let (rpc, _inbound) = RpcEngine::start(Arc::new(script), peer_side, rx);
    (rpc, tx)
}

fn video() -> Value {
    json!({"streamInfo": {"hasAudio": true, "hasVideo": true}})
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_receiver_leaving_between_offer_and_answer() {
    let hub = hub();
    let emitter = Script::new(Some(PeerCall::CreateOfferRtcConnection));
    let (_emitter_rpc, _emitter_state) = attach(&hub, "/emitter/", emitter.clone(), video());
    eventually("emitter registration", || hub.emitters().len() == 1).await;
    let id = hub.emitters()[0].id().to_string();

    let receiver = Script::new(None);
    let (receiver_rpc, _receiver_state) =
        attach(&hub, &format!("/receiver/{id}"), receiver.clone(), json!({}));
    timeout(Duration::from_secs(5), emitter.reached.notified())
        .await
        .expect("offer requested");

    receiver_rpc.close(1000);
    eventually("receiver removal", || hub.receivers().is_empty()).await;
    eventually("emitter unlinked", || hub.emitters()[0].remote_peer().is_none()).await;

    // Give a stray answer request or teardown time to show up.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(emitter.names(), ["createRTCConnection", "createOfferRTCConnection"]);
    assert_eq!(receiver.names(), ["createRTCConnection"]);
    assert_eq!(hub.emitters().len(), 1);
}

#[tokio::test]
async fn test_receiver_leaving_during_answer() {
    let hub = hub();
    let emitter = Script::new(None);
    let (_emitter_rpc, _emitter_state) = attach(&hub, "/emitter/", emitter.clone(), video());
    eventually("emitter registration", || hub.emitters().len() == 1).await;
    let id = hub.emitters()[0].id().to_string();

    let receiver = Script::new(Some(PeerCall::CreateAnswerRtcConnection));
    let (receiver_rpc, _receiver_state) =
        attach(&hub, &format!("/receiver/{id}"), receiver.clone(), json!({}));
    timeout(Duration::from_secs(5), receiver.reached.notified())
        .await
        .expect("answer requested");

    receiver_rpc.close(1000);
    eventually("receiver removal", || hub.receivers().is_empty()).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(emitter.names(), ["createRTCConnection", "createOfferRTCConnection"]);
    assert_eq!(receiver.names(), ["createRTCConnection", "createAnswerRTCConnection"]);
}

#[tokio::test]
async fn test_new_receiver_negotiates_after_previous_left() {
    let hub = hub();
    let emitter = Script::new(None);
    let (_emitter_rpc, _emitter_state) = attach(&hub, "/emitter/", emitter.clone(), video());
    eventually("emitter registration", || hub.emitters().len() == 1).await;
    let id = hub.emitters()[0].id().to_string();
    let path = format!("/receiver/{id}");

    let first = Script::new(Some(PeerCall::CreateAnswerRtcConnection));
    let (first_rpc, _first_state) = attach(&hub, &path, first.clone(), json!({}));
    timeout(Duration::from_secs(5), first.reached.notified())
        .await
        .expect("answer requested");
    first_rpc.close(1000);
    eventually("emitter unlinked", || hub.emitters()[0].remote_peer().is_none()).await;

    let second = Script::new(None);
    let (_second_rpc, _second_state) = attach(&hub, &path, second.clone(), json!({}));
    eventually("active session", || {
        hub.receivers().first().map(|r| r.pairing_state()) == Some(PairingState::Active)
    })
    .await;
    assert_eq!(second.names(), ["createRTCConnection", "createAnswerRTCConnection"]);
    assert_eq!(
        emitter.names(),
        [
            "createRTCConnection",
            "createOfferRTCConnection",
            "createRTCConnection",
            "createOfferRTCConnection",
            "completeOfferRTCConnection",
        ]
    );
}

#[tokio::test]
async fn test_no_session_without_media() {
    let hub = hub();
    let emitter = Script::new(None);
    let (_emitter_rpc, emitter_state) =
        attach(&hub, "/emitter/", emitter.clone(), json!({"streamInfo": {"hasAudio": false, "hasVideo": false}}));
    eventually("emitter registration", || hub.emitters().len() == 1).await;
    let id = hub.emitters()[0].id().to_string();

    let receiver = Script::new(None);
    let (_receiver_rpc, _receiver_state) =
        attach(&hub, &format!("/receiver/{id}"), receiver.clone(), json!({}));
    eventually("receiver registration", || hub.receivers().len() == 1).await;
    sleep(Duration::from_millis(50)).await;
    assert!(emitter.names().is_empty());
    assert!(receiver.names().is_empty());

    emitter_state.send_replace(video());
    eventually("active session", || {
        hub.receivers().first().map(|r| r.pairing_state()) == Some(PairingState::Active)
    })
    .await;
}

#[tokio::test]
async fn test_emitter_leaving_mid_negotiation_sends_no_teardown() {
    let hub = hub();
    let emitter = Script::new(Some(PeerCall::CreateOfferRtcConnection));
    let (emitter_rpc, _emitter_state) = attach(&hub, "/emitter/", emitter.clone(), video());
    eventually("emitter registration", || hub.emitters().len() == 1).await;
    let id = hub.emitters()[0].id().to_string();

    let receiver = Script::new(None);
    let (receiver_rpc, _receiver_state) =
        attach(&hub, &format!("/receiver/{id}"), receiver.clone(), json!({}));
    timeout(Duration::from_secs(5), emitter.reached.notified())
        .await
        .expect("offer requested");

    emitter_rpc.close(1000);
    eventually("emitter removal", || hub.emitters().is_empty()).await;
    timeout(Duration::from_secs(5), receiver_rpc.closed())
        .await
        .expect("receiver released");

    assert_eq!(receiver.names(), ["createRTCConnection"]);
    assert!(hub.receivers().is_empty());
}
