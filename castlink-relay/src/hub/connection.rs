//! One accepted peer socket and the state the relay keeps about it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use crate::derive::SerialDerivation;
use crate::ids::{create_id, short_id};
use crate::pairing::PairingState;
use crate::protocol::PeerCall;
use crate::rpc::{Methods, RpcEngine, RpcError, RpcPeer};
use crate::signal::{publish, Invalidation};
use crate::transport::Transport;

/// Which side of the relay a socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Emitter,
    Receiver,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Emitter => "emitter",
            Role::Receiver => "receiver",
            Role::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// Media an emitter currently offers, as replicated by the emitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    #[serde(default)]
    pub has_audio: bool,
    #[serde(default)]
    pub has_video: bool,
}

impl StreamInfo {
    pub fn has_media(&self) -> bool {
        self.has_audio || self.has_video
    }
}

/// Admin request to change the `record` value of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordAction {
    Start,
    Stop,
    NewFile,
}

impl RecordAction {
    /// Next `record` value; a fresh recording name is minted on start and
    /// on every new file.
    pub fn apply(self, current: Option<String>) -> Option<String> {
        match self {
            RecordAction::Start if current.is_none() => Some(create_id()),
            RecordAction::Start => current,
            RecordAction::NewFile => Some(create_id()),
            RecordAction::Stop => None,
        }
    }
}

/// A live emitter, receiver or admin socket.
///
/// Emitters and receivers point at each other through `remote_peer` while
/// paired. The links are set together under the hub's pairing lock and
/// cleared together when either socket closes.
pub struct Connection {
    id: String,
    short_id: String,
    role: Role,
    ip: String,
    rpc: RpcPeer,
    inbound: watch::Receiver<Value>,
    changes: Invalidation,
    remote_peer: Mutex<Option<Arc<Connection>>>,
    record: Mutex<Option<String>>,
    transform_image: Mutex<Option<Value>>,
    pairing: Mutex<PairingState>,
    record_url: Mutex<Option<String>>,
    reactions: Mutex<Vec<SerialDerivation>>,
}

impl Connection {
    /// Start the RPC engine over `transport` and publish `render(self)` to
    /// the peer after every change of shared state.
    pub(crate) fn open<M, F, R>(
        role: Role,
        ip: String,
        transport: Transport,
        changes: Invalidation,
        methods: F,
        render: R,
    ) -> Arc<Self>
    where
        M: Methods,
        F: FnOnce(Weak<Connection>) -> M,
        R: Fn(&Connection) -> Value + Send + 'static,
    {
        let id = create_id();
        let (outbound_tx, outbound_rx) = watch::channel(Value::Null);
        let connection = Arc::new_cyclic(|weak| {
            let (rpc, inbound) = RpcEngine::start(Arc::new(methods(weak.clone())), transport, outbound_rx);
            Connection {
                short_id: short_id(&id),
                id,
                role,
                ip,
                rpc,
                inbound,
                changes: changes.clone(),
                remote_peer: Mutex::new(None),
                record: Mutex::new(None),
                transform_image: Mutex::new(None),
                pairing: Mutex::new(PairingState::Idle),
                record_url: Mutex::new(None),
                reactions: Mutex::new(Vec::new()),
            }
        });

        // Inbound replication invalidates every view that reads it
        let mut inbound = connection.inbound.clone();
        let inbound_changes = changes.clone();
        tokio::spawn(async move {
            while inbound.changed().await.is_ok() {
                inbound_changes.bump();
            }
        });

        let weak = Arc::downgrade(&connection);
        tokio::spawn(publish(changes.subscribe(), outbound_tx, move || {
            weak.upgrade().map(|connection| render(&connection)).unwrap_or_default()
        }));
        connection
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn rpc(&self) -> &RpcPeer {
        &self.rpc
    }

    /// Call one of the peer's methods.
    pub async fn call(&self, method: PeerCall, params: Value) -> Result<Value, RpcError> {
        self.rpc.call(method.name(), params).await
    }

    pub fn close(&self, code: u16) {
        self.rpc.close(code);
    }

    /// Latest state the peer replicated to us (`null` until the first patch).
    pub fn inbound(&self) -> Value {
        self.inbound.borrow().clone()
    }

    pub fn subscribe_inbound(&self) -> watch::Receiver<Value> {
        self.inbound.clone()
    }

    /// Stream info from the peer's replicated state, if it sent one.
    pub fn stream_info(&self) -> Option<StreamInfo> {
        let inbound = self.inbound.borrow();
        let info = inbound.get("streamInfo")?;
        serde_json::from_value(info.clone()).ok()
    }

    pub fn remote_peer(&self) -> Option<Arc<Connection>> {
        self.remote_peer.lock().clone()
    }

    /// Whether `remote_peer` currently points at `other`.
    pub fn is_linked_to(&self, other: &Connection) -> bool {
        self.remote_peer
            .lock()
            .as_ref()
            .is_some_and(|peer| std::ptr::eq(Arc::as_ptr(peer), other))
    }

    /// Point `a` and `b` at each other. Callers hold the pairing lock.
    pub(crate) fn link(a: &Arc<Connection>, b: &Arc<Connection>) {
        *a.remote_peer.lock() = Some(b.clone());
        *b.remote_peer.lock() = Some(a.clone());
        a.changes.bump();
    }

    /// Clear the links between `a` and `b`, each only if it still points at
    /// the other. Returns whether anything was cleared.
    pub(crate) fn unlink(a: &Connection, b: &Connection) -> bool {
        let mut cleared = false;
        for (from, to) in [(a, b), (b, a)] {
            let mut remote = from.remote_peer.lock();
            if remote.as_ref().is_some_and(|peer| std::ptr::eq(Arc::as_ptr(peer), to)) {
                *remote = None;
                cleared = true;
            }
        }
        if cleared {
            a.changes.bump();
        }
        cleared
    }

    pub fn record(&self) -> Option<String> {
        self.record.lock().clone()
    }

    pub fn update_record(&self, action: RecordAction) -> Option<String> {
        let (next, changed) = {
            let mut record = self.record.lock();
            let next = action.apply(record.clone());
            let changed = *record != next;
            *record = next.clone();
            (next, changed)
        };
        if changed {
            self.changes.bump();
        }
        next
    }

    pub fn transform_image(&self) -> Option<Value> {
        self.transform_image.lock().clone()
    }

    pub fn set_transform_image(&self, value: Option<Value>) {
        let changed = {
            let mut current = self.transform_image.lock();
            let changed = *current != value;
            *current = value;
            changed
        };
        if changed {
            self.changes.bump();
        }
    }

    pub fn pairing_state(&self) -> PairingState {
        *self.pairing.lock()
    }

    pub(crate) fn set_pairing_state(&self, state: PairingState) -> bool {
        let changed = std::mem::replace(&mut *self.pairing.lock(), state) != state;
        if changed {
            self.changes.bump();
        }
        changed
    }

    pub fn record_url(&self) -> Option<String> {
        self.record_url.lock().clone()
    }

    pub(crate) fn set_record_url(&self, token: String) {
        *self.record_url.lock() = Some(token);
        self.changes.bump();
    }

    /// Keep `reaction` running for as long as this connection is open.
    pub(crate) fn add_reaction(&self, reaction: SerialDerivation) {
        self.reactions.lock().push(reaction);
    }

    pub(crate) fn take_reactions(&self) -> Vec<SerialDerivation> {
        std::mem::take(&mut *self.reactions.lock())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("short_id", &self.short_id)
            .field("role", &self.role)
            .field("ip", &self.ip)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::NoMethods;
    use serde_json::json;

    fn open(role: Role, changes: &Invalidation) -> (Arc<Connection>, crate::transport::SocketEnd) {
        let (transport, end) = Transport::channel();
        let connection = Connection::open(
            role,
            "127.0.0.1".into(),
            transport,
            changes.clone(),
            |_| NoMethods,
            |_| json!({}),
        );
        (connection, end)
    }

    #[test]
    fn test_record_actions() {
        assert!(RecordAction::Start.apply(None).is_some());
        assert_eq!(RecordAction::Start.apply(Some("a".into())), Some("a".into()));
        assert_ne!(RecordAction::NewFile.apply(Some("a".into())), Some("a".into()));
        assert_eq!(RecordAction::Stop.apply(Some("a".into())), None);
    }

    #[test]
    fn test_stream_info_defaults() {
        let info: StreamInfo = serde_json::from_value(json!({"hasVideo": true})).unwrap();
        assert!(info.has_media());
        assert!(!info.has_audio);
        assert!(!StreamInfo::default().has_media());
    }

    #[tokio::test]
    async fn test_link_and_unlink_are_mutual() {
        let changes = Invalidation::new();
        let (emitter, _e) = open(Role::Emitter, &changes);
        let (receiver, _r) = open(Role::Receiver, &changes);
        let (other, _o) = open(Role::Receiver, &changes);

        Connection::link(&emitter, &receiver);
        assert!(emitter.is_linked_to(&receiver));
        assert!(receiver.is_linked_to(&emitter));

        // A stale pair does not clear the live link
        assert!(!Connection::unlink(&emitter, &other));
        assert!(emitter.is_linked_to(&receiver));

        assert!(Connection::unlink(&receiver, &emitter));
        assert!(emitter.remote_peer().is_none());
        assert!(receiver.remote_peer().is_none());
    }

    #[tokio::test]
    async fn test_setters_bump_only_on_change() {
        let changes = Invalidation::new();
        let (connection, _end) = open(Role::Receiver, &changes);
        let before = changes.version();

        connection.set_transform_image(Some(json!({"rotate": 90})));
        connection.set_transform_image(Some(json!({"rotate": 90})));
        assert_eq!(changes.version(), before + 1);

        assert!(connection.set_pairing_state(PairingState::Negotiating));
        assert!(!connection.set_pairing_state(PairingState::Negotiating));
        assert_eq!(changes.version(), before + 2);
        assert_eq!(connection.short_id().len(), crate::ids::SHORT_ID_LEN);
    }
}
