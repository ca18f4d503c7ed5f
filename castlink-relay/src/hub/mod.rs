//! Connection classes, registries and their lifecycles.
//!
//! ```text
//!  socket path ──► Hub::accept ──┬─ emitter_paths   ──► emitters  registry ──► SceneSync
//!                                ├─ admin_paths     ──► admins    registry
//!                                ├─ receiver_prefix ──► receivers registry ──► pairing derivation
//!                                │    + emitter id        (linked to its emitter)
//!                                └─ anything else   ──► close 3001
//! ```
//!
//! Every registry, link and replicated document reports changes on one shared
//! [`Invalidation`]; each connection's view and each pairing input is
//! recomputed from it.
//!
//! Close handling runs from the RPC engine's close hooks, before any pending
//! call is rejected:
//!
//! | Closed   | Immediately                                        | After the release cooldown |
//! |----------|----------------------------------------------------|----------------------------|
//! | emitter  | unlink, unregister, close receiver (3001), unscene | cancel upload grants       |
//! | receiver | unlink, unregister, stop pairing                   | revoke the record URL      |
//! | admin    | unregister                                         |                            |

pub mod connection;
pub mod methods;
pub mod views;

pub use connection::{Connection, RecordAction, Role, StreamInfo};
pub use methods::{AdminMethod, AdminMethods, PeerMethod, PeerMethods};
pub use views::EmitterAdminInfo;

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::activity::ActivityLog;
use crate::channels::{ChannelManager, ReceivedFiles, RecordingManager};
use crate::config::ServerConfig;
use crate::derive::SerialDerivation;
use crate::pairing::{spawn_pairing, Pair};
use crate::registry::{Registry, Removal};
use crate::scene::{SceneHandle, SceneSync};
use crate::signal::{computed, Invalidation};
use crate::transport::{Transport, NO_RECONNECT};

/// Where a socket path leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Emitter,
    Admin,
    Receiver { emitter_id: String },
    Refused,
}

/// Shared relay state: every live connection plus the channel managers.
pub struct Hub {
    config: Arc<ServerConfig>,
    changes: Invalidation,
    /// Held while checking and setting emitter/receiver links
    pairing_lock: Mutex<()>,
    scenes: Arc<dyn SceneSync>,
    activity: Arc<ActivityLog>,
    emitters: Registry<String, Arc<Connection>>,
    receivers: Registry<String, Arc<Connection>>,
    admins: Registry<String, Arc<Connection>>,
    uploads: ChannelManager,
    recordings: RecordingManager,
}

impl Hub {
    pub fn new(config: ServerConfig, scenes: Arc<dyn SceneSync>, activity: ActivityLog) -> Arc<Self> {
        let changes = Invalidation::new();
        let files = ReceivedFiles::new(changes.clone());
        Arc::new(Self {
            uploads: ChannelManager::new(&config.recordings_folder, files.clone()),
            recordings: RecordingManager::new(&config.recordings_folder, files),
            emitters: Registry::with_invalidation(changes.clone()),
            receivers: Registry::with_invalidation(changes.clone()),
            admins: Registry::with_invalidation(changes.clone()),
            config: Arc::new(config),
            changes,
            pairing_lock: Mutex::new(()),
            scenes,
            activity: Arc::new(activity),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn changes(&self) -> &Invalidation {
        &self.changes
    }

    pub fn uploads(&self) -> &ChannelManager {
        &self.uploads
    }

    pub fn recordings(&self) -> &RecordingManager {
        &self.recordings
    }

    pub fn files(&self) -> &ReceivedFiles {
        self.uploads.files()
    }

    pub fn emitter(&self, id: &str) -> Option<Arc<Connection>> {
        self.emitters.get(&id.to_string())
    }

    pub fn emitters(&self) -> Vec<Arc<Connection>> {
        self.emitters.list()
    }

    pub fn receivers(&self) -> Vec<Arc<Connection>> {
        self.receivers.list()
    }

    pub fn admins(&self) -> Vec<Arc<Connection>> {
        self.admins.list()
    }

    /// Classify a socket path.
    pub fn route(&self, path: &str) -> Route {
        if self.config.emitter_paths.iter().any(|p| p == path) {
            Route::Emitter
        } else if self.config.admin_paths.iter().any(|p| p == path) {
            Route::Admin
        } else if let Some(emitter_id) = path.strip_prefix(self.config.receiver_prefix.as_str()) {
            Route::Receiver {
                emitter_id: emitter_id.to_string(),
            }
        } else {
            Route::Refused
        }
    }

    /// Take over a socket accepted on `path`.
    ///
    /// Returns `None` when the socket was refused and closed with 3001.
    pub fn accept(self: &Arc<Self>, path: &str, transport: Transport, ip: String) -> Option<Arc<Connection>> {
        let accepted = match self.route(path) {
            Route::Emitter => Some(self.accept_emitter(transport, ip)),
            Route::Admin => Some(self.accept_admin(transport, ip)),
            Route::Receiver { emitter_id } => self.accept_receiver(&emitter_id, transport, ip),
            Route::Refused => {
                transport.sender().close(NO_RECONNECT);
                None
            }
        };
        if accepted.is_none() {
            log::debug!("Refused socket on {path}");
        }
        accepted
    }

    fn accept_emitter(self: &Arc<Self>, transport: Transport, ip: String) -> Arc<Connection> {
        let hub = Arc::downgrade(self);
        let emitter = Connection::open(
            Role::Emitter,
            ip,
            transport,
            self.changes.clone(),
            PeerMethods::new,
            move |connection| {
                hub.upgrade()
                    .map(|hub| views::emitter(&hub.config, connection))
                    .unwrap_or_default()
            },
        );
        let Some(removal) = self.register(&self.emitters, &emitter) else {
            return emitter;
        };
        let scene = self
            .scenes
            .add_id(emitter.id(), &self.config.receiver_url(emitter.id()));
        self.log_emitter_changes(&emitter);

        log::info!("Emitter {} connected from {}", emitter.short_id(), emitter.ip());
        self.activity.record(
            "emitterConnect",
            json!({ "id": emitter.short_id(), "ip": emitter.ip() }),
        );

        let hub = Arc::downgrade(self);
        let closing = Arc::downgrade(&emitter);
        emitter.rpc().on_close(move || {
            if let (Some(hub), Some(emitter)) = (hub.upgrade(), closing.upgrade()) {
                hub.emitter_closed(emitter, removal, scene);
            }
        });
        emitter
    }

    fn emitter_closed(self: Arc<Self>, emitter: Arc<Connection>, removal: Removal, scene: SceneHandle) {
        let receiver = {
            let _pairing = self.pairing_lock.lock();
            let receiver = emitter.remote_peer();
            if let Some(receiver) = &receiver {
                Connection::unlink(&emitter, receiver);
            }
            removal.remove();
            receiver
        };
        if let Some(receiver) = receiver {
            receiver.close(NO_RECONNECT);
        }
        scene.remove();

        log::info!("Emitter {} disconnected", emitter.short_id());
        self.activity
            .record("emitterDisconnect", json!({ "id": emitter.short_id() }));

        let reactions = emitter.take_reactions();
        tokio::spawn(async move {
            stop_all(reactions).await;
            tokio::time::sleep(self.config.release_cooldown()).await;
            let cancelled = self.uploads.cancel_owner(emitter.short_id());
            if cancelled > 0 {
                log::info!("Cancelled {cancelled} upload(s) of emitter {}", emitter.short_id());
            }
        });
    }

    fn accept_receiver(
        self: &Arc<Self>,
        emitter_id: &str,
        transport: Transport,
        ip: String,
    ) -> Option<Arc<Connection>> {
        let (emitter, receiver) = {
            let _pairing = self.pairing_lock.lock();
            let emitter = self
                .emitter(emitter_id)
                .filter(|emitter| emitter.remote_peer().is_none());
            let Some(emitter) = emitter else {
                transport.sender().close(NO_RECONNECT);
                return None;
            };
            let hub = Arc::downgrade(self);
            let receiver = Connection::open(
                Role::Receiver,
                ip,
                transport,
                self.changes.clone(),
                PeerMethods::new,
                move |connection| {
                    hub.upgrade()
                        .map(|hub| views::receiver(&hub.config, connection))
                        .unwrap_or_default()
                },
            );
            Connection::link(&emitter, &receiver);
            (emitter, receiver)
        };

        let Some(removal) = self.register(&self.receivers, &receiver) else {
            return Some(receiver);
        };
        if self.config.record {
            receiver.set_record_url(self.recordings.create_record_url(emitter.id()));
        }
        let pair = Pair::new(
            emitter.clone(),
            receiver.clone(),
            self.config.rtc_configuration.clone(),
            self.activity.clone(),
        );
        receiver.add_reaction(spawn_pairing(&self.changes, pair));
        self.log_receiver_changes(&receiver, emitter.short_id());

        log::info!(
            "Receiver connected to emitter {} from {}",
            emitter.short_id(),
            receiver.ip()
        );
        self.activity.record(
            "receiverConnect",
            json!({ "id": emitter.short_id(), "ip": receiver.ip() }),
        );

        let hub = Arc::downgrade(self);
        let closing = Arc::downgrade(&receiver);
        let emitter = Arc::downgrade(&emitter);
        receiver.rpc().on_close(move || {
            if let (Some(hub), Some(receiver)) = (hub.upgrade(), closing.upgrade()) {
                hub.receiver_closed(receiver, emitter.upgrade(), removal);
            }
        });
        Some(receiver)
    }

    fn receiver_closed(self: Arc<Self>, receiver: Arc<Connection>, emitter: Option<Arc<Connection>>, removal: Removal) {
        {
            let _pairing = self.pairing_lock.lock();
            if let Some(emitter) = &emitter {
                Connection::unlink(&receiver, emitter);
            }
            removal.remove();
        }

        let short_id = emitter
            .as_ref()
            .map_or_else(|| receiver.short_id().to_string(), |e| e.short_id().to_string());
        log::info!("Receiver of emitter {short_id} disconnected");
        self.activity
            .record("receiverDisconnect", json!({ "id": short_id }));

        let reactions = receiver.take_reactions();
        tokio::spawn(async move {
            stop_all(reactions).await;
            tokio::time::sleep(self.config.release_cooldown()).await;
            if let Some(token) = receiver.record_url() {
                self.recordings.delete_record_url(&token).await;
            }
        });
    }

    fn accept_admin(self: &Arc<Self>, transport: Transport, ip: String) -> Arc<Connection> {
        let hub = Arc::downgrade(self);
        let rendering = hub.clone();
        let admin = Connection::open(
            Role::Admin,
            ip,
            transport,
            self.changes.clone(),
            move |_| AdminMethods::new(hub),
            move |_| {
                rendering
                    .upgrade()
                    .map(|hub| views::admin(&hub))
                    .unwrap_or_default()
            },
        );
        if let Some(removal) = self.register(&self.admins, &admin) {
            log::info!("Admin connected from {}", admin.ip());
            admin.rpc().on_close(move || removal.remove());
        }
        admin
    }

    fn register(&self, registry: &Registry<String, Arc<Connection>>, connection: &Arc<Connection>) -> Option<Removal> {
        match registry.add(connection.id().to_string(), connection.clone()) {
            Ok(removal) => Some(removal),
            Err(e) => {
                log::error!("Cannot register {} {}: {e}", connection.role(), connection.short_id());
                connection.close(NO_RECONNECT);
                None
            }
        }
    }

    /// Activity entries for changes in an emitter's replicated state.
    fn log_emitter_changes(&self, emitter: &Arc<Connection>) {
        let short_id = emitter.short_id();
        let devices = json!({ "audioinput": {}, "videoinput": {} });
        let fields: [(&'static str, &'static str, Value); 4] = [
            ("emitterDevices", "/mediaDevices", devices),
            ("emitterStreamConfig", "/streamConfig", Value::Null),
            ("emitterResolution", "/videoResolution", Value::Null),
            ("emitterRecording", "/recording/name", Value::Null),
        ];
        for (kind, pointer, initial) in fields {
            let peer = Arc::downgrade(emitter);
            let fallback = initial.clone();
            let value = move || {
                peer
                    .upgrade()
                    .and_then(|emitter| emitter.inbound().pointer(pointer).cloned())
                    .unwrap_or_else(|| fallback.clone())
            };
            emitter.add_reaction(self.log_changes(kind, short_id, initial, value));
        }
    }

    /// Activity entries for changes on a receiver, filed under its emitter.
    fn log_receiver_changes(&self, receiver: &Arc<Connection>, emitter_short_id: &str) {
        let peer = Arc::downgrade(receiver);
        let transform = move || {
            peer
                .upgrade()
                .and_then(|receiver| receiver.transform_image())
                .unwrap_or(Value::Null)
        };
        receiver.add_reaction(self.log_changes("transformImage", emitter_short_id, Value::Null, transform));

        let peer = Arc::downgrade(receiver);
        let obs_active = move || {
            let active = peer
                .upgrade()
                .and_then(|receiver| receiver.inbound().get("obsActive").and_then(Value::as_bool))
                .unwrap_or(false);
            Value::Bool(active)
        };
        receiver.add_reaction(self.log_changes(
            "receiverObsActive",
            emitter_short_id,
            Value::Bool(false),
            obs_active,
        ));

        for (kind, pointer) in [
            ("receiverViewport", "/viewport"),
            ("receiverRecording", "/recording/name"),
        ] {
            let peer = Arc::downgrade(receiver);
            let value = move || {
                peer
                    .upgrade()
                    .and_then(|receiver| receiver.inbound().pointer(pointer).cloned())
                    .unwrap_or(Value::Null)
            };
            receiver.add_reaction(self.log_changes(kind, emitter_short_id, Value::Null, value));
        }
    }

    /// Record `{type: kind, id, value}` whenever `value` moves away from the
    /// last recorded value, which starts at `initial`.
    fn log_changes<F>(&self, kind: &'static str, short_id: &str, initial: Value, value: F) -> SerialDerivation
    where
        F: Fn() -> Value + Send + 'static,
    {
        let input = computed(self.changes.subscribe(), value);
        let activity = self.activity.clone();
        let short_id = short_id.to_string();
        let mut last = initial;
        SerialDerivation::spawn(format!("{kind} {short_id}"), input, move |value, _abort| {
            if value != last {
                log::debug!("{kind} of {short_id}: {value}");
                activity.record(kind, json!({ "id": short_id, "value": value }));
                last = value;
            }
            std::future::ready(Ok(()))
        })
    }
}

async fn stop_all(reactions: Vec<SerialDerivation>) {
    for reaction in reactions {
        reaction.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::ActiveScenes;
    use crate::transport::{Outgoing, SocketEnd};
    use tokio::time::{timeout, Duration};

    fn hub_with_scenes() -> (Arc<Hub>, Arc<ActiveScenes>) {
        let scenes = Arc::new(ActiveScenes::new());
        let hub = Hub::new(ServerConfig::default(), scenes.clone(), ActivityLog::disabled());
        (hub, scenes)
    }

    async fn expect_close(end: &mut SocketEnd) -> u16 {
        loop {
            let frame = timeout(Duration::from_secs(1), end.outgoing.recv())
                .await
                .unwrap()
                .unwrap();
            if let Outgoing::Close(code) = frame {
                return code;
            }
        }
    }

    #[test]
    fn test_route_classification() {
        let (hub, _) = hub_with_scenes();
        assert_eq!(hub.route("/emitter/"), Route::Emitter);
        assert_eq!(hub.route("/admin/"), Route::Admin);
        assert_eq!(
            hub.route("/receiver/abc"),
            Route::Receiver {
                emitter_id: "abc".into()
            }
        );
        assert_eq!(hub.route("/emitter/extra"), Route::Refused);
        assert_eq!(hub.route("/"), Route::Refused);
    }

    #[tokio::test]
    async fn test_unknown_path_closed_with_3001() {
        let (hub, _) = hub_with_scenes();
        let (transport, mut end) = Transport::channel();
        assert!(hub.accept("/nowhere", transport, "127.0.0.1".into()).is_none());
        assert_eq!(expect_close(&mut end).await, NO_RECONNECT);
    }

    #[tokio::test]
    async fn test_receiver_refused_for_unknown_or_paired_emitter() {
        let (hub, scenes) = hub_with_scenes();
        let (transport, mut unknown) = Transport::channel();
        assert!(hub.accept("/receiver/missing", transport, "10.0.0.9".into()).is_none());
        assert_eq!(expect_close(&mut unknown).await, NO_RECONNECT);

        let (transport, _emitter_end) = Transport::channel();
        let emitter = hub.accept("/emitter/", transport, "10.0.0.1".into()).unwrap();
        assert_eq!(scenes.snapshot().len(), 1);

        let path = format!("/receiver/{}", emitter.id());
        let (transport, _first_end) = Transport::channel();
        let first = hub.accept(&path, transport, "10.0.0.2".into()).unwrap();
        assert!(emitter.is_linked_to(&first));
        assert!(first.is_linked_to(&emitter));

        let (transport, mut second_end) = Transport::channel();
        assert!(hub.accept(&path, transport, "10.0.0.3".into()).is_none());
        assert_eq!(expect_close(&mut second_end).await, NO_RECONNECT);
        assert!(emitter.is_linked_to(&first));
        assert_eq!(hub.receivers().len(), 1);
    }

    #[tokio::test]
    async fn test_emitter_close_releases_receiver() {
        let (hub, scenes) = hub_with_scenes();
        let (transport, emitter_end) = Transport::channel();
        let emitter = hub.accept("/emitter/", transport, "10.0.0.1".into()).unwrap();
        let (transport, mut receiver_end) = Transport::channel();
        let receiver = hub
            .accept(&format!("/receiver/{}", emitter.id()), transport, "10.0.0.2".into())
            .unwrap();

        drop(emitter_end);
        timeout(Duration::from_secs(1), emitter.rpc().closed()).await.unwrap();

        assert_eq!(expect_close(&mut receiver_end).await, NO_RECONNECT);
        assert!(receiver.remote_peer().is_none());
        assert!(hub.emitter(emitter.id()).is_none());
        assert!(scenes.snapshot().is_empty());
    }
}
