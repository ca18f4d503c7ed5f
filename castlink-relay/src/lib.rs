//! # castlink-relay: Signaling relay between media emitters and receivers
//!
//! Pairs an emitter (camera, microphone or screen source) with a receiver,
//! relays the WebRTC offer/answer/ICE exchange between them, and keeps
//! every peer informed of the other's live status through replicated JSON
//! documents. Uploads and segmented recordings land in the recordings
//! folder through resumable byte channels.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌──────────────────────────────┐    WebSocket    ┌─────────────┐
//! │ emitter     │ ◄──────────────► │ RelayServer ── Hub           │ ◄─────────────► │ receiver    │
//! │ (PeerClient)│  JSON-RPC+$patch │   │  Registry×3 (E / R / A)  │ JSON-RPC+$patch │ (PeerClient)│
//! └─────────────┘                  │   │  Pair ─ SerialDerivation │                 └─────────────┘
//!        │ PUT upload              │   ▼                          │       POST segment    │
//!        └───────────────────────► │ ChannelManager / Recordings  │ ◄─────────────────────┘
//!                                  └──────────────┬───────────────┘
//!                                                 │ views
//!                                           ┌─────┴─────┐
//!                                           │ admin     │
//!                                           └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`rpc`]: request/response correlation plus differential state push
//! - [`patch`]: JSON diff and patch application
//! - [`derive`]: serialized, cancellable async reactions
//! - [`registry`]: id-keyed connection sets with change notification
//! - [`pairing`]: emitter/receiver session handshake
//! - [`channels`]: resumable uploads and segmented recordings
//! - [`hub`]: connection acceptance, views and admin methods
//! - [`server`]: axum HTTP/WebSocket surface
//! - [`client`]: reconnecting tokio-tungstenite peer

pub mod activity;
pub mod channels;
pub mod client;
pub mod config;
pub mod derive;
pub mod error;
pub mod hub;
pub mod ids;
pub mod pairing;
pub mod patch;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod scene;
pub mod server;
pub mod signal;
pub mod transport;

// Re-exports for convenience
pub use activity::ActivityLog;
pub use channels::{ChannelError, ChannelManager, DestinationKey, RecordingManager, ReceivedFiles};
pub use client::{ClientError, ConnectionState, PeerClient, PeerSession};
pub use config::{ConfigError, ConfigOverrides, ServerConfig};
pub use derive::{AbortSignal, ReactionError, SerialDerivation};
pub use error::RelayError;
pub use hub::{Connection, Hub, Role, Route};
pub use pairing::{Pair, PairingState};
pub use patch::{Operation, PatchError};
pub use protocol::{PeerCall, RemoteError};
pub use registry::{Registry, RegistryError};
pub use rpc::{BoxError, Methods, NoMethods, RpcEngine, RpcError, RpcPeer};
pub use scene::{LogSceneSync, SceneSync};
pub use server::RelayServer;
pub use signal::{Invalidation, Signal};
pub use transport::{Transport, NO_RECONNECT};
