//! Bidirectional RPC engine with state replication.
//!
//! ```text
//!                 ┌──────────────────── RpcEngine ───────────────────┐
//!  Transport ───► │ read loop ─┬─ $patch ──► inbound document (watch) │
//!                 │            ├─ request ─► Methods::call (task)     │
//!                 │            └─ response ► pending[id] (oneshot)    │
//!  Transport ◄─── │ replicator ◄─ diff(sent, outbound)  (watch)       │
//!                 └───────────────────────────────────────────────────┘
//! ```
//!
//! Both sides of a connection run the same engine: each can call the other,
//! and each replicates a JSON document to the other as successive patches.
//!
//! When the transport closes the engine runs the registered close hooks
//! first, then fails every pending call with [`RpcError::ConnectionClosed`].
//! Hooks therefore observe the close before any awaiting caller does.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::patch::{self, Operation};
use crate::protocol::{self, Envelope, RemoteError, STATE_PATCH_METHOD};
use crate::transport::{Transport, TransportSender};

/// Boxed error returned by method handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("{} (code {})", .0.message, .0.code)]
    Remote(RemoteError),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Serialization(e.to_string())
    }
}

/// A local method table.
///
/// `resolve` maps a wire name onto the table's own method enum; names that
/// do not resolve are answered with "Method not found".
pub trait Methods: Send + Sync + 'static {
    type Method: Copy + Send + std::fmt::Debug + 'static;

    fn resolve(&self, name: &str) -> Option<Self::Method>;

    fn call(&self, method: Self::Method, params: Value) -> BoxFuture<'static, Result<Value, BoxError>>;
}

/// Method table that exposes nothing.
pub struct NoMethods;

impl Methods for NoMethods {
    type Method = std::convert::Infallible;

    fn resolve(&self, _name: &str) -> Option<Self::Method> {
        None
    }

    fn call(&self, method: Self::Method, _params: Value) -> BoxFuture<'static, Result<Value, BoxError>> {
        match method {}
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

struct PendingCalls {
    closed: bool,
    next_id: u64,
    calls: HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>,
}

struct Shared {
    sender: TransportSender,
    pending: Mutex<PendingCalls>,
    close_hooks: Mutex<Option<Vec<CloseHook>>>,
    closed: CancellationToken,
}

impl Shared {
    fn respond(&self, id: u64, outcome: Result<Value, RemoteError>) {
        match protocol::encode_response(id, outcome) {
            Ok(text) => {
                self.sender.send(text);
            }
            Err(e) => log::error!("failed to encode response {id}: {e}"),
        }
    }

    fn resolve(&self, id: u64, outcome: Result<Value, RpcError>) {
        let waiter = self.pending.lock().calls.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => log::debug!("dropping response for unknown call {id}"),
        }
    }

    fn shutdown(&self) {
        let hooks = self.close_hooks.lock().take().unwrap_or_default();
        for hook in hooks {
            hook();
        }
        let calls = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.calls)
        };
        for (_, tx) in calls {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
        self.closed.cancel();
    }
}

/// Handle for calling the remote side of a connection.
#[derive(Clone)]
pub struct RpcPeer {
    shared: Arc<Shared>,
}

impl RpcPeer {
    /// Call `method` on the remote side and await its result.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return Err(RpcError::ConnectionClosed);
            }
            pending.next_id += 1;
            let id = pending.next_id;
            pending.calls.insert(id, tx);
            id
        };
        let text = match protocol::encode_request(method, params, Some(id)) {
            Ok(text) => text,
            Err(e) => {
                self.shared.pending.lock().calls.remove(&id);
                return Err(e.into());
            }
        };
        // A failed send means the socket is gone; the read loop rejects the
        // call once it has run the close hooks.
        self.shared.sender.send(text);
        rx.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    /// Send `method` without expecting an answer.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let text = protocol::encode_request(method, params, None)?;
        if self.shared.sender.send(text) {
            Ok(())
        } else {
            Err(RpcError::ConnectionClosed)
        }
    }

    /// Register `hook` to run when the transport closes.
    ///
    /// Runs immediately if the connection is already closed.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.shared.close_hooks.lock();
        match hooks.as_mut() {
            Some(list) => list.push(Box::new(hook)),
            None => {
                drop(hooks);
                hook();
            }
        }
    }

    /// Ask the socket to close with `code`.
    pub fn close(&self, code: u16) {
        self.shared.sender.close(code);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the engine has finished its close handling.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().calls.len()
    }
}

/// Entry point for running an engine over a transport.
pub struct RpcEngine;

impl RpcEngine {
    /// Start the engine.
    ///
    /// `outbound` is replicated to the remote side; the returned receiver
    /// holds the document the remote side replicates to us, starting at
    /// `null`.
    pub fn start<M: Methods>(
        methods: Arc<M>,
        transport: Transport,
        outbound: watch::Receiver<Value>,
    ) -> (RpcPeer, watch::Receiver<Value>) {
        let (sender, incoming) = transport.into_parts();
        let shared = Arc::new(Shared {
            sender,
            pending: Mutex::new(PendingCalls {
                closed: false,
                next_id: 0,
                calls: HashMap::new(),
            }),
            close_hooks: Mutex::new(Some(Vec::new())),
            closed: CancellationToken::new(),
        });
        let (inbound_tx, inbound_rx) = watch::channel(Value::Null);

        tokio::spawn(read_loop(shared.clone(), methods, incoming, inbound_tx));
        tokio::spawn(replicate(shared.clone(), outbound));

        (RpcPeer { shared }, inbound_rx)
    }
}

async fn read_loop<M: Methods>(
    shared: Arc<Shared>,
    methods: Arc<M>,
    mut incoming: mpsc::UnboundedReceiver<String>,
    inbound: watch::Sender<Value>,
) {
    while let Some(text) = incoming.recv().await {
        let Some(envelope) = protocol::decode(&text) else {
            log::trace!("dropping malformed frame ({} bytes)", text.len());
            continue;
        };
        match envelope {
            Envelope::Request { method, params, .. } if method == STATE_PATCH_METHOD => {
                apply_patch(&inbound, params);
            }
            Envelope::Request { method, params, id } => {
                dispatch(&shared, &methods, method, params, id);
            }
            Envelope::Response { id, outcome } => {
                shared.resolve(id, outcome.map_err(RpcError::Remote));
            }
        }
    }
    shared.shutdown();
}

fn apply_patch(inbound: &watch::Sender<Value>, params: Value) {
    let ops: Vec<Operation> = match serde_json::from_value(params) {
        Ok(ops) => ops,
        Err(e) => {
            log::warn!("ignoring malformed state patch: {e}");
            return;
        }
    };
    let mut next = inbound.borrow().clone();
    if let Err(e) = patch::apply(&mut next, &ops) {
        log::warn!("ignoring state patch that does not apply: {e}");
        return;
    }
    inbound.send_if_modified(|current| {
        if *current != next {
            *current = next;
            true
        } else {
            false
        }
    });
}

fn dispatch<M: Methods>(
    shared: &Arc<Shared>,
    methods: &Arc<M>,
    name: String,
    params: Value,
    id: Option<u64>,
) {
    let Some(method) = methods.resolve(&name) else {
        log::debug!("unknown method {name:?}");
        if let Some(id) = id {
            shared.respond(id, Err(RemoteError::method_not_found()));
        }
        return;
    };
    let call = methods.call(method, params);
    let shared = shared.clone();
    tokio::spawn(async move {
        let outcome = call.await;
        match (id, outcome) {
            (Some(id), Ok(value)) => shared.respond(id, Ok(value)),
            (Some(id), Err(e)) => {
                log::debug!("{method:?} failed: {e}");
                shared.respond(id, Err(RemoteError::handler_failure(e.to_string())));
            }
            (None, Err(e)) => log::debug!("{method:?} notification failed: {e}"),
            (None, Ok(_)) => {}
        }
    });
}

async fn replicate(shared: Arc<Shared>, mut outbound: watch::Receiver<Value>) {
    let mut sent = Value::Null;
    loop {
        let current = outbound.borrow_and_update().clone();
        let ops = patch::diff(&sent, &current);
        if !ops.is_empty() {
            let text = serde_json::to_value(&ops)
                .and_then(|params| protocol::encode_request(STATE_PATCH_METHOD, params, None));
            match text {
                Ok(text) => {
                    if !shared.sender.send(text) {
                        break;
                    }
                    sent = current;
                }
                Err(e) => log::error!("failed to encode state patch: {e}"),
            }
        }
        tokio::select! {
            changed = outbound.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shared.closed.cancelled() => break,
        }
    }
}
