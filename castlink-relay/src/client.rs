//! WebSocket client for emitters, receivers and admin tools.
//!
//! A [`PeerClient`] owns a method table and an outbound document. Each
//! connection attempt starts a fresh [`RpcEngine`] over a tokio-tungstenite
//! socket; the table and the outbound document survive reconnects, so the
//! server sees the full state again as the first patch of every session.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_util::sync::CancellationToken;

use crate::rpc::{Methods, RpcEngine, RpcPeer};
use crate::signal::Signal;
use crate::transport::{Outgoing, SocketEnd, Transport, NO_RECONNECT};

/// Delay between a lost connection and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// One live connection.
pub struct PeerSession {
    pub rpc: RpcPeer,
    /// Document replicated by the server.
    pub inbound: watch::Receiver<Value>,
    pump: JoinHandle<Option<u16>>,
}

impl PeerSession {
    /// Wait for the socket to go away; yields the server's close code, if any.
    pub async fn finished(self) -> Option<u16> {
        self.pump.await.ok().flatten()
    }
}

/// Reconnecting RPC client.
pub struct PeerClient<M: Methods> {
    url: String,
    methods: Arc<M>,
    outbound: watch::Receiver<Value>,
    reconnect_delay: Duration,
    state: Signal<ConnectionState>,
}

impl<M: Methods> PeerClient<M> {
    pub fn new(url: impl Into<String>, methods: M, outbound: watch::Receiver<Value>) -> Self {
        Self {
            url: url.into(),
            methods: Arc::new(methods),
            outbound,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            state: Signal::new(ConnectionState::Disconnected),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open a single session.
    pub async fn connect(&self) -> Result<PeerSession, ClientError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (transport, end) = Transport::channel();
        let pump = tokio::spawn(pump(socket, end));
        let (rpc, inbound) = RpcEngine::start(self.methods.clone(), transport, self.outbound.clone());
        Ok(PeerSession { rpc, inbound, pump })
    }

    /// Keep a session open until `stop` fires or the server closes with
    /// [`NO_RECONNECT`]. `on_session` sees every new session.
    pub async fn run<F>(&self, stop: CancellationToken, mut on_session: F)
    where
        F: FnMut(&RpcPeer, watch::Receiver<Value>),
    {
        let mut attempt = ConnectionState::Connecting;
        loop {
            self.state.set(attempt);
            match self.connect().await {
                Ok(session) => {
                    self.state.set(ConnectionState::Connected);
                    log::info!("Connected to {}", self.url);
                    on_session(&session.rpc, session.inbound.clone());

                    let rpc = session.rpc.clone();
                    let code = tokio::select! {
                        code = session.finished() => code,
                        _ = stop.cancelled() => {
                            rpc.close(1000);
                            self.state.set(ConnectionState::Disconnected);
                            return;
                        }
                    };
                    self.state.set(ConnectionState::Disconnected);
                    if code == Some(NO_RECONNECT) {
                        log::info!("Server at {} asked us not to reconnect", self.url);
                        return;
                    }
                    log::info!("Connection to {} lost (code {code:?})", self.url);
                }
                Err(e) => {
                    self.state.set(ConnectionState::Disconnected);
                    log::warn!("{e}");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = stop.cancelled() => return,
            }
            attempt = ConnectionState::Reconnecting;
        }
    }
}

async fn pump<S>(socket: tokio_tungstenite::WebSocketStream<S>, mut end: SocketEnd) -> Option<u16>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if end.incoming.send(text.as_str().to_owned()).is_err() {
                        return None;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|frame| u16::from(frame.code));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("WebSocket error: {e}");
                    return None;
                }
                None => return None,
            },

            frame = end.outgoing.recv() => match frame {
                Some(Outgoing::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        return None;
                    }
                }
                Some(Outgoing::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Utf8Bytes::from_static(""),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    return None;
                }
                None => {
                    let _ = sink.close().await;
                    return None;
                }
            },
        }
    }
}
