//! HTTP and WebSocket surface of the relay.
//!
//! Architecture:
//! ```text
//!                    ┌──────────────── RelayServer (axum) ────────────────┐
//!  WS upgrade ─────► │ socket pump ══ Transport ══ Hub::accept(path)      │
//!                    │   ▲ ping every heartbeat, drop if no pong          │
//!  PUT  <record>tok ►│ ChannelManager::consume    (resumable upload)      │
//!  POST <record>tok ►│ RecordingManager::ingest   (segmented recording)   │
//!  anything else ───►│ 404                                                │
//!                    └────────────────────────────────────────────────────┘
//! ```
//!
//! | Request                      | Outcome                                       |
//! |------------------------------|-----------------------------------------------|
//! | PUT, grant consumed          | 200 `{}`                                      |
//! | PUT, unknown or used token   | 404                                           |
//! | PUT, superseded or cancelled | 409                                           |
//! | PUT, offset past end of file | 416                                           |
//! | POST, missing headers        | 400                                           |
//! | POST, segment written        | 200 `{}` on the last one, else `{"url": ..}`  |
//! | I/O failure                  | 500                                           |

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::activity::ActivityLog;
use crate::channels::{ChannelError, RecordingError, SegmentHeader, SegmentOutcome};
use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::hub::Hub;
use crate::scene::{LogSceneSync, SceneSync};
use crate::transport::{Outgoing, SocketEnd, Transport};

/// The relay server.
pub struct RelayServer {
    hub: Arc<Hub>,
}

impl RelayServer {
    /// Create a server that logs scene changes and opens the configured
    /// activity log.
    pub fn new(config: ServerConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let activity = match &config.activity_log {
            Some(path) => ActivityLog::open(path)?,
            None => ActivityLog::disabled(),
        };
        Ok(Self::with_parts(config, Arc::new(LogSceneSync), activity))
    }

    /// Create a server with an explicit scene hook and activity log.
    pub fn with_parts(config: ServerConfig, scenes: Arc<dyn SceneSync>, activity: ActivityLog) -> Self {
        Self {
            hub: Hub::new(config, scenes, activity),
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Every request goes through one fallback handler; paths are configured
    /// at runtime.
    pub fn router(&self) -> Router {
        Router::new().fallback(dispatch).with_state(self.hub.clone())
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.hub.config().bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        let config = self.hub.config();
        log::info!("Relay listening on {local}");
        for path in &config.emitter_paths {
            log::info!("Emitter URL: http://{local}{path}");
        }
        for path in &config.admin_paths {
            log::info!("Admin URL: http://{local}{path}");
        }

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
        log::info!("Relay stopped");
        Ok(())
    }
}

async fn dispatch(
    State(hub): State<Arc<Hub>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    upgrade: Option<WebSocketUpgrade>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = uri.path();

    if let Some(upgrade) = upgrade {
        let ip = connect_info
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_default();
        let path = path.to_string();
        let heartbeat = hub.config().heartbeat_interval();
        return upgrade
            .on_upgrade(move |socket| async move {
                let (transport, end) = Transport::channel();
                hub.accept(&path, transport, ip);
                pump(socket, end, heartbeat).await;
            })
            .into_response();
    }

    if let Some(token) = path.strip_prefix(hub.config().record_prefix.as_str()) {
        if method == Method::PUT {
            return upload(&hub, token, body).await;
        }
        if method == Method::POST {
            return record(&hub, token, &headers, body).await;
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

async fn upload(hub: &Hub, token: &str, body: Body) -> Response {
    match hub.uploads().consume(token, body.into_data_stream()).await {
        Ok(written) => {
            log::debug!("Upload finished after {written} bytes");
            Json(json!({})).into_response()
        }
        Err(e) => {
            let status = channel_status(&e);
            log::info!("Upload rejected with {status}: {e}");
            error_response(status, &e)
        }
    }
}

async fn record(hub: &Hub, token: &str, headers: &HeaderMap, body: Body) -> Response {
    let recordings = hub.recordings();
    if !recordings.contains(token) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let header = SegmentHeader::parse(|name| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });
    let header = match header {
        Ok(header) => header,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };

    match recordings.ingest(token, &header, body.into_data_stream()).await {
        Ok(SegmentOutcome::Finished) => Json(json!({})).into_response(),
        Ok(SegmentOutcome::Continue { token }) => {
            let url = format!("{}{token}", hub.config().record_prefix);
            Json(json!({ "url": url })).into_response()
        }
        Err(e) => {
            let status = match &e {
                RecordingError::UnknownToken => StatusCode::NOT_FOUND,
                RecordingError::InvalidHeader(_) => StatusCode::BAD_REQUEST,
                RecordingError::Finished => StatusCode::CONFLICT,
                RecordingError::Channel(e) => channel_status(e),
            };
            log::info!("Recording segment rejected with {status}: {e}");
            error_response(status, &e)
        }
    }
}

fn channel_status(error: &ChannelError) -> StatusCode {
    match error {
        ChannelError::UnknownGrant => StatusCode::NOT_FOUND,
        ChannelError::Superseded(_) => StatusCode::CONFLICT,
        ChannelError::OffsetBeyondEnd { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        ChannelError::InvalidName(_) | ChannelError::Body(_) => StatusCode::BAD_REQUEST,
        ChannelError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, error: &dyn std::error::Error) -> Response {
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

/// Move frames between an upgraded socket and the engine's transport.
async fn pump(socket: WebSocket, mut end: SocketEnd, heartbeat: Duration) {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let mut answered = true;

    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if end.incoming.send(text).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => answered = true,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    log::debug!("WebSocket error: {e}");
                    break;
                }
                _ => {}
            },

            // Outgoing frame queued by the engine
            frame = end.outgoing.recv() => match frame {
                Some(Outgoing::Text(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close(code)) => {
                    let frame = CloseFrame { code, reason: Cow::Borrowed("") };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },

            _ = ticker.tick() => {
                if !answered {
                    log::info!("Terminating socket that missed a heartbeat");
                    break;
                }
                answered = false;
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    // Dropping `end` tells the engine the socket is gone.
}
