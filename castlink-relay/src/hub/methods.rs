//! Methods peers may call on the relay.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};

use super::connection::{Connection, RecordAction};
use super::Hub;
use crate::channels::DestinationKey;
use crate::protocol::PeerCall;
use crate::rpc::{BoxError, Methods};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMethod {
    IceCandidate,
}

/// Emitter and receiver table: ICE candidates are relayed to the paired peer.
pub struct PeerMethods {
    connection: Weak<Connection>,
}

impl PeerMethods {
    pub fn new(connection: Weak<Connection>) -> Self {
        Self { connection }
    }
}

impl Methods for PeerMethods {
    type Method = PeerMethod;

    fn resolve(&self, name: &str) -> Option<PeerMethod> {
        match name {
            "iceCandidate" => Some(PeerMethod::IceCandidate),
            _ => None,
        }
    }

    fn call(&self, method: PeerMethod, params: Value) -> BoxFuture<'static, Result<Value, BoxError>> {
        let connection = self.connection.clone();
        async move {
            match method {
                PeerMethod::IceCandidate => {
                    let remote = connection.upgrade().and_then(|c| c.remote_peer());
                    match remote {
                        Some(remote) => {
                            remote.call(PeerCall::IceCandidate, params).await?;
                        }
                        None => log::trace!("dropping ICE candidate without a paired peer"),
                    }
                    Ok(Value::Null)
                }
            }
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminMethod {
    UploadFile,
    StopUpload,
    RemoveFile,
    ToggleRecording,
    TransformImage,
    ChangeStreamConfig,
}

impl AdminMethod {
    pub const ALL: [AdminMethod; 6] = [
        AdminMethod::UploadFile,
        AdminMethod::StopUpload,
        AdminMethod::RemoveFile,
        AdminMethod::ToggleRecording,
        AdminMethod::TransformImage,
        AdminMethod::ChangeStreamConfig,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            AdminMethod::UploadFile => "uploadFile",
            AdminMethod::StopUpload => "stopUpload",
            AdminMethod::RemoveFile => "removeFile",
            AdminMethod::ToggleRecording => "toggleRecording",
            AdminMethod::TransformImage => "transformImage",
            AdminMethod::ChangeStreamConfig => "changeStreamConfig",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadFileParams {
    emitter_id: String,
    file_name: String,
    #[serde(default)]
    start_byte: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileParams {
    emitter_id: String,
    file_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleRecordingParams {
    emitter_id: String,
    action: RecordAction,
    #[serde(default)]
    emitter: bool,
    #[serde(default)]
    receiver: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformImageParams {
    emitter_id: String,
    #[serde(default)]
    transform_image: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamConfigParams {
    emitter_id: String,
    #[serde(default)]
    stream_config: Value,
}

/// Admin table. Calls naming an emitter that is not connected do nothing.
pub struct AdminMethods {
    hub: Weak<Hub>,
}

impl AdminMethods {
    pub fn new(hub: Weak<Hub>) -> Self {
        Self { hub }
    }
}

impl Methods for AdminMethods {
    type Method = AdminMethod;

    fn resolve(&self, name: &str) -> Option<AdminMethod> {
        AdminMethod::ALL.into_iter().find(|method| method.name() == name)
    }

    fn call(&self, method: AdminMethod, params: Value) -> BoxFuture<'static, Result<Value, BoxError>> {
        let hub = self.hub.clone();
        async move {
            let Some(hub) = hub.upgrade() else {
                return Ok(Value::Null);
            };
            match method {
                AdminMethod::UploadFile => hub.upload_file(serde_json::from_value(params)?).await,
                AdminMethod::StopUpload => hub.stop_upload(serde_json::from_value(params)?),
                AdminMethod::RemoveFile => hub.remove_file(serde_json::from_value(params)?).await,
                AdminMethod::ToggleRecording => hub.toggle_recording(serde_json::from_value(params)?),
                AdminMethod::TransformImage => hub.transform_image(serde_json::from_value(params)?),
                AdminMethod::ChangeStreamConfig => {
                    hub.change_stream_config(serde_json::from_value(params)?).await
                }
            }
        }
        .boxed()
    }
}

impl Hub {
    async fn upload_file(self: Arc<Self>, params: UploadFileParams) -> Result<Value, BoxError> {
        let Some(emitter) = self.emitter(&params.emitter_id) else {
            return Ok(Value::Null);
        };
        let key = DestinationKey::new(emitter.short_id(), params.file_name.as_str());
        key.relative_path()?;
        let token = self.uploads().grant(key, params.start_byte);
        let upload_url = format!("{}{token}", self.config().record_prefix);
        log::info!(
            "Requesting {} from emitter {} at byte {}",
            params.file_name,
            emitter.short_id(),
            params.start_byte
        );
        emitter
            .call(
                PeerCall::UploadFile,
                json!({
                    "fileName": params.file_name,
                    "uploadURL": upload_url,
                    "startByte": params.start_byte,
                }),
            )
            .await?;
        Ok(Value::Null)
    }

    fn stop_upload(&self, params: FileParams) -> Result<Value, BoxError> {
        if let Some(emitter) = self.emitter(&params.emitter_id) {
            let key = DestinationKey::new(emitter.short_id(), params.file_name);
            if self.uploads().cancel(&key) {
                log::info!("Stopped upload of {key}");
            }
        }
        Ok(Value::Null)
    }

    async fn remove_file(self: Arc<Self>, params: FileParams) -> Result<Value, BoxError> {
        if let Some(emitter) = self.emitter(&params.emitter_id) {
            emitter
                .call(PeerCall::RemoveFile, json!({ "fileName": params.file_name }))
                .await?;
        }
        Ok(Value::Null)
    }

    fn toggle_recording(&self, params: ToggleRecordingParams) -> Result<Value, BoxError> {
        let Some(emitter) = self.emitter(&params.emitter_id) else {
            return Ok(Value::Null);
        };
        if params.emitter {
            emitter.update_record(params.action);
        }
        if params.receiver {
            if let Some(receiver) = emitter.remote_peer() {
                receiver.update_record(params.action);
            }
        }
        Ok(Value::Null)
    }

    fn transform_image(&self, params: TransformImageParams) -> Result<Value, BoxError> {
        if let Some(receiver) = self.emitter(&params.emitter_id).and_then(|e| e.remote_peer()) {
            receiver.set_transform_image(params.transform_image);
        }
        Ok(Value::Null)
    }

    async fn change_stream_config(self: Arc<Self>, params: StreamConfigParams) -> Result<Value, BoxError> {
        if let Some(emitter) = self.emitter(&params.emitter_id) {
            emitter
                .call(
                    PeerCall::ChangeStreamConfig,
                    json!({ "streamConfig": params.stream_config }),
                )
                .await?;
        }
        Ok(Value::Null)
    }
}
