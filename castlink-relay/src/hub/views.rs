//! State the relay replicates to each kind of peer.
//!
//! | Peer     | Reads from                                               |
//! |----------|----------------------------------------------------------|
//! | emitter  | config, own `record`, paired receiver's replicated state |
//! | receiver | config, own `record`/`transformImage`, emitter's state   |
//! | admin    | every emitter, its receiver, received files              |

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::connection::{Connection, Role};
use super::Hub;
use crate::channels::ReceivedFileInfo;
use crate::config::ServerConfig;
use crate::pairing::PairingState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmitterView<'a> {
    mode: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_constraints: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record_options: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<String>,
    #[serde(flatten)]
    receiver: Option<ReceiverToEmitter>,
}

/// Part of the receiver's state that its emitter sees.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiverToEmitter {
    obs_active: bool,
    recording_in_receiver: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReceiverView<'a> {
    mode: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    transform_image: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    record_options: Option<&'a Value>,
    #[serde(rename = "recordURL", skip_serializing_if = "Option::is_none")]
    record_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_delay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    round_trip_time: Option<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminView<'a> {
    mode: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_constraints: Option<&'a Value>,
    emitters: BTreeMap<String, EmitterAdminInfo>,
    files: BTreeMap<String, ReceivedFileInfo>,
}

/// One emitter as admins see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitterAdminInfo {
    pub emitter_short_id: String,
    #[serde(rename = "emitterIP")]
    pub emitter_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emitter_info: Option<Value>,
    #[serde(rename = "receiverIP", skip_serializing_if = "Option::is_none")]
    pub receiver_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing: Option<PairingState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform_image: Option<Value>,
}

impl EmitterAdminInfo {
    pub fn of(emitter: &Connection) -> Self {
        let receiver = emitter.remote_peer();
        Self {
            emitter_short_id: emitter.short_id().to_string(),
            emitter_ip: emitter.ip().to_string(),
            emitter_info: present(emitter.inbound()),
            receiver_ip: receiver.as_ref().map(|r| r.ip().to_string()),
            receiver_info: receiver.as_ref().and_then(|r| present(r.inbound())),
            pairing: receiver.as_ref().map(|r| r.pairing_state()),
            transform_image: receiver.as_ref().and_then(|r| r.transform_image()),
        }
    }
}

fn present(value: Value) -> Option<Value> {
    (!value.is_null()).then_some(value)
}

/// JavaScript-style truthiness of a replicated field.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

pub(crate) fn emitter(config: &ServerConfig, connection: &Connection) -> Value {
    let receiver = connection
        .remote_peer()
        .map(|receiver| receiver.inbound())
        .and_then(present)
        .map(|data| ReceiverToEmitter {
            obs_active: truthy(data.get("obsActive")),
            recording_in_receiver: truthy(data.get("recording")),
        });
    let view = EmitterView {
        mode: Role::Emitter,
        media_constraints: config.media_constraints.as_ref(),
        record_options: config.record_options.as_ref(),
        record: connection.record(),
        receiver,
    };
    serde_json::to_value(view).unwrap_or_default()
}

pub(crate) fn receiver(config: &ServerConfig, connection: &Connection) -> Value {
    let round_trip_time = connection
        .remote_peer()
        .and_then(|emitter| emitter.inbound().get("roundTripTime").cloned())
        .and_then(present);
    let view = ReceiverView {
        mode: Role::Receiver,
        transform_image: connection.transform_image(),
        record: connection.record(),
        record_options: config.record_options.as_ref(),
        record_url: connection
            .record_url()
            .map(|token| format!("{}{token}", config.record_prefix)),
        target_delay: config.target_delay,
        round_trip_time,
    };
    serde_json::to_value(view).unwrap_or_default()
}

pub(crate) fn admin(hub: &Hub) -> Value {
    let emitters = hub
        .emitters()
        .iter()
        .map(|emitter| (emitter.id().to_string(), EmitterAdminInfo::of(emitter)))
        .collect();
    let view = AdminView {
        mode: Role::Admin,
        media_constraints: hub.config().media_constraints.as_ref(),
        emitters,
        files: hub.uploads().files().snapshot(),
    };
    serde_json::to_value(view).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!truthy(None));
        assert!(!truthy(Some(&json!(null))));
        assert!(!truthy(Some(&json!(0))));
        assert!(!truthy(Some(&json!(""))));
        assert!(truthy(Some(&json!({"name": "rec.webm"}))));
        assert!(truthy(Some(&json!(true))));
    }

    #[test]
    fn test_admin_info_field_names() {
        let info = EmitterAdminInfo {
            emitter_short_id: "abc".into(),
            emitter_ip: "10.0.0.1".into(),
            emitter_info: None,
            receiver_ip: Some("10.0.0.2".into()),
            receiver_info: None,
            pairing: Some(PairingState::Active),
            transform_image: None,
        };
        assert_eq!(
            serde_json::to_value(info).unwrap(),
            json!({
                "emitterShortId": "abc",
                "emitterIP": "10.0.0.1",
                "receiverIP": "10.0.0.2",
                "pairing": "active",
            })
        );
    }
}
