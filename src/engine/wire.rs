//! Engine WebSocket protocol. Messages are JSON envelopes `{"op": n, "d": ...}`
//! in the obs-websocket v5 shape: the server greets with Hello, the client
//! answers Identify, then requests and events flow over the same socket.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const RPC_VERSION: u32 = 1;

pub const OP_HELLO: u8 = 0;
pub const OP_IDENTIFY: u8 = 1;
pub const OP_IDENTIFIED: u8 = 2;
pub const OP_EVENT: u8 = 5;
pub const OP_REQUEST: u8 = 6;
pub const OP_REQUEST_RESPONSE: u8 = 7;

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub op: u8,
    pub d: Value,
}

/// First message from the engine after the socket opens.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthChallenge>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identify {
    pub rpc_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identified {
    pub negotiated_rpc_version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_type: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_data: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request_type: String,
    pub request_id: String,
    pub request_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    pub result: bool,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl RequestStatus {
    pub fn ok() -> Self {
        Self {
            result: true,
            code: 100,
            comment: None,
        }
    }

    pub fn failed(code: u16, comment: impl Into<String>) -> Self {
        Self {
            result: false,
            code,
            comment: Some(comment.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub event_data: Value,
}

// Event payloads the daemon reacts to.

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneChanged {
    pub scene_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputStateChanged {
    pub output_active: bool,
}

// Response payloads for the snapshot and visibility requests.

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentScene {
    pub current_program_scene_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputStatus {
    pub output_active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneItemId {
    pub scene_item_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneList {
    pub scenes: Vec<SceneEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneEntry {
    pub scene_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputList {
    pub inputs: Vec<InputEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEntry {
    pub input_name: String,
}

/// Serialize a payload into envelope text for the given opcode.
pub fn encode<T: Serialize>(op: u8, payload: &T) -> serde_json::Result<String> {
    let envelope = Envelope {
        op,
        d: serde_json::to_value(payload)?,
    };
    serde_json::to_string(&envelope)
}

pub fn decode(text: &str) -> serde_json::Result<Envelope> {
    serde_json::from_str(text)
}

/// Challenge response: `b64(sha256(b64(sha256(password + salt)) + challenge))`.
pub fn auth_token(password: &str, challenge: &str, salt: &str) -> String {
    let secret = BASE64.encode(Sha256::digest(format!("{password}{salt}")));
    BASE64.encode(Sha256::digest(format!("{secret}{challenge}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let text = encode(
            OP_REQUEST,
            &Request {
                request_type: "ToggleRecord".to_string(),
                request_id: "7".to_string(),
                request_data: None,
            },
        )
        .unwrap();
        let envelope = decode(&text).unwrap();
        assert_eq!(envelope.op, OP_REQUEST);
        let request: Request = serde_json::from_value(envelope.d).unwrap();
        assert_eq!(request.request_type, "ToggleRecord");
        assert_eq!(request.request_id, "7");
        assert!(request.request_data.is_none());
    }

    #[test]
    fn scene_and_input_lists_decode_from_engine_shape() {
        let list: SceneList = serde_json::from_str(
            r#"{"currentProgramSceneName":"Main","scenes":[{"sceneName":"Main","sceneIndex":1},{"sceneName":"Intro","sceneIndex":0}]}"#,
        )
        .unwrap();
        let names: Vec<_> = list.scenes.iter().map(|s| s.scene_name.as_str()).collect();
        assert_eq!(names, ["Main", "Intro"]);

        let list: InputList = serde_json::from_str(
            r#"{"inputs":[{"inputName":"Mic/Aux","inputKind":"wasapi_input_capture"}]}"#,
        )
        .unwrap();
        assert_eq!(list.inputs[0].input_name, "Mic/Aux");
    }

    #[test]
    fn hello_with_and_without_challenge() {
        let plain: Hello = serde_json::from_str(r#"{"rpcVersion":1}"#).unwrap();
        assert_eq!(plain.rpc_version, 1);
        assert!(plain.authentication.is_none());

        let auth: Hello = serde_json::from_str(
            r#"{"rpcVersion":1,"authentication":{"challenge":"c","salt":"s"}}"#,
        )
        .unwrap();
        let challenge = auth.authentication.unwrap();
        assert_eq!(challenge.challenge, "c");
        assert_eq!(challenge.salt, "s");
    }

    #[test]
    fn identify_omits_empty_authentication() {
        let text = encode(
            OP_IDENTIFY,
            &Identify {
                rpc_version: RPC_VERSION,
                authentication: None,
            },
        )
        .unwrap();
        assert!(!text.contains("authentication"));
        assert!(text.contains("\"rpcVersion\":1"));
    }

    #[test]
    fn auth_token_matches_known_vector() {
        // Both stages are plain sha256 + base64; a fixed input must be stable.
        let token = auth_token("supersecret", "challenge123", "salt456");
        assert_eq!(token, auth_token("supersecret", "challenge123", "salt456"));
        assert_ne!(token, auth_token("wrongpass", "challenge123", "salt456"));
        assert_ne!(token, auth_token("supersecret", "other", "salt456"));
        // 32 bytes of digest encode to 44 base64 chars.
        assert_eq!(token.len(), 44);
    }

    #[test]
    fn event_payload_decodes() {
        let envelope = decode(
            r#"{"op":5,"d":{"eventType":"CurrentProgramSceneChanged","eventData":{"sceneName":"Intro"}}}"#,
        )
        .unwrap();
        assert_eq!(envelope.op, OP_EVENT);
        let event: Event = serde_json::from_value(envelope.d).unwrap();
        assert_eq!(event.event_type, "CurrentProgramSceneChanged");
        let data: SceneChanged = serde_json::from_value(event.event_data).unwrap();
        assert_eq!(data.scene_name, "Intro");
    }

    #[test]
    fn failed_status_carries_comment() {
        let status = RequestStatus::failed(600, "no such scene");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["result"], false);
        assert_eq!(json["code"], 600);
        assert_eq!(json["comment"], "no such scene");
    }
}
