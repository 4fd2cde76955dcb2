//! JSON envelope of the signalling protocol.
//!
//! Requests are `{id, method, params}`; replies echo `id` and `method`.
//! Server-initiated messages use method `broadcast` and a fresh random id.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_LOGIN: &str = "login";
pub const METHOD_SUBSCRIBE: &str = "subscribe";
pub const METHOD_SDP_EXCHANGE: &str = "sdp-exchange";
pub const METHOD_BROADCAST: &str = "broadcast";

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct Envelope<'a, P: Serialize> {
    pub id: &'a Value,
    pub method: &'a str,
    pub params: P,
}

impl Request {
    pub fn reply<P: Serialize>(&self, params: P) -> serde_json::Result<String> {
        serde_json::to_string(&Envelope {
            id: &self.id,
            method: &self.method,
            params,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginParams {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LoginReply {
    Success {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "usersList")]
        users_list: Vec<String>,
    },
    Error {
        reason: String,
    },
}

/// A MID may arrive as a JSON number or string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MidParam {
    Text(String),
    Number(u64),
}

impl MidParam {
    pub fn as_mid(&self) -> String {
        match self {
            MidParam::Text(s) => s.clone(),
            MidParam::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    pub producer_id: String,
    pub audio_mid: MidParam,
    pub video_mid: MidParam,
}

/// An RTCSessionDescriptionInit.
#[derive(Debug, Deserialize)]
pub struct OfferParams {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub sdp: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SdpReply {
    Answer { sdp: String },
    Error { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserDetails {
    #[serde(rename = "userId")]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BroadcastEvent {
    UserJoined {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "userDetails")]
        user_details: UserDetails,
    },
    UserLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

/// Five lowercase alphanumerics, like client-side ids.
pub fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

pub fn broadcast(event: &BroadcastEvent) -> serde_json::Result<String> {
    serde_json::to_string(&Envelope {
        id: &Value::String(random_id()),
        method: METHOD_BROADCAST,
        params: event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_echoes_id_and_method() {
        let req: Request =
            serde_json::from_str(r#"{"id":"abc","method":"login","params":{"userId":"u1"}}"#)
                .unwrap();
        let params: LoginParams = serde_json::from_value(req.params.clone()).unwrap();
        assert_eq!(params.user_id.as_deref(), Some("u1"));

        let reply = req
            .reply(LoginReply::Success {
                user_id: "u1".into(),
                users_list: vec!["u0".into()],
            })
            .unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "abc",
                "method": "login",
                "params": {"status": "success", "userId": "u1", "usersList": ["u0"]}
            })
        );
    }

    #[test]
    fn test_subscribe_mids_number_or_string() {
        let p: SubscribeParams = serde_json::from_value(json!({
            "producerId": "p", "audioMid": 0, "videoMid": "1"
        }))
        .unwrap();
        assert_eq!(p.audio_mid.as_mid(), "0");
        assert_eq!(p.video_mid.as_mid(), "1");
    }

    #[test]
    fn test_broadcast_shape() {
        let text = broadcast(&BroadcastEvent::UserLeft {
            user_id: "u1".into(),
        })
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["method"], "broadcast");
        assert_eq!(value["params"], json!({"type": "user-left", "userId": "u1"}));
        assert_eq!(value["id"].as_str().unwrap().len(), 5);

        let joined = serde_json::to_value(BroadcastEvent::UserJoined {
            user_id: "u2".into(),
            user_details: UserDetails {
                user_id: "u2".into(),
            },
        })
        .unwrap();
        assert_eq!(
            joined,
            json!({"type": "user-joined", "userId": "u2", "userDetails": {"userId": "u2"}})
        );
    }

    #[test]
    fn test_answer_reply_shape() {
        let value = serde_json::to_value(SdpReply::Answer { sdp: "v=0".into() }).unwrap();
        assert_eq!(value, json!({"type": "answer", "sdp": "v=0"}));
    }
}
