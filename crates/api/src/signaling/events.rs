//! Signaling frames
//!
//! `{type, from?, to?, payload?}`. Relay frames are forwarded with `from` rewritten to
//! the authenticated sender; the payload is opaque.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Sender id on frames the relay generates itself
pub const SERVER_SENDER: &str = "server";

/// Frame types forwarded verbatim to `to`
pub const RELAY_TYPES: &[&str] = &[
    "offer",
    "answer",
    "ice-candidate",
    "conflict-resolution",
    "call-request",
    "call-response",
    "call-cancel",
    "call-end",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// Public STUN servers used when none are configured
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SignalFrame {
    fn new(kind: &str, from: Option<&str>, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            from: from.map(str::to_string),
            to: None,
            payload: Some(payload),
        }
    }

    pub fn registered(uid: &str, ice_servers: &[IceServer]) -> Self {
        Self::new("registered", Some(uid), json!({ "iceServers": ice_servers }))
    }

    pub fn client_list(uids: &[String]) -> Self {
        let clients: Vec<Value> = uids.iter().map(|id| json!({ "id": id })).collect();
        Self::new("client-list", None, json!({ "clients": clients }))
    }

    pub fn user_offline(uid: &str) -> Self {
        Self::new("user-offline", Some(SERVER_SENDER), json!({ "clientId": uid }))
    }

    pub fn is_relay(&self) -> bool {
        RELAY_TYPES.contains(&self.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_shape() {
        let frame = SignalFrame::registered("alice", &IceServer::defaults());
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "registered");
        assert_eq!(json["from"], "alice");
        assert!(json.get("to").is_none());
        assert_eq!(json["payload"]["iceServers"][0]["urls"][0], "stun:stun.l.google.com:19302");
        assert!(json["payload"]["iceServers"][0].get("username").is_none());
    }

    #[test]
    fn test_roster_and_offline_shapes() {
        let json = serde_json::to_value(SignalFrame::client_list(&["a".into(), "b".into()])).unwrap();
        assert_eq!(json, json!({"type": "client-list", "payload": {"clients": [{"id": "a"}, {"id": "b"}]}}));

        let json = serde_json::to_value(SignalFrame::user_offline("a")).unwrap();
        assert_eq!(json["from"], "server");
        assert_eq!(json["payload"]["clientId"], "a");
    }

    #[test]
    fn test_relay_types() {
        let frame: SignalFrame = serde_json::from_str(r#"{"type":"offer","to":"bob","payload":{"sdp":"x"}}"#).unwrap();
        assert!(frame.is_relay());
        let frame: SignalFrame = serde_json::from_str(r#"{"type":"list-clients"}"#).unwrap();
        assert!(!frame.is_relay());
    }
}
