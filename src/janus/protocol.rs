//! Janus WebSocket API messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::webrtc::SessionDescription;

/// VideoRoom plugin package name
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

/// WebSocket sub-protocol Janus requires
pub const JANUS_PROTOCOL: &str = "janus-protocol";

/// New random transaction id
pub fn transaction_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Outgoing request
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Request {
    Create {
        transaction: String,
    },
    Attach {
        transaction: String,
        session_id: u64,
        plugin: String,
    },
    Message {
        transaction: String,
        session_id: u64,
        handle_id: u64,
        body: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<SessionDescription>,
    },
    Keepalive {
        transaction: String,
        session_id: u64,
    },
    Destroy {
        transaction: String,
        session_id: u64,
    },
}

impl Request {
    pub fn transaction(&self) -> &str {
        match self {
            Request::Create { transaction }
            | Request::Attach { transaction, .. }
            | Request::Message { transaction, .. }
            | Request::Keepalive { transaction, .. }
            | Request::Destroy { transaction, .. } => transaction,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Create { .. } => "create",
            Request::Attach { .. } => "attach",
            Request::Message { .. } => "message",
            Request::Keepalive { .. } => "keepalive",
            Request::Destroy { .. } => "destroy",
        }
    }
}

/// VideoRoom subscriber join body
pub fn join_subscriber_body(room: u64, feed: u64) -> Value {
    serde_json::json!({
        "request": "join",
        "ptype": "subscriber",
        "room": room,
        "feed": feed,
    })
}

/// VideoRoom start body, sent with the answer
pub fn start_body() -> Value {
    serde_json::json!({
        "request": "start",
        "trickle": false,
    })
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DataHolder {
    pub id: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PluginData {
    pub plugin: String,
    #[serde(default)]
    pub data: Value,
}

impl PluginData {
    /// Plugin level error (`error_code` / `error` in the data), if any
    pub fn error(&self) -> Option<(i64, String)> {
        let code = self.data.get("error_code")?.as_i64()?;
        let reason = self
            .data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((code, reason))
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

/// Incoming message
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Reply {
    Ack {
        #[serde(default)]
        transaction: Option<String>,
    },
    Success {
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        data: Option<DataHolder>,
        #[serde(default)]
        plugindata: Option<PluginData>,
    },
    Event {
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        sender: Option<u64>,
        #[serde(default)]
        plugindata: Option<PluginData>,
        #[serde(default)]
        jsep: Option<SessionDescription>,
    },
    Error {
        #[serde(default)]
        transaction: Option<String>,
        error: ErrorInfo,
    },
    WebRtcUp {
        #[serde(default)]
        sender: Option<u64>,
    },
    Media {
        #[serde(default)]
        sender: Option<u64>,
        #[serde(default, rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        receiving: Option<bool>,
    },
    SlowLink {
        #[serde(default)]
        sender: Option<u64>,
        #[serde(default)]
        uplink: Option<bool>,
        #[serde(default)]
        lost: Option<u64>,
    },
    Hangup {
        #[serde(default)]
        sender: Option<u64>,
        #[serde(default)]
        reason: Option<String>,
    },
    Detached {
        #[serde(default)]
        sender: Option<u64>,
    },
    Timeout {
        #[serde(default)]
        session_id: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

impl Reply {
    pub fn transaction(&self) -> Option<&str> {
        match self {
            Reply::Ack { transaction }
            | Reply::Success { transaction, .. }
            | Reply::Event { transaction, .. }
            | Reply::Error { transaction, .. } => transaction.as_deref(),
            _ => None,
        }
    }

    /// Convert an asynchronous notification into a handle event
    pub fn into_handle_event(self) -> Option<HandleEvent> {
        match self {
            Reply::WebRtcUp { .. } => Some(HandleEvent::WebRtcUp),
            Reply::Media { kind, receiving, .. } => Some(HandleEvent::Media {
                kind: kind.unwrap_or_default(),
                receiving: receiving.unwrap_or(false),
            }),
            Reply::SlowLink { uplink, lost, .. } => Some(HandleEvent::SlowLink {
                uplink: uplink.unwrap_or(false),
                lost: lost.unwrap_or(0),
            }),
            Reply::Hangup { reason, .. } => Some(HandleEvent::Hangup {
                reason: reason.unwrap_or_default(),
            }),
            Reply::Detached { .. } => Some(HandleEvent::Detached),
            Reply::Timeout { .. } => Some(HandleEvent::SessionTimeout),
            Reply::Event { plugindata, .. } => Some(HandleEvent::Plugin {
                data: plugindata.map(|p| p.data).unwrap_or(Value::Null),
            }),
            _ => None,
        }
    }
}

/// Notification about the attached handle
#[derive(Debug, Clone, PartialEq)]
pub enum HandleEvent {
    /// PeerConnection with Janus is up
    WebRtcUp,
    /// Janus started or stopped receiving media of `kind`
    Media { kind: String, receiving: bool },
    /// Janus reports packet loss
    SlowLink { uplink: bool, lost: u64 },
    /// PeerConnection closed by Janus
    Hangup { reason: String },
    /// Handle detached from the plugin
    Detached,
    /// Janus session expired
    SessionTimeout,
    /// Asynchronous plugin event
    Plugin { data: Value },
}

impl HandleEvent {
    /// The subscription cannot continue after this event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandleEvent::Hangup { .. } | HandleEvent::Detached | HandleEvent::SessionTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_encoding() {
        let create = serde_json::to_value(Request::Create {
            transaction: "t1".to_string(),
        })
        .unwrap();
        assert_eq!(create, json!({"janus": "create", "transaction": "t1"}));

        let attach = serde_json::to_value(Request::Attach {
            transaction: "t2".to_string(),
            session_id: 10,
            plugin: VIDEOROOM_PLUGIN.to_string(),
        })
        .unwrap();
        assert_eq!(
            attach,
            json!({"janus": "attach", "transaction": "t2", "session_id": 10,
                   "plugin": "janus.plugin.videoroom"})
        );

        let keepalive = serde_json::to_value(Request::Keepalive {
            transaction: "t3".to_string(),
            session_id: 10,
        })
        .unwrap();
        assert_eq!(keepalive["janus"], "keepalive");
    }

    #[test]
    fn test_message_encoding() {
        let join = serde_json::to_value(Request::Message {
            transaction: "t4".to_string(),
            session_id: 10,
            handle_id: 20,
            body: join_subscriber_body(1234, 1),
            jsep: None,
        })
        .unwrap();
        assert_eq!(join["janus"], "message");
        assert_eq!(join["handle_id"], 20);
        assert_eq!(
            join["body"],
            json!({"request": "join", "ptype": "subscriber", "room": 1234, "feed": 1})
        );
        assert!(join.get("jsep").is_none());

        let start = serde_json::to_value(Request::Message {
            transaction: "t5".to_string(),
            session_id: 10,
            handle_id: 20,
            body: start_body(),
            jsep: Some(SessionDescription::answer("v=0")),
        })
        .unwrap();
        assert_eq!(start["body"], json!({"request": "start", "trickle": false}));
        assert_eq!(start["jsep"], json!({"type": "answer", "sdp": "v=0"}));
    }

    #[test]
    fn test_parse_success_and_ack() {
        let reply: Reply =
            serde_json::from_str(r#"{"janus":"success","transaction":"t1","data":{"id":42}}"#)
                .unwrap();
        assert_eq!(reply.transaction(), Some("t1"));
        assert!(matches!(
            reply,
            Reply::Success { data: Some(DataHolder { id: 42 }), .. }
        ));

        let ack: Reply =
            serde_json::from_str(r#"{"janus":"ack","session_id":42,"transaction":"t4"}"#).unwrap();
        assert_eq!(ack, Reply::Ack { transaction: Some("t4".to_string()) });
    }

    #[test]
    fn test_parse_event_with_offer() {
        let text = r#"{
            "janus": "event",
            "session_id": 42,
            "sender": 77,
            "transaction": "t4",
            "plugindata": {
                "plugin": "janus.plugin.videoroom",
                "data": {"videoroom": "attached", "room": 1234, "id": 1}
            },
            "jsep": {"type": "offer", "sdp": "v=0\r\n"}
        }"#;
        let reply: Reply = serde_json::from_str(text).unwrap();
        match reply {
            Reply::Event {
                sender,
                plugindata: Some(plugindata),
                jsep: Some(jsep),
                ..
            } => {
                assert_eq!(sender, Some(77));
                assert_eq!(plugindata.plugin, VIDEOROOM_PLUGIN);
                assert_eq!(plugindata.data["videoroom"], "attached");
                assert!(plugindata.error().is_none());
                assert_eq!(jsep, SessionDescription::offer("v=0\r\n"));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        let reply: Reply = serde_json::from_str(
            r#"{"janus":"error","transaction":"t9","error":{"code":458,"reason":"No such session"}}"#,
        )
        .unwrap();
        assert_eq!(
            reply,
            Reply::Error {
                transaction: Some("t9".to_string()),
                error: ErrorInfo {
                    code: 458,
                    reason: "No such session".to_string()
                }
            }
        );

        let plugindata: PluginData = serde_json::from_value(json!({
            "plugin": VIDEOROOM_PLUGIN,
            "data": {"videoroom": "event", "error_code": 428, "error": "No such feed (1)"}
        }))
        .unwrap();
        assert_eq!(plugindata.error(), Some((428, "No such feed (1)".to_string())));
    }

    #[test]
    fn test_handle_events() {
        let cases = [
            (r#"{"janus":"webrtcup","sender":77}"#, HandleEvent::WebRtcUp),
            (
                r#"{"janus":"media","sender":77,"type":"video","receiving":true}"#,
                HandleEvent::Media {
                    kind: "video".to_string(),
                    receiving: true,
                },
            ),
            (
                r#"{"janus":"slowlink","sender":77,"uplink":false,"lost":12}"#,
                HandleEvent::SlowLink {
                    uplink: false,
                    lost: 12,
                },
            ),
            (
                r#"{"janus":"hangup","sender":77,"reason":"DTLS alert"}"#,
                HandleEvent::Hangup {
                    reason: "DTLS alert".to_string(),
                },
            ),
        ];

        for (text, expected) in cases {
            let reply: Reply = serde_json::from_str(text).unwrap();
            assert_eq!(reply.transaction(), None);
            assert_eq!(reply.into_handle_event(), Some(expected));
        }

        assert!(HandleEvent::Hangup {
            reason: String::new()
        }
        .is_terminal());
        assert!(!HandleEvent::WebRtcUp.is_terminal());
    }

    #[test]
    fn test_unknown_message_type() {
        let reply: Reply = serde_json::from_str(r#"{"janus":"trickle","sender":77}"#).unwrap();
        assert_eq!(reply, Reply::Unknown);
        assert_eq!(reply.into_handle_event(), None);
    }
}
