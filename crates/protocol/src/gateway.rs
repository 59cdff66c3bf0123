//! Gateway wire protocol: opcode frames and dispatch event payloads.
//!
//! Every frame on the gateway websocket is `{op, d, s?, t?}`. Opcode 0
//! (DISPATCH) carries a sequence number `s` and an event name `t`; the
//! payload shape of `d` depends on the event.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_PRESENCE_UPDATE: u8 = 3;
pub const OP_VOICE_STATE_UPDATE: u8 = 4;
pub const OP_RESUME: u8 = 6;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

/// Envelope for every gateway frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    pub fn heartbeat(last_sequence: Option<u64>) -> Self {
        Self {
            op: OP_HEARTBEAT,
            d: json!(last_sequence),
            s: None,
            t: None,
        }
    }

    pub fn identify(token: &str) -> Self {
        Self {
            op: OP_IDENTIFY,
            d: json!({ "token": token }),
            s: None,
            t: None,
        }
    }

    pub fn resume(token: &str, session_id: &str, seq: u64) -> Self {
        Self {
            op: OP_RESUME,
            d: json!({ "token": token, "session_id": session_id, "seq": seq }),
            s: None,
            t: None,
        }
    }
}

/// HELLO payload (op 10).
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// READY payload: captures the resume cursor and seeds local caches.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<Guild>,
}

// Dispatch payload models. Tolerant of extra fields; only what the client
// caches is typed.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildDelete {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelDelete {
    pub id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDelete {
    pub id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDeleteBulk {
    pub ids: Vec<String>,
    pub channel_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildMember {
    #[serde(default)]
    pub guild_id: Option<String>,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Presence {
    pub user_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub activity: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceState {
    pub user_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reaction {
    pub message_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelPinsUpdate {
    pub channel_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypingStart {
    pub channel_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Relationship {
    pub user_id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// A DISPATCH frame decoded by event name.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Ready(Ready),
    MessageCreate(Message),
    MessageUpdate(Message),
    MessageDelete(MessageDelete),
    MessageDeleteBulk(MessageDeleteBulk),
    GuildCreate(Guild),
    GuildUpdate(Guild),
    GuildDelete(GuildDelete),
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(ChannelDelete),
    GuildMemberAdd(GuildMember),
    GuildMemberRemove(GuildMember),
    GuildMemberUpdate(GuildMember),
    PresenceUpdate(Presence),
    VoiceStateUpdate(VoiceState),
    MessageReactionAdd(Reaction),
    MessageReactionRemove(Reaction),
    ChannelPinsUpdate(ChannelPinsUpdate),
    TypingStart(TypingStart),
    UserUpdate(User),
    RelationshipAdd(Relationship),
    RelationshipRemove(Relationship),
    ServerRestart,
    /// Recognizably framed but unrecognized event name.
    Unknown(String),
}

impl DispatchEvent {
    /// Decode a dispatch payload by event name.
    ///
    /// Returns `None` for a payload that does not match the event's shape
    /// (the session silently drops those).
    pub fn parse(name: &str, d: Value) -> Option<Self> {
        fn de<T: DeserializeOwned>(d: Value) -> Option<T> {
            serde_json::from_value(d).ok()
        }
        Some(match name {
            "READY" => Self::Ready(de(d)?),
            "MESSAGE_CREATE" => Self::MessageCreate(de(d)?),
            "MESSAGE_UPDATE" => Self::MessageUpdate(de(d)?),
            "MESSAGE_DELETE" => Self::MessageDelete(de(d)?),
            "MESSAGE_DELETE_BULK" => Self::MessageDeleteBulk(de(d)?),
            "GUILD_CREATE" => Self::GuildCreate(de(d)?),
            "GUILD_UPDATE" => Self::GuildUpdate(de(d)?),
            "GUILD_DELETE" => Self::GuildDelete(de(d)?),
            "CHANNEL_CREATE" => Self::ChannelCreate(de(d)?),
            "CHANNEL_UPDATE" => Self::ChannelUpdate(de(d)?),
            "CHANNEL_DELETE" => Self::ChannelDelete(de(d)?),
            "GUILD_MEMBER_ADD" => Self::GuildMemberAdd(de(d)?),
            "GUILD_MEMBER_REMOVE" => Self::GuildMemberRemove(de(d)?),
            "GUILD_MEMBER_UPDATE" => Self::GuildMemberUpdate(de(d)?),
            "PRESENCE_UPDATE" => Self::PresenceUpdate(de(d)?),
            "VOICE_STATE_UPDATE" => Self::VoiceStateUpdate(de(d)?),
            "MESSAGE_REACTION_ADD" => Self::MessageReactionAdd(de(d)?),
            "MESSAGE_REACTION_REMOVE" => Self::MessageReactionRemove(de(d)?),
            "CHANNEL_PINS_UPDATE" => Self::ChannelPinsUpdate(de(d)?),
            "TYPING_START" => Self::TypingStart(de(d)?),
            "USER_UPDATE" => Self::UserUpdate(de(d)?),
            "RELATIONSHIP_ADD" => Self::RelationshipAdd(de(d)?),
            "RELATIONSHIP_REMOVE" => Self::RelationshipRemove(de(d)?),
            "SERVER_RESTART" => Self::ServerRestart,
            other => Self::Unknown(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_frame_parses() {
        let raw = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.op, OP_HELLO);
        assert!(frame.s.is_none());
        let hello: Hello = serde_json::from_value(frame.d).unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
    }

    #[test]
    fn heartbeat_carries_last_sequence() {
        let json = serde_json::to_string(&GatewayFrame::heartbeat(Some(312))).unwrap();
        assert!(json.contains(r#""op":1"#));
        assert!(json.contains(r#""d":312"#));

        // Before any dispatch has been seen the cursor is null.
        let json = serde_json::to_string(&GatewayFrame::heartbeat(None)).unwrap();
        assert!(json.contains(r#""d":null"#));
    }

    #[test]
    fn identify_and_resume_shapes() {
        let json = serde_json::to_string(&GatewayFrame::identify("tok-1")).unwrap();
        assert!(json.contains(r#""op":2"#));
        assert!(json.contains(r#""token":"tok-1""#));

        let json = serde_json::to_string(&GatewayFrame::resume("tok-1", "sess-9", 77)).unwrap();
        assert!(json.contains(r#""op":6"#));
        assert!(json.contains(r#""session_id":"sess-9""#));
        assert!(json.contains(r#""seq":77"#));
    }

    #[test]
    fn dispatch_ready() {
        let d = serde_json::json!({
            "session_id": "abc",
            "user": { "id": "u1", "username": "ada" },
            "guilds": [{ "id": "g1", "name": "main" }],
        });
        match DispatchEvent::parse("READY", d) {
            Some(DispatchEvent::Ready(ready)) => {
                assert_eq!(ready.session_id, "abc");
                assert_eq!(ready.user.username, "ada");
                assert_eq!(ready.guilds.len(), 1);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_message_create_tolerates_extra_fields() {
        let d = serde_json::json!({
            "id": "m1",
            "channel_id": "c1",
            "content": "hello",
            "attachments": [],
            "mentions": [],
        });
        match DispatchEvent::parse("MESSAGE_CREATE", d) {
            Some(DispatchEvent::MessageCreate(msg)) => assert_eq!(msg.content, "hello"),
            other => panic!("expected MessageCreate, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_unknown_event_name() {
        match DispatchEvent::parse("SOME_FUTURE_EVENT", Value::Null) {
            Some(DispatchEvent::Unknown(name)) => assert_eq!(name, "SOME_FUTURE_EVENT"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_malformed_payload_is_none() {
        // READY without a session_id cannot be applied.
        let d = serde_json::json!({ "user": { "id": "u1" } });
        assert!(DispatchEvent::parse("READY", d).is_none());
    }

    #[test]
    fn server_restart_has_no_payload() {
        assert!(matches!(
            DispatchEvent::parse("SERVER_RESTART", Value::Null),
            Some(DispatchEvent::ServerRestart)
        ));
    }

    #[test]
    fn frame_without_optional_fields() {
        let raw = r#"{"op":11}"#;
        let frame: GatewayFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.op, OP_HEARTBEAT_ACK);
        assert_eq!(frame.d, Value::Null);
    }
}
