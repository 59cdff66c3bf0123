use serde::{Deserialize, Serialize};

/// Control-channel messages exchanged with the media relay on the reliable
/// sub-channel. Data-plane packets never carry these.
///
/// JSON with a `type` discriminator in snake_case; field names are camelCase
/// to match the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Announce ourselves and publish our current sender key.
    #[serde(rename_all = "camelCase")]
    Join {
        ssrc: u32,
        sender_key: Vec<u8>,
        epoch: u32,
    },
    #[serde(rename_all = "camelCase")]
    Leave { ssrc: u32 },
    /// Camera flow is about to start on `ssrc`.
    #[serde(rename_all = "camelCase")]
    VideoStart {
        ssrc: u32,
        width: u32,
        height: u32,
        layers: u8,
    },
    #[serde(rename_all = "camelCase")]
    VideoStop { ssrc: u32 },
    #[serde(rename_all = "camelCase")]
    ScreenShareStart {
        ssrc: u32,
        width: u32,
        height: u32,
    },
    #[serde(rename_all = "camelCase")]
    ScreenShareStop { ssrc: u32 },
    /// Ask the sender identified by `target_ssrc` for a fresh keyframe.
    #[serde(rename_all = "camelCase")]
    RequestKeyframe { target_ssrc: u32 },
    /// Server → client: a participant entered the session.
    /// Key material may lag and arrive later via `SenderKeyUpdate`.
    #[serde(rename_all = "camelCase")]
    ParticipantJoin {
        ssrc: u32,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_key: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        epoch: Option<u32>,
    },
    /// Server → client: a participant left.
    #[serde(rename_all = "camelCase")]
    ParticipantLeave { ssrc: u32 },
    /// Server → client: a participant rotated their sender key.
    #[serde(rename_all = "camelCase")]
    SenderKeyUpdate {
        ssrc: u32,
        sender_key: Vec<u8>,
        epoch: u32,
    },
}
