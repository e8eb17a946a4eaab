use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use uuid::Uuid;

/// The identity a client presents at connect time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectFrame {
    pub room_id: String,
    pub user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFrame {
    #[serde_as(as = "Base64")]
    pub delta: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceFrame {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatFrame {
    pub user_name: String,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatFrame {
    pub timestamp: i64,
}

/// Everything a client may send us.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "connect")]
    Connect(ConnectFrame),
    #[serde(rename = "update")]
    Update(UpdateFrame),
    #[serde(rename = "presence")]
    Presence(PresenceFrame),
    #[serde(rename = "chat")]
    Chat(ChatFrame),
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatFrame),
    #[serde(rename = "leave")]
    Leave,
}

/// One entry of the participant list carried by sync-response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantEntry {
    pub client_id: Uuid,
    pub user: UserInfo,
    pub joined_at: DateTime<Utc>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseFrame {
    #[serde_as(as = "Base64")]
    pub snapshot_data: Vec<u8>,
    pub participants: Vec<ParticipantEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinFrame {
    pub user: UserInfo,
    pub client_id: Uuid,
    pub room_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaveFrame {
    pub client_id: Uuid,
    pub user_id: String,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRelayFrame {
    #[serde_as(as = "Base64")]
    pub delta: Vec<u8>,
    pub from: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRelayFrame {
    pub user_name: String,
    pub message: String,
    pub timestamp: i64,
    pub client_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    NotConnected,
    AlreadyConnected,
    Unauthorized,
    RoomNotFound,
    Flood,
    Internal,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
}

/// Everything we may send a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "sync-response")]
    SyncResponse(SyncResponseFrame),
    #[serde(rename = "join")]
    Join(JoinFrame),
    #[serde(rename = "leave")]
    Leave(LeaveFrame),
    #[serde(rename = "update")]
    Update(UpdateRelayFrame),
    #[serde(rename = "presence")]
    Presence(PresenceFrame),
    #[serde(rename = "chat")]
    Chat(ChatRelayFrame),
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatFrame),
    #[serde(rename = "error")]
    Error(ErrorFrame),
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error(ErrorFrame {
            code,
            message: message.into(),
        })
    }
}
