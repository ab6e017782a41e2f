use serde::{Deserialize, Serialize};
use serde_with::{serde_as, base64::Base64};

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// Encoded version vector; empty when the peer has nothing yet
    #[serde_as(as = "Base64")]
    #[serde(default)]
    pub version: Vec<u8>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    #[serde_as(as = "Base64")]
    pub update: Vec<u8>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    #[serde_as(as = "Base64")]
    pub payload: Vec<u8>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresenceMessage {
    pub conn: u64,
    #[serde_as(as = "Base64")]
    pub payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub date: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ReceivedMessage {
    #[serde(rename = "sync")]
    Sync(SyncMessage),
    #[serde(rename = "update")]
    Update(UpdateMessage),
    #[serde(rename = "presence")]
    Presence(PresenceMessage),
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum SendMessage {
    #[serde(rename = "sync")]
    Sync(SyncMessage),
    #[serde(rename = "update")]
    Update(UpdateMessage),
    #[serde(rename = "presence")]
    Presence(PeerPresenceMessage),
    #[serde(rename = "pong")]
    Pong(PongMessage),
}
