//! Transport events and REST payloads exchanged with the story server.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};

use crate::models::{Character, CharacterField, Choice, DialogueEntry, Story, StoryTemplate};

/// Event names on the socket.
pub const EVENT_SEND_MESSAGE: &str = "send_message";
pub const EVENT_RECEIVE_MESSAGE: &str = "receive_message";
pub const EVENT_STREAM_START: &str = "stream_start";
pub const EVENT_STREAM_DATA: &str = "stream_data";
pub const EVENT_STREAM_END: &str = "stream_end";

/// Lifecycle events raised locally by the connection manager, never sent by
/// the server.
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";

/// A single frame on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsEnvelope {
    pub id: String,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl WsEnvelope {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event: event.into(),
            data,
            ts: Utc::now(),
        }
    }

    /// Decode the payload into a typed event body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

// --- Socket payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub message: String,
    pub character: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveMessagePayload {
    pub status: ResponseStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub character: Option<CharacterField>,
    #[serde(default)]
    pub choices: Option<Vec<Choice>>,
    /// `"image"` marks the message body as an image reference.
    #[serde(default)]
    pub kind: Option<crate::models::MessageKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartPayload {
    pub stream_id: String,
    pub character: CharacterField,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDataPayload {
    pub stream_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEndPayload {
    pub stream_id: String,
}

// --- REST payloads ---

/// Envelope every `/api/*` endpoint answers with: `status` plus an optional
/// human-readable `message` on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadStoryResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub dialogue_history: Vec<DialogueEntry>,
    #[serde(default)]
    pub story: Option<Story>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveStoryRequest {
    pub dialogue_history: Vec<DialogueEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitStoryRequest {
    pub world_type: String,
    pub setting: String,
    pub background: String,
    #[serde(default)]
    pub adult_content: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitStoryResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub story: Option<Story>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetModelRequest {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharactersResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Keyed by name. The server sends `[]` instead of `{}` before a story
    /// exists.
    #[serde(default, deserialize_with = "characters_by_name")]
    pub characters: HashMap<String, Character>,
}

fn characters_by_name<'de, D>(deserializer: D) -> Result<HashMap<String, Character>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Shape {
        Map(HashMap<String, Character>),
        List(Vec<Character>),
    }

    Ok(match Shape::deserialize(deserializer)? {
        Shape::Map(map) => map,
        Shape::List(list) => list.into_iter().map(|c| (c.name.clone(), c)).collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub character: Option<Character>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplatesResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub templates: Vec<StoryTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSessionSummary {
    pub id: Option<String>,
    #[serde(default)]
    pub character_name: Option<String>,
    #[serde(default)]
    pub world_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatHistoryResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub sessions: Vec<ChatSessionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSessionResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_payloads_use_camel_case_ids() {
        let envelope = WsEnvelope::new(EVENT_STREAM_DATA, json!({"streamId": "s1", "content": "Hel"}));
        let data: StreamDataPayload = envelope.decode().unwrap();
        assert_eq!(data.stream_id, "s1");
        assert_eq!(data.content, "Hel");
    }

    #[test]
    fn characters_before_any_story_is_empty() {
        let resp: CharactersResponse = serde_json::from_value(json!({
            "status": "new_game",
            "message": "pick a world",
            "characters": []
        }))
        .unwrap();
        assert_eq!(resp.status, "new_game");
        assert!(resp.characters.is_empty());
    }

    #[test]
    fn characters_map_is_keyed_by_name() {
        let resp: CharactersResponse = serde_json::from_value(json!({
            "status": "success",
            "characters": {"Nova": {"name": "Nova", "personality": "curious", "affection": 2}}
        }))
        .unwrap();
        assert_eq!(resp.characters["Nova"].affection, 2);
    }

    #[test]
    fn receive_message_error_needs_only_status() {
        let payload: ReceiveMessagePayload =
            serde_json::from_value(json!({"status": "error", "message": "boom"})).unwrap();
        assert_eq!(payload.status, ResponseStatus::Error);
        assert!(payload.character.is_none());
    }

    #[test]
    fn stream_start_without_character_is_rejected() {
        let result = serde_json::from_value::<StreamStartPayload>(json!({"streamId": "s1"}));
        assert!(result.is_err());
    }
}
