//! Shared data models for the dialogue client and its story server.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Affection is tracked on a 0..=5 scale by the story server.
pub const MAX_AFFECTION: i64 = 5;

// --- Characters ---

/// Reference to a character by name. Names are unique within a story.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterRef(pub String);

impl CharacterRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CharacterRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CharacterRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Full character record as sent by the story server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub dialogue_style: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub affection: i64,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub relationships: HashMap<String, i64>,
    #[serde(default)]
    pub orientation: Option<String>,
}

impl Character {
    pub fn reference(&self) -> CharacterRef {
        CharacterRef(self.name.clone())
    }

    /// Affection clamped to the server's scale.
    pub fn affection_level(&self) -> i64 {
        self.affection.clamp(0, MAX_AFFECTION)
    }
}

/// A character field on the wire: either a bare name or the full record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CharacterField {
    Name(String),
    Full(Character),
}

impl CharacterField {
    pub fn reference(&self) -> CharacterRef {
        match self {
            CharacterField::Name(name) => CharacterRef(name.clone()),
            CharacterField::Full(character) => character.reference(),
        }
    }

    pub fn record(&self) -> Option<&Character> {
        match self {
            CharacterField::Name(_) => None,
            CharacterField::Full(character) => Some(character),
        }
    }
}

/// A suggested reply offered by the server after a character response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub text: String,
    #[serde(default)]
    pub value: i64,
}

// --- Messages ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Character,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
}

/// A finalized dialogue message. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub speaker: Speaker,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_ref: Option<CharacterRef>,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn build(speaker: Speaker, character: Option<CharacterRef>, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            speaker,
            character_ref: character,
            content,
            kind: MessageKind::Text,
            created_at: Utc::now(),
        }
    }

    pub fn from_user(content: impl Into<String>) -> Self {
        Self::build(Speaker::User, None, content.into())
    }

    pub fn from_character(character: CharacterRef, content: impl Into<String>) -> Self {
        Self::build(Speaker::Character, Some(character), content.into())
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Display name of whoever spoke: `"user"` or the character's name.
    pub fn speaker_name(&self) -> &str {
        match (&self.speaker, &self.character_ref) {
            (Speaker::Character, Some(character)) => character.as_str(),
            (Speaker::Character, None) => "character",
            (Speaker::User, _) => "user",
        }
    }

    pub fn is_from(&self, character: &CharacterRef) -> bool {
        self.speaker == Speaker::Character && self.character_ref.as_ref() == Some(character)
    }
}

/// History entry in the server's `dialogue_history` format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueEntry {
    pub speaker: String,
    pub content: String,
}

impl From<&Message> for DialogueEntry {
    fn from(message: &Message) -> Self {
        Self {
            speaker: message.speaker_name().to_string(),
            content: message.content.clone(),
        }
    }
}

impl From<DialogueEntry> for Message {
    fn from(entry: DialogueEntry) -> Self {
        if entry.speaker == "user" {
            Message::from_user(entry.content)
        } else {
            Message::from_character(CharacterRef(entry.speaker), entry.content)
        }
    }
}

// --- Story ---

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Story {
    #[serde(default)]
    pub world_type: String,
    #[serde(default)]
    pub setting: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub characters: HashMap<String, Character>,
    #[serde(default)]
    pub current_scene: Option<String>,
    #[serde(default)]
    pub adult_content: bool,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub custom_rules: serde_json::Value,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

impl Story {
    pub fn world_setting(&self) -> WorldSetting {
        WorldSetting {
            name: self.setting.clone(),
            description: self.world_type.clone(),
            background: self.background.clone(),
            themes: self.themes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

// --- Local snapshot ---

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub ai_model: Option<String>,
    #[serde(default)]
    pub theme_color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameProgress {
    #[serde(default)]
    pub affection_level: i64,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub flags: HashMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorldSetting {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub themes: Vec<String>,
}

/// Locally persisted subset of client state. Every section is optional so a
/// partial snapshot never resets fields it does not carry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_progress: Option<GameProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_setting: Option<WorldSetting>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialogue_entry_keeps_character_name_as_speaker() {
        let message = Message::from_character("Nova".into(), "Hello!");
        let entry = DialogueEntry::from(&message);
        assert_eq!(entry.speaker, "Nova");

        let back = Message::from(entry);
        assert!(back.is_from(&CharacterRef::new("Nova")));
        assert_eq!(back.content, "Hello!");
    }

    #[test]
    fn user_entry_maps_to_user_speaker() {
        let message = Message::from(DialogueEntry {
            speaker: "user".into(),
            content: "hi".into(),
        });
        assert_eq!(message.speaker, Speaker::User);
        assert_eq!(message.speaker_name(), "user");
    }

    #[test]
    fn character_field_accepts_name_or_record() {
        let name: CharacterField = serde_json::from_str("\"Nova\"").unwrap();
        assert_eq!(name.reference(), CharacterRef::new("Nova"));

        let full: CharacterField =
            serde_json::from_str(r#"{"name":"Nova","affection":9}"#).unwrap();
        assert_eq!(full.record().map(|c| c.affection_level()), Some(MAX_AFFECTION));
    }

    #[test]
    fn snapshot_uses_camel_case_sections() {
        let snapshot = LocalSnapshot {
            settings: Some(Settings {
                ai_model: Some("gpt-4".into()),
                theme_color: None,
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["settings"]["aiModel"], "gpt-4");
        assert!(json.get("worldSetting").is_none());
    }
}
