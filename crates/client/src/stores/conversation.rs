//! Conversation paths and typed accessors on top of [`StateStore`].
//!
//! All conversation mutation goes through the store so subscribers observe
//! every change; these helpers only add typing and the append-only rule for
//! messages.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use storyweave_shared::{CharacterRef, Choice, Message};

use super::StateStore;

pub const MESSAGES: &str = "conversation.messages";
pub const PENDING_CHOICES: &str = "conversation.pendingChoices";
pub const CURRENT_CHARACTER: &str = "conversation.currentCharacter";
pub const CHARACTERS: &str = "characters";
pub const STORY: &str = "story";
pub const SETTINGS: &str = "settings";
pub const GAME_PROGRESS: &str = "gameProgress";
pub const WORLD_SETTING: &str = "worldSetting";

/// Typed view of the `conversation` subtree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub pending_choices: Vec<Choice>,
    #[serde(default)]
    pub current_character: Option<CharacterRef>,
}

impl StateStore {
    pub fn conversation(&self) -> ConversationState {
        self.get_as("conversation").unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.get_as(MESSAGES).unwrap_or_default()
    }

    /// Append a finalized message. Returns `false` if a message with the same
    /// id is already present.
    pub fn append_message(&self, message: &Message) -> bool {
        let Ok(encoded) = serde_json::to_value(message) else {
            return false;
        };
        let mut appended = false;
        self.update(MESSAGES, |slot| {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Some(items) = slot.as_array_mut() {
                let duplicate = items
                    .iter()
                    .any(|m| m.get("id").and_then(Value::as_str) == Some(message.id.as_str()));
                if !duplicate {
                    items.push(encoded);
                    appended = true;
                }
            }
        });
        appended
    }

    pub fn pending_choices(&self) -> Vec<Choice> {
        self.get_as(PENDING_CHOICES).unwrap_or_default()
    }

    pub fn set_pending_choices(&self, choices: &[Choice]) {
        self.set(PENDING_CHOICES, json!(choices));
    }

    pub fn current_character(&self) -> Option<CharacterRef> {
        self.get_as(CURRENT_CHARACTER)
    }

    pub fn set_current_character(&self, character: &CharacterRef) {
        self.set(CURRENT_CHARACTER, json!(character));
    }

    /// Empty the conversation subtree, leaving settings and story alone.
    pub fn clear_conversation(&self) {
        self.apply(vec![
            (MESSAGES.to_string(), json!([])),
            (PENDING_CHOICES.to_string(), json!([])),
        ]);
    }
}
