//! HTTP client for the story server's `/api/*` endpoints.

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use storyweave_shared::{
    try_error_message, ApiError, Character, CharacterResponse, CharactersResponse,
    ChatHistoryResponse, ChatSessionResponse, ChatSessionSummary, DialogueEntry,
    InitStoryRequest, InitStoryResponse, LoadStoryResponse, SaveStoryRequest, SetModelRequest,
    StatusResponse, Story, StoryTemplate, TemplatesResponse,
};
use url::Url;

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

/// Map a `{status: "error", message}` envelope to `ApiError::Rejected`.
fn check_status(status: &str, message: Option<&str>) -> Result<(), ApiError> {
    if status == "error" {
        return Err(ApiError::Rejected(
            message.unwrap_or("request failed").to_string(),
        ));
    }
    Ok(())
}

impl ApiClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: String::new(),
        }
    }

    /// Set the base URL for API requests
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if self.base_url.is_empty() {
            if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            }
        } else {
            let base = self.base_url.trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{base}/{path}")
        }
    }

    /// `prefix` plus one percent-encoded path segment.
    fn segment_url(&self, prefix: &str, segment: &str) -> Result<String, ApiError> {
        let mut url = Url::parse(&self.url(prefix))
            .map_err(|e| ApiError::Network(format!("invalid url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Network(format!("cannot append to {prefix}")))?
            .pop_if_empty()
            .push(segment);
        Ok(url.into())
    }

    async fn read_json<TRes: DeserializeOwned>(resp: Response) -> Result<TRes, ApiError> {
        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            if let Some(message) = try_error_message(&text) {
                return Err(ApiError::Rejected(message));
            }
            return Err(ApiError::Http { status, body: text });
        }

        if text.is_empty() {
            serde_json::from_str("null").map_err(|e| ApiError::Deserialize(e.to_string()))
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
        }
    }

    pub async fn get_json<TRes: DeserializeOwned>(&self, path: &str) -> Result<TRes, ApiError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::read_json(resp).await
    }

    pub async fn post_json<TReq: Serialize, TRes: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TRes, ApiError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Self::read_json(resp).await
    }

    // --- Story API ---

    pub async fn load_story(&self) -> Result<LoadStoryResponse, ApiError> {
        let resp: LoadStoryResponse = self.get_json("/api/load_story").await?;
        check_status(&resp.status, resp.message.as_deref())?;
        Ok(resp)
    }

    pub async fn save_story(&self, history: &[DialogueEntry]) -> Result<(), ApiError> {
        let body = SaveStoryRequest {
            dialogue_history: history.to_vec(),
        };
        let resp: StatusResponse = self.post_json("/api/save_story", &body).await?;
        check_status(&resp.status, resp.message.as_deref())
    }

    pub async fn init_story(&self, request: &InitStoryRequest) -> Result<Story, ApiError> {
        let resp: InitStoryResponse = self.post_json("/api/init_story", request).await?;
        check_status(&resp.status, resp.message.as_deref())?;
        resp.story
            .ok_or_else(|| ApiError::Deserialize("init_story response without story".into()))
    }

    pub async fn story_templates(&self) -> Result<Vec<StoryTemplate>, ApiError> {
        let resp: TemplatesResponse = self.get_json("/api/stories/templates").await?;
        check_status(&resp.status, resp.message.as_deref())?;
        Ok(resp.templates)
    }

    pub async fn set_model(&self, model: &str) -> Result<(), ApiError> {
        let body = SetModelRequest {
            model: model.to_string(),
        };
        let resp: StatusResponse = self.post_json("/api/set_model", &body).await?;
        check_status(&resp.status, resp.message.as_deref())
    }

    // --- Characters ---

    /// All characters of the active story. Empty when no story exists yet.
    pub async fn characters(&self) -> Result<Vec<Character>, ApiError> {
        let resp: CharactersResponse = self.get_json("/api/characters").await?;
        check_status(&resp.status, resp.message.as_deref())?;
        let mut characters: Vec<Character> = resp.characters.into_values().collect();
        characters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(characters)
    }

    pub async fn character(&self, name: &str) -> Result<Character, ApiError> {
        let url = self.segment_url("/api/characters", name)?;
        let resp: CharacterResponse = self.get_json(&url).await?;
        check_status(&resp.status, resp.message.as_deref())?;
        resp.character
            .ok_or_else(|| ApiError::Deserialize(format!("no character record for '{name}'")))
    }

    // --- Chat history ---

    pub async fn chat_history(&self) -> Result<Vec<ChatSessionSummary>, ApiError> {
        let resp: ChatHistoryResponse = self.get_json("/api/chat_history").await?;
        check_status(&resp.status, resp.message.as_deref())?;
        Ok(resp.sessions)
    }

    pub async fn chat_session(&self, id: &str) -> Result<serde_json::Value, ApiError> {
        let url = self.segment_url("/api/chat_history", id)?;
        let resp: ChatSessionResponse = self.get_json(&url).await?;
        check_status(&resp.status, resp.message.as_deref())?;
        Ok(resp.session.unwrap_or_default())
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}
