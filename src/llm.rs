use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::GeminiConfig;

/// Inline binary payload for a prompt part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// One element of a Gemini `parts` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Blob,
    },
    /// Anything else the API may send back (function calls, thoughts, ...)
    Other(serde_json::Value),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: "user".to_string(),
            parts,
        }
    }

    /// Copy of this turn with inline attachments swapped for a short text
    /// marker, so history does not keep resending media bytes.
    pub fn without_media(&self) -> Self {
        let parts = self
            .parts
            .iter()
            .map(|part| match part {
                Part::InlineData { inline_data } => {
                    Part::text(format!("[{} attachment]", inline_data.mime_type))
                }
                other => other.clone(),
            })
            .collect();

        Self {
            role: self.role.clone(),
            parts,
        }
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Content of the first candidate, if any.
    pub fn first_content(&self) -> Option<&Content> {
        self.candidates.first().and_then(|c| c.content.as_ref())
    }

    /// Reply text; empty when the prompt was blocked or nothing came back.
    pub fn text(&self) -> String {
        self.first_content().map(Content::text).unwrap_or_default()
    }

    pub fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
    }
}

/// Thin client over the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub async fn generate_content(&self, contents: &[Content]) -> Result<GenerateContentResponse> {
        let request = GenerateContentRequest {
            contents,
            generation_config: GenerationConfig {
                max_output_tokens: self.config.max_output_tokens,
            },
        };

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );

        debug!("Sending request to Gemini: {} ({} turns)", url, contents.len());

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Gemini")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error ({}): {}", status, error_body);
        }

        response
            .json()
            .await
            .context("Failed to parse Gemini response")
    }
}

/// Factory for conversation sessions.
pub trait ChatModel: Send + Sync {
    fn start_chat(&self) -> Box<dyn ChatSession>;
}

/// A stateful exchange with the model that keeps earlier turns as context.
#[async_trait]
pub trait ChatSession: Send {
    /// Send one user turn and return the reply text (empty on a blocked or
    /// empty answer).
    async fn send_message(&mut self, parts: Vec<Part>) -> Result<String>;
}

pub struct GeminiModel {
    client: Arc<GeminiClient>,
}

impl GeminiModel {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: Arc::new(GeminiClient::new(config)),
        }
    }
}

impl ChatModel for GeminiModel {
    fn start_chat(&self) -> Box<dyn ChatSession> {
        Box::new(GeminiChat {
            max_turns: self.client.config.max_history_turns,
            client: Arc::clone(&self.client),
            history: Vec::new(),
        })
    }
}

pub struct GeminiChat {
    client: Arc<GeminiClient>,
    history: Vec<Content>,
    /// Answered exchanges kept; each is a user turn plus a model turn
    max_turns: usize,
}

impl GeminiChat {
    fn remember(&mut self, user_turn: &Content, reply: &Content) {
        self.history.push(user_turn.without_media());
        self.history.push(Content {
            role: "model".to_string(),
            parts: reply.parts.clone(),
        });

        let excess = self.history.len().saturating_sub(self.max_turns * 2);
        if excess > 0 {
            self.history.drain(..excess);
            debug!("Dropped {} old turns from conversation history", excess);
        }
    }
}

#[async_trait]
impl ChatSession for GeminiChat {
    async fn send_message(&mut self, parts: Vec<Part>) -> Result<String> {
        let user_turn = Content::user(parts);

        let mut contents = self.history.clone();
        contents.push(user_turn);

        let response = self.client.generate_content(&contents).await?;

        if let Some(reason) = response.block_reason() {
            warn!("Gemini blocked the prompt: {}", reason);
        }

        let text = response.text();
        if text.is_empty() {
            let finish_reason = response
                .candidates
                .first()
                .and_then(|c| c.finish_reason.as_deref())
                .unwrap_or("none");
            warn!("Gemini returned no text (finish reason: {})", finish_reason);
        }

        // A turn only enters the history once the model has answered it.
        if !text.is_empty() {
            if let (Some(user_turn), Some(reply)) = (contents.last(), response.first_content()) {
                self.remember(user_turn, reply);
            }
        }

        Ok(text)
    }
}
