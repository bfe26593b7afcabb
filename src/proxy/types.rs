//! Conversation types and the OpenAI-compatible wire format used upstream.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Map a caller-supplied role onto one the provider accepts.
    /// Anything unrecognized becomes `User`.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Message as sent by the caller, before role normalization.
#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    role: serde_json::Value,
    content: String,
}

impl From<IncomingMessage> for Message {
    fn from(incoming: IncomingMessage) -> Self {
        let role = incoming
            .role
            .as_str()
            .map(Role::normalize)
            .unwrap_or(Role::User);
        Message::new(role, incoming.content)
    }
}

/// A validated conversation: a non-empty, ordered list of messages.
#[derive(Debug, Clone)]
pub struct ConversationRequest {
    pub messages: Vec<Message>,
}

impl ConversationRequest {
    /// Parse and validate a raw request body.
    ///
    /// The body must be a JSON object whose `messages` field is a non-empty
    /// array of `{role, content}` objects with string content.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidInput(format!("body is not valid JSON: {}", e)))?;

        let raw_messages = match value.get("messages") {
            Some(serde_json::Value::Array(items)) if !items.is_empty() => items,
            Some(serde_json::Value::Array(_)) => {
                return Err(Error::InvalidInput(
                    "messages array must not be empty".to_string(),
                ))
            }
            Some(_) => {
                return Err(Error::InvalidInput(
                    "messages must be an array".to_string(),
                ))
            }
            None => {
                return Err(Error::InvalidInput(
                    "messages array is required".to_string(),
                ))
            }
        };

        let messages = raw_messages
            .iter()
            .enumerate()
            .map(|(index, item)| {
                IncomingMessage::deserialize(item)
                    .map(Message::from)
                    .map_err(|e| Error::InvalidInput(format!("messages[{}]: {}", index, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { messages })
    }
}

/// Chat completion request body sent to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
}

/// Streaming chunk from the provider. Only the fields the proxy reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

/// A streaming choice delta.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// Delta content in streaming response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Delta {
    pub content: Option<String>,
}

/// One incremental unit of generated text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamChunk {
    pub delta: Option<String>,
    pub finish_reason: Option<String>,
}

impl UpstreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            finish_reason: None,
        }
    }
}

impl From<ChatCompletionChunk> for UpstreamChunk {
    fn from(chunk: ChatCompletionChunk) -> Self {
        match chunk.choices.into_iter().next() {
            Some(choice) => UpstreamChunk {
                delta: choice.delta.content,
                finish_reason: choice.finish_reason,
            },
            None => UpstreamChunk::default(),
        }
    }
}
