//! LLM types for generation requests and responses

use chatrelay_core::{BackendDescriptor, Message};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message in an assembled prompt
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

impl From<&Message> for ChatMessage {
    fn from(m: &Message) -> Self {
        Self::new(m.role.as_str(), m.content.clone())
    }
}

/// Sampling parameters taken from the backend descriptor
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_output_tokens: 1024,
        }
    }
}

impl From<&BackendDescriptor> for GenerationParams {
    fn from(d: &BackendDescriptor) -> Self {
        Self {
            temperature: d.temperature,
            max_output_tokens: d.max_output_tokens,
        }
    }
}

/// Generation request: `generate(messages, params) -> text | error`
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
}

/// Completed generation
#[derive(Clone, Debug, Default)]
pub struct Generation {
    pub text: String,
    pub usage: Option<Usage>,
}

/// Token usage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// External classifier verdict
#[derive(Clone, Debug, Default)]
pub struct Classification {
    pub flagged: bool,
    /// Flagged categories with their scores.
    pub categories: BTreeMap<String, f32>,
}
