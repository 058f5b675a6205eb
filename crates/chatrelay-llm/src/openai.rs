//! OpenAI-compatible chat completions provider
//!
//! Also used to talk to locally spawned inference servers, which expose the
//! same API.

use crate::provider::{LlmError, LlmResult, RemoteProvider};
use crate::types::{ChatMessage, GenerateRequest, Generation, Usage};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: Client,
    name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            name: name.into(),
            model: model.into(),
            api_key: None,
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait::async_trait]
impl RemoteProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: GenerateRequest) -> LlmResult<Generation> {
        post_chat(
            &self.client,
            &self.base_url,
            self.api_key.as_deref(),
            &self.model,
            request,
        )
        .await
    }
}

/// POST `{base_url}/chat/completions` and extract the first choice.
pub(crate) async fn post_chat(
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    model: &str,
    request: GenerateRequest,
) -> LlmResult<Generation> {
    let body = ChatCompletionRequest {
        model,
        messages: &request.messages,
        temperature: request.params.temperature,
        max_tokens: request.params.max_output_tokens,
        stream: false,
    };

    debug!("Chat request: model={} messages={}", model, body.messages.len());

    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let mut builder = client.post(&url).json(&body);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }
    let response = check_status(builder.send().await?).await?;

    let parsed: ChatCompletionResponse = response
        .json()
        .await
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;

    Ok(Generation {
        text,
        usage: parsed.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
    })
}

/// Map non-success statuses onto typed errors.
pub(crate) async fn check_status(response: Response) -> LlmResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(60_000);
    let error_text = response.text().await.unwrap_or_default();
    error!("Upstream error {}: {}", status, error_text);

    match status.as_u16() {
        401 | 403 => Err(LlmError::AuthFailed(error_text)),
        429 => Err(LlmError::RateLimited { retry_after_ms }),
        _ => Err(LlmError::RequestFailed(format!("{}: {}", status, error_text))),
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}
