//! OpenAI moderation endpoint client

use crate::openai::{check_status, OPENAI_API_URL};
use crate::provider::{LlmError, LlmResult, ModerationClassifier};
use crate::types::Classification;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub struct OpenAiModeration {
    client: Client,
    api_key: String,
    model: Option<String>,
    base_url: String,
}

impl OpenAiModeration {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: None,
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

#[async_trait::async_trait]
impl ModerationClassifier for OpenAiModeration {
    async fn classify(&self, text: &str) -> LlmResult<Classification> {
        let url = format!("{}/moderations", self.base_url.trim_end_matches('/'));
        let body = ModerationRequest {
            input: text,
            model: self.model.as_deref(),
        };
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        let parsed: ModerationResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let result = parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("empty moderation results".to_string()))?;

        let categories = result
            .categories
            .into_iter()
            .filter(|(_, flagged)| *flagged)
            .map(|(name, _)| {
                let score = result.category_scores.get(&name).copied().unwrap_or(1.0);
                (name, score)
            })
            .collect();

        Ok(Classification {
            flagged: result.flagged,
            categories,
        })
    }
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationEntry>,
}

#[derive(Deserialize)]
struct ModerationEntry {
    flagged: bool,
    #[serde(default)]
    categories: BTreeMap<String, bool>,
    #[serde(default)]
    category_scores: BTreeMap<String, f32>,
}
