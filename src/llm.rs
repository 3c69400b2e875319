//! # Language-model contract and client
//!
//! Defines the [`LanguageModel`] trait the enrichment and versioning stages
//! depend on, plus the concrete [`GeminiClient`] speaking the
//! `generateContent` REST endpoint.
//!
//! ## Interface & Extensibility
//! - Implement [`LanguageModel`] to swap providers; the stages only ever see
//!   the trait.
//! - The trait is annotated for `mockall`, so tests drive the orchestrators
//!   with scripted responses instead of network calls.
//!
//! ## Response handling
//! Models are instructed to return raw JSON but frequently wrap it in
//! markdown code fences or leave trailing commas; [`normalize_json_response`]
//! undoes both before parsing.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

/// Contract for one-shot text generation with an instruction prompt and a
/// document/diff attachment.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a completion for `prompt` with `attachment` as a second
    /// user part. Returns the raw response text.
    async fn generate(&self, prompt: &str, attachment: &str) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

/// Client for the Gemini `generateContent` REST API.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    /// Builds a client from the `GEMINI_API_KEY` environment variable,
    /// loading `.env` first if present.
    pub fn new_from_env(model: &str) -> Result<Self> {
        dotenvy::dotenv().ok();
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| Error::Config("GEMINI_API_KEY environment variable not set".into()))?;
        info!(model, "Gemini API client configured");
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            api_key,
            model: model.to_string(),
        })
    }

    /// Overrides the endpoint, for tests against a local stub.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(&self, prompt: &str, attachment: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }, Part { text: attachment }],
            }],
        };

        debug!(url = %url, attachment_bytes = attachment.len(), "Sending generateContent request");
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text: String = parsed
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| Error::Model("response contained no candidates".into()))?;

        Ok(text)
    }
}

/// Stand-in model for dry runs: the orchestrator never calls it, and any
/// accidental call fails loudly instead of burning quota.
pub struct NoopModel;

#[async_trait]
impl LanguageModel for NoopModel {
    async fn generate(&self, _prompt: &str, _attachment: &str) -> Result<String> {
        Err(Error::Model("no language model configured".into()))
    }
}

/// Strips a leading/trailing markdown code fence from a model response.
pub fn strip_code_fences(text: &str) -> String {
    let open = Regex::new(r"^```(?:json)?\s*").expect("static regex");
    let close = Regex::new(r"\s*```$").expect("static regex");
    let trimmed = text.trim();
    let without_open = open.replace(trimmed, "");
    close.replace(&without_open, "").into_owned()
}

/// Normalises a model response for strict JSON parsing: removes code
/// fences and trailing commas before a closing brace/bracket.
pub fn normalize_json_response(text: &str) -> String {
    let stripped = strip_code_fences(text);
    let trailing_commas = Regex::new(r",\s*([}\]])").expect("static regex");
    trailing_commas.replace_all(&stripped, "$1").into_owned()
}
