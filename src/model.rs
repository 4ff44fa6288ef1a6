//! Vertex AI Gemini client.
//!
//! One `generateContent` call per request, no retries. The call is a plain
//! future owned by the request handler, so a client disconnect drops it and
//! aborts the upstream request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::observability::credentials::Credentials;

/// Upper bound on one model call.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// The model call did not produce an answer.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("model backend is overloaded ({0})")]
    Overloaded(reqwest::StatusCode),

    #[error("model backend returned {status}: {body}")]
    Upstream {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid model response: {0}")]
    Decode(String),
}

/// A successful model response.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// The response as returned by the backend.
    pub raw: Value,
    /// Text of the first part of the first candidate, if any.
    pub text: Option<String>,
}

impl Generation {
    pub fn from_raw(raw: Value) -> Result<Self, GenerationError> {
        let parsed: GenerateContentResponse = serde_json::from_value(raw.clone())
            .map_err(|e| GenerationError::Decode(e.to_string()))?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|content| content.parts.into_iter().next())
            .and_then(|part| part.text)
            .filter(|text| !text.is_empty());
        Ok(Self { raw, text })
    }
}

/// Something that answers prompts.
#[async_trait]
pub trait FactsModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<Generation, GenerationError>;
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: [RequestContent<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Gemini on Vertex AI, authenticated with the instance's credentials.
pub struct VertexModel {
    client: reqwest::Client,
    url: String,
    credentials: Credentials,
}

impl VertexModel {
    pub fn new(credentials: Credentials, project_id: &str, region: &str, model: &str) -> Self {
        Self::with_base_url(
            credentials,
            &format!("https://{region}-aiplatform.googleapis.com"),
            project_id,
            region,
            model,
        )
    }

    /// Point the client at another API host.
    pub fn with_base_url(
        credentials: Credentials,
        base_url: &str,
        project_id: &str,
        region: &str,
        model: &str,
    ) -> Self {
        let base_url = base_url.trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            url: format!(
                "{base_url}/v1/projects/{project_id}/locations/{region}/publishers/google/models/{model}:generateContent"
            ),
            credentials,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FactsModel for VertexModel {
    #[tracing::instrument(name = "model.generate", skip_all, fields(url = %self.url))]
    async fn generate(&self, prompt: &str) -> Result<Generation, GenerationError> {
        let token = self.credentials.token();
        let body = GenerateContentRequest {
            contents: [RequestContent {
                role: "user",
                parts: [RequestPart { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&token.token)
            .timeout(GENERATE_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        {
            return Err(GenerationError::Overloaded(status));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Upstream { status, body });
        }

        Generation::from_raw(response.json().await?)
    }
}
