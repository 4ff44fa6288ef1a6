//! Project, region and credential resolution.
//!
//! Explicit configuration always wins; otherwise values come from the
//! GCE / Cloud Run metadata server. Lookups are not retried: any failure
//! here aborts startup.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Config;

const METADATA_FLAVOR: (&str, &str) = ("Metadata-Flavor", "Google");
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

const PROJECT_ID_KEY: &str = "project/project-id";
const REGION_KEY: &str = "instance/region";
const TOKEN_KEY: &str = "instance/service-accounts/default/token";

/// Identity or location lookup failed.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("{0} is not configured and the metadata server returned nothing")]
    Missing(&'static str),

    #[error("metadata request for {key} failed: {source}")]
    Request {
        key: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("metadata server returned {status} for {key}")]
    Status {
        key: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("invalid metadata response for {key}: {message}")]
    Decode { key: &'static str, message: String },
}

/// An OAuth bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    /// `None` for tokens supplied through configuration.
    pub expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn non_expiring(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    /// Time left before the token should be replaced.
    pub fn refresh_in(&self, margin: Duration) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()).saturating_sub(margin))
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of identity, location and credentials for the running instance.
#[async_trait]
pub trait Environment: Send + Sync {
    async fn project_id(&self) -> Result<String, ResolutionError>;

    async fn region(&self) -> Result<String, ResolutionError>;

    async fn access_token(&self) -> Result<AccessToken, ResolutionError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// [`Environment`] backed by configuration overrides and the metadata server.
#[derive(Debug, Clone)]
pub struct MetadataEnvironment {
    client: reqwest::Client,
    base_url: String,
    project_id: Option<String>,
    region: Option<String>,
    access_token: Option<String>,
}

impl MetadataEnvironment {
    /// Create a resolver talking to `http://{metadata_host}/computeMetadata/v1/`.
    pub fn new(metadata_host: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://{metadata_host}/computeMetadata/v1/"),
            project_id: None,
            region: None,
            access_token: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.metadata_host)
            .with_project_id(config.project_id.clone())
            .with_region(config.region.clone())
            .with_access_token(config.access_token.clone())
    }

    pub fn with_project_id(mut self, project_id: Option<String>) -> Self {
        self.project_id = project_id.filter(|p| !p.is_empty());
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region.filter(|r| !r.is_empty());
        self
    }

    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|t| !t.is_empty());
        self
    }

    async fn fetch(&self, key: &'static str) -> Result<String, ResolutionError> {
        let response = self
            .client
            .get(format!("{}{key}", self.base_url))
            .header(METADATA_FLAVOR.0, METADATA_FLAVOR.1)
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|source| ResolutionError::Request { key, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolutionError::Status { key, status });
        }

        response
            .text()
            .await
            .map_err(|source| ResolutionError::Request { key, source })
    }
}

#[async_trait]
impl Environment for MetadataEnvironment {
    async fn project_id(&self) -> Result<String, ResolutionError> {
        if let Some(project_id) = &self.project_id {
            return Ok(project_id.clone());
        }
        let project_id = self.fetch(PROJECT_ID_KEY).await?;
        let project_id = project_id.trim();
        if project_id.is_empty() {
            return Err(ResolutionError::Missing("project id"));
        }
        Ok(project_id.to_string())
    }

    async fn region(&self) -> Result<String, ResolutionError> {
        if let Some(region) = &self.region {
            return Ok(region.clone());
        }
        let qualified = self.fetch(REGION_KEY).await?;
        let region = last_segment(qualified.trim());
        if region.is_empty() {
            return Err(ResolutionError::Missing("region"));
        }
        Ok(region.to_string())
    }

    async fn access_token(&self) -> Result<AccessToken, ResolutionError> {
        if let Some(token) = &self.access_token {
            return Ok(AccessToken::non_expiring(token.clone()));
        }
        let body = self.fetch(TOKEN_KEY).await?;
        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| ResolutionError::Decode {
                key: TOKEN_KEY,
                message: e.to_string(),
            })?;
        Ok(AccessToken {
            token: parsed.access_token,
            expires_at: Some(Instant::now() + Duration::from_secs(parsed.expires_in)),
        })
    }
}

/// Trailing path segment of a fully qualified name
/// (`projects/123/regions/us-central1` -> `us-central1`).
pub fn last_segment(qualified: &str) -> &str {
    qualified
        .rsplit_once('/')
        .map_or(qualified, |(_, last)| last)
}
