//! Bearer credentials for the OTLP exporters.
//!
//! The exporters authenticate every gRPC call with the instance's access
//! token. Tokens from the metadata server expire, so a background task swaps
//! in a fresh one before that happens; readers never block.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::environment::{AccessToken, Environment};

/// Refresh this long before the token expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Back-off after a failed refresh.
const RETRY_AFTER_FAILURE: Duration = Duration::from_secs(30);

/// Shortest wait between two refreshes, for tokens issued with less than
/// `REFRESH_MARGIN` left.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait before refreshing `token`; `None` if it never expires.
fn next_refresh(token: &AccessToken) -> Option<Duration> {
    token
        .refresh_in(REFRESH_MARGIN)
        .map(|wait| wait.max(MIN_REFRESH_INTERVAL))
}

/// Shared, swappable access token.
#[derive(Clone)]
pub struct Credentials {
    current: Arc<ArcSwap<AccessToken>>,
}

impl Credentials {
    pub fn new(token: AccessToken) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(token)),
        }
    }

    pub fn token(&self) -> Arc<AccessToken> {
        self.current.load_full()
    }

    pub fn replace(&self, token: AccessToken) {
        self.current.store(Arc::new(token));
    }

    /// Keep the token fresh until the returned task is aborted.
    ///
    /// Returns `None` for tokens that never expire.
    pub fn spawn_refresher(&self, env: Arc<dyn Environment>) -> Option<JoinHandle<()>> {
        next_refresh(&self.token())?;
        let credentials = self.clone();

        Some(tokio::spawn(async move {
            loop {
                let Some(wait) = next_refresh(&credentials.token()) else {
                    return;
                };
                tokio::time::sleep(wait).await;

                match env.access_token().await {
                    Ok(token) => {
                        credentials.replace(token);
                        tracing::debug!("Access token refreshed");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to refresh access token");
                        tokio::time::sleep(RETRY_AFTER_FAILURE).await;
                    }
                }
            }
        }))
    }

    /// gRPC interceptor stamping each export with the current token.
    pub fn interceptor(&self, project_id: &str) -> BearerInterceptor {
        BearerInterceptor {
            credentials: self.clone(),
            user_project: project_id.parse().ok(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &*self.token())
            .finish()
    }
}

/// Adds `authorization` and `x-goog-user-project` metadata to OTLP calls.
#[derive(Clone)]
pub struct BearerInterceptor {
    credentials: Credentials,
    user_project: Option<MetadataValue<Ascii>>,
}

impl Interceptor for BearerInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let token = self.credentials.token();
        let bearer: MetadataValue<Ascii> = format!("Bearer {}", token.token)
            .parse()
            .map_err(|_| Status::unauthenticated("access token is not valid ASCII"))?;

        let metadata = request.metadata_mut();
        metadata.insert("authorization", bearer);
        if let Some(project) = &self.user_project {
            metadata.insert("x-goog-user-project", project.clone());
        }
        Ok(request)
    }
}
