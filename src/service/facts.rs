//! `GET /facts` handler.
//!
//! Asks the model for fun facts about a subject and returns its HTML.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::server::ServerState;

/// Subject used when the request names none.
pub const DEFAULT_SUBJECT: &str = "dog";

/// Query parameters of `/facts`.
#[derive(Debug, Default)]
pub struct FactsQuery {
    pub subject: Option<String>,
    /// Deprecated alias of `subject`.
    pub animal: Option<String>,
}

impl FactsQuery {
    /// Build from raw query pairs, keeping the first non-empty value of each
    /// parameter. Repeated keys are not an error.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut query = Self::default();
        for (key, value) in pairs {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_str() {
                "subject" => &mut query.subject,
                "animal" => &mut query.animal,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }
        query
    }
}

/// `subject` if non-empty, else `animal` if non-empty, else `"dog"`.
pub fn effective_subject(query: &FactsQuery) -> &str {
    [&query.subject, &query.animal]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .find(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SUBJECT)
}

pub fn prompt_for(subject: &str) -> String {
    format!("Give me 10 fun facts about {subject}. Return this as html without backticks.")
}

/// Handle `GET /facts`.
///
/// Counts one generation per answered request. Model failures become
/// `429 Too Many Requests` with an empty body; the detail only goes to the log.
pub async fn handle_facts(
    State(state): State<Arc<ServerState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let query = FactsQuery::from_pairs(pairs);
    let subject = effective_subject(&query);
    let prompt = prompt_for(subject);

    let generation = match state.model.generate(&prompt).await {
        Ok(generation) => generation,
        Err(e) => {
            tracing::warn!(subject, error = %e, "Model call failed");
            return StatusCode::TOO_MANY_REQUESTS.into_response();
        }
    };

    tracing::debug!(
        subject,
        prompt = %prompt,
        response = %generation.raw,
        "content is generated"
    );

    match generation.text {
        Some(html) => {
            state.generations.record_success();
            (
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                html,
            )
                .into_response()
        }
        None => StatusCode::OK.into_response(),
    }
}
