//! The resource descriptor attached to every exported span and metric.

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{
    CLOUD_PLATFORM, CLOUD_PROVIDER, CLOUD_REGION, FAAS_NAME, FAAS_VERSION, SERVICE_NAME,
};

use super::pipeline::TelemetrySettings;

/// Attribute carrying the Google Cloud project id.
pub const GCP_PROJECT_ID: &str = "gcp.project_id";

/// Build the resource: SDK defaults, then detected platform attributes,
/// then explicit service identity. Later sources win on key conflicts.
pub fn build_resource(project_id: &str, settings: &TelemetrySettings) -> Resource {
    let explicit = {
        let mut attrs = vec![KeyValue::new(GCP_PROJECT_ID, project_id.to_string())];
        if let Some(name) = &settings.service_name {
            attrs.push(KeyValue::new(SERVICE_NAME, name.clone()));
        }
        Resource::new(attrs)
    };

    Resource::default()
        .merge(&detect_platform(settings))
        .merge(&explicit)
}

/// Cloud Run attributes, present when the service runs there.
fn detect_platform(settings: &TelemetrySettings) -> Resource {
    let mut attrs = Vec::new();

    if settings.service_name.is_some() || settings.region.is_some() {
        attrs.push(KeyValue::new(CLOUD_PROVIDER, "gcp"));
    }
    if let Some(name) = &settings.service_name {
        attrs.push(KeyValue::new(CLOUD_PLATFORM, "gcp_cloud_run"));
        attrs.push(KeyValue::new(FAAS_NAME, name.clone()));
    }
    if let Some(revision) = &settings.service_revision {
        attrs.push(KeyValue::new(FAAS_VERSION, revision.clone()));
    }
    if let Some(region) = &settings.region {
        attrs.push(KeyValue::new(CLOUD_REGION, region.clone()));
    }

    Resource::new(attrs)
}
