//! Tracking ids for correlating commands with their feed responses.
//!
//! A tracking id is `<investigation_id>/<uuid v4>`. It is sent as the
//! command's `investigation_id`, and the service echoes it back in
//! `routing.investigation_id` on every event the command produces.

use serde_json::Value;
use uuid::Uuid;

/// Generate a fresh tracking id scoped to `investigation_id`.
pub fn generate_tracking_id(investigation_id: &str) -> String {
    format!("{investigation_id}/{}", Uuid::new_v4())
}

/// The investigation a tracking id belongs to.
pub fn investigation_of(tracking_id: &str) -> &str {
    tracking_id
        .rsplit_once('/')
        .map_or(tracking_id, |(inv, _)| inv)
}

/// Correlation id carried by a domain event, if any.
pub fn correlation_id(event: &Value) -> Option<&str> {
    event
        .get("routing")?
        .get("investigation_id")?
        .as_str()
        .filter(|id| !id.is_empty())
}
