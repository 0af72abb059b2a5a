//! Shared reqwest plumbing for the tracking clients.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracktune_core::error::TrackingError;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 512;

pub(crate) fn build_client(service: &str) -> Result<reqwest::Client, TrackingError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("tracktune/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| TrackingError::transport(service, format!("Failed to build HTTP client: {e}")))
}

/// Send `request` and decode a JSON body. Empty bodies decode to `Null`.
pub(crate) async fn send_json(
    service: &str,
    request: reqwest::RequestBuilder,
) -> Result<Value, TrackingError> {
    let resp = request.send().await.map_err(|e| {
        warn!(service, error = %e, "Tracking request failed");
        TrackingError::transport(service, format!("HTTP request failed: {e}"))
    })?;

    let status = resp.status();
    let body_text = resp
        .text()
        .await
        .map_err(|e| TrackingError::transport(service, format!("Failed to read response body: {e}")))?;

    if !status.is_success() {
        warn!(service, status = %status, "Tracking API HTTP error");
        return Err(TrackingError::Api {
            service: service.to_string(),
            status: status.as_u16(),
            message: error_message(&body_text),
        });
    }

    if body_text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body_text)
        .map_err(|e| TrackingError::parse(service, format!("Invalid JSON response: {e}")))
}

/// Pull a readable message out of an error body.
fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let field = parsed.as_ref().and_then(|json| {
        ["message", "msg", "error"]
            .iter()
            .find_map(|k| json.get(*k).and_then(Value::as_str))
            .map(str::to_string)
    });
    field.unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY).collect())
}

/// Decode a tracker settings mapping; `Null` yields the defaults.
pub(crate) fn parse_settings<T>(service: &str, settings: &Value) -> Result<T, TrackingError>
where
    T: DeserializeOwned + Default,
{
    match settings {
        Value::Null => Ok(T::default()),
        other => serde_json::from_value(other.clone()).map_err(|e| TrackingError::InvalidSettings {
            message: format!("{service}: {e}"),
        }),
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// JSON number for `value`, or `None` for NaN and infinities.
pub(crate) fn finite(value: f64) -> Option<Value> {
    serde_json::Number::from_f64(value).map(Value::Number)
}

/// Merge config tags with per-run tags, keeping first occurrences.
pub(crate) fn merge_tags(base: &[String], extra: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::with_capacity(base.len() + extra.len());
    for tag in base.iter().chain(extra) {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    tags
}
