//! Push webhook: the only way a pipeline run is started.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use convoy_core::repository::PushEvent;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/push", post(push_webhook))
}

type WebhookResponse = (StatusCode, Json<Value>);

fn ignored(reason: impl Into<String>) -> WebhookResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ignored", "reason": reason.into() })),
    )
}

/// Handle a GitHub-style push event.
///
/// Answers `202 Accepted` when the push starts a run and `200 OK` when it
/// is ignored.
async fn push_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<WebhookResponse, ApiError> {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("push");

    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!(event = %event_type, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
        }
    }

    match event_type {
        "push" => {}
        "ping" => {
            info!("Ping event received - webhook is configured correctly");
            return Ok(ignored("ping"));
        }
        other => {
            info!(event = %other, "Unhandled event type");
            return Ok(ignored(format!("event '{}' is not handled", other)));
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;
    let push = PushEvent::from_github_payload(&payload)
        .ok_or_else(|| ApiError::BadRequest("payload is not a push event".to_string()))?;

    info!(
        repo = %push.repository,
        branch = ?push.branch,
        sha = %push.after,
        "Received push"
    );

    if push.is_deletion() {
        return Ok(ignored("branch deleted"));
    }

    let pipeline = &state.orchestration.pipeline;
    let Some(trigger) = pipeline.trigger() else {
        return Ok(ignored(format!("pipeline '{}' has no source", pipeline.name)));
    };
    if !trigger.matches(&push) {
        info!(
            pipeline = %pipeline.name,
            branch = ?push.branch,
            trigger = %trigger.branch,
            "Trigger conditions not met, skipping"
        );
        return Ok(ignored(format!("pipeline triggers on '{}'", trigger.branch)));
    }

    let commit = push.after.clone();
    state.spawn_run(push);
    info!(pipeline = %pipeline.name, sha = %commit, "Run started from webhook");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "accepted",
            "pipeline": pipeline.name,
            "commit": commit,
        })),
    ))
}

/// Verify a `sha256=<hex>` HMAC signature of the body.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(sig_hex) = signature.and_then(|s| s.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}
