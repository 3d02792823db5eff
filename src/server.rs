//! The webhook endpoint: a long-running HTTP service receiving CI build and
//! task lifecycle events, plus the requeue hook used by the Commitfest app.
//!
//! Business-level rejections (out-of-sync events, unrecognised shapes) are
//! 200s; background polling resolves them and the sender must not retry.
//! Only internal errors produce a 500.

use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use chrono::DateTime;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, info};

use crate::cirrus::state::{self, BuildSnapshot, TaskSnapshot};
use crate::db::App;
use crate::types::{CiStatus, Source};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBuild {
    id: String,
    status: String,
    branch: String,
    change_id_in_repo: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookTask {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    local_group_id: Option<i64>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    status_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    old_status: Option<String>,
    #[serde(default)]
    build: Option<WebhookBuild>,
    #[serde(default)]
    task: Option<WebhookTask>,
}

#[derive(Debug, Deserialize)]
struct RequeueRequest {
    commitfest_id: i32,
    submission_id: i64,
    shared_secret: String,
}

/// Compare two secrets without leaking length or prefix information
/// through timing: compare fixed-size digests, accumulating differences.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = Sha256::digest(a.as_bytes());
    let b = Sha256::digest(b.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/api/cirrus-webhook", post(cirrus_webhook))
        .route("/api/requeue-patch", post(requeue_patch))
        .with_state(app)
}

/// Run the webhook endpoint until the process is stopped.
pub async fn run_server(app: App) -> Result<()> {
    let addr = app.config.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "webhook endpoint listening");
    axum::serve(listener, router(Arc::new(app))).await?;
    Ok(())
}

fn ok(body: &'static str) -> Response {
    (StatusCode::OK, body).into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    error!(error = ?err, "webhook processing failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "NOT OK").into_response()
}

async fn cirrus_webhook(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Some(expected) = &app.config.cirrus_webhook_secret {
        let supplied = headers
            .get("X-Webhook-Secret")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_eq(supplied, expected) {
            return (StatusCode::UNAUTHORIZED, "NOT OK").into_response();
        }
    }
    let event_type = headers
        .get("X-Cirrus-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Ok(payload) = serde_json::from_str::<WebhookPayload>(&body) else {
        info!(body = %body, "webhook body not understood");
        return ok("not understood");
    };
    let result = match event_type {
        "build" => handle_build_event(&app, &payload).await,
        "task" => handle_task_event(&app, &payload).await,
        _ => {
            info!(event_type, "unrecognised webhook event type");
            return ok("not understood");
        }
    };
    match result {
        Ok(understood) => {
            if understood {
                ok("OK")
            } else {
                info!(body = %body, "webhook payload not understood");
                ok("not understood")
            }
        }
        Err(err) => internal_error(err),
    }
}

fn parse_status(status: &str) -> Result<CiStatus> {
    Ok(status.parse::<CiStatus>()?)
}

/// Returns Ok(false) when the payload shape is not understood.
async fn handle_build_event(app: &App, payload: &WebhookPayload) -> Result<bool> {
    let (Some(action), Some(build)) = (&payload.action, &payload.build) else {
        return Ok(false);
    };
    let snapshot = BuildSnapshot {
        build_id: build.id.clone(),
        branch_name: build.branch.clone(),
        commit_id: build.change_id_in_repo.clone(),
        status: parse_status(&build.status)?,
    };
    let mut tx = app.begin().await?;
    match action.as_str() {
        "created" => {
            state::ingest_build_created(&mut tx, &snapshot, Source::Webhook).await?;
        }
        "updated" => {
            let old_status = payload
                .old_status
                .as_deref()
                .map(parse_status)
                .transpose()?;
            state::ingest_build_updated(&mut tx, &snapshot, old_status, Source::Webhook).await?;
        }
        _ => {
            tx.rollback().await?;
            return Ok(false);
        }
    }
    tx.commit().await?;
    Ok(true)
}

async fn handle_task_event(app: &App, payload: &WebhookPayload) -> Result<bool> {
    let (Some(action), Some(task)) = (&payload.action, &payload.task) else {
        return Ok(false);
    };
    let Some(build) = &payload.build else {
        return Ok(false);
    };
    let snapshot = TaskSnapshot {
        task_id: task.id.clone(),
        build_id: build.id.clone(),
        task_name: task.name.clone(),
        commit_id: Some(build.change_id_in_repo.clone()),
        status: parse_status(&task.status)?,
        position: task.local_group_id.map(|g| g as i32 + 1),
        event_timestamp: task
            .status_timestamp
            .and_then(DateTime::from_timestamp_millis),
    };
    let mut tx = app.begin().await?;
    match action.as_str() {
        "created" => {
            state::ingest_task_created(&mut tx, &snapshot, Source::Webhook).await?;
        }
        "updated" => {
            let old_status = payload
                .old_status
                .as_deref()
                .map(parse_status)
                .transpose()?;
            state::ingest_task_updated(&mut tx, &snapshot, old_status, Source::Webhook).await?;
        }
        _ => {
            tx.rollback().await?;
            return Ok(false);
        }
    }
    tx.commit().await?;
    Ok(true)
}

async fn requeue_patch(State(app): State<Arc<App>>, body: String) -> Response {
    let Ok(request) = serde_json::from_str::<RequeueRequest>(&body) else {
        return ok("not understood");
    };
    if !constant_time_eq(&request.shared_secret, &app.config.commitfest_shared_secret) {
        return (StatusCode::UNAUTHORIZED, "NOT OK").into_response();
    }
    let result = async {
        let mut tx = app.begin().await?;
        let requeued = crate::commitfest::requeue_submission(
            &mut tx,
            request.commitfest_id,
            request.submission_id,
        )
        .await?;
        tx.commit().await?;
        anyhow::Ok(requeued)
    }
    .await;
    match result {
        Ok(requeued) => {
            info!(
                commitfest_id = request.commitfest_id,
                submission_id = request.submission_id,
                requeued,
                "requeue-patch"
            );
            ok("OK")
        }
        Err(err) => internal_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "Secret"));
        assert!(!constant_time_eq("secret", "secret "));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_build_webhook_shape() {
        let body = r#"{
            "action": "updated",
            "old_status": "SCHEDULED",
            "build": {
                "id": "123",
                "status": "EXECUTING",
                "branch": "cf/4000",
                "changeIdInRepo": "abc"
            }
        }"#;
        let payload: WebhookPayload = serde_json::from_str(body).unwrap();
        assert_eq!(payload.action.as_deref(), Some("updated"));
        assert_eq!(payload.old_status.as_deref(), Some("SCHEDULED"));
        let build = payload.build.unwrap();
        assert_eq!(build.id, "123");
        assert_eq!(build.change_id_in_repo, "abc");
    }

    #[test]
    fn test_task_webhook_shape() {
        let body = r#"{
            "action": "created",
            "build": {
                "id": "123",
                "status": "EXECUTING",
                "branch": "cf/4000",
                "changeIdInRepo": "abc"
            },
            "task": {
                "id": "900",
                "name": "Linux - Debian",
                "status": "CREATED",
                "localGroupId": 2,
                "statusTimestamp": 1704067200000
            }
        }"#;
        let payload: WebhookPayload = serde_json::from_str(body).unwrap();
        let task = payload.task.unwrap();
        assert_eq!(task.local_group_id, Some(2));
        let ts = DateTime::from_timestamp_millis(task.status_timestamp.unwrap()).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_unknown_payload_is_not_understood() {
        let payload: WebhookPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.action.is_none());
        assert!(payload.build.is_none());
    }
}
