//! Webhook endpoint for GitHub.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use cbuild_config::RepoConfig;
use cbuild_core::execution::{TriggerInfo, TriggerKind};
use cbuild_core::id::RepoId;
use cbuild_core::repository::{CheckAction, CheckEvent, CommitMeta, PushEvent};
use cbuild_scheduler::StartRequest;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/github", post(github_webhook))
}

type WebhookResponse = Result<(StatusCode, Json<Value>), ApiError>;

fn ignored(reason: &str) -> WebhookResponse {
    Ok((
        StatusCode::OK,
        Json(json!({ "status": "ignored", "reason": reason })),
    ))
}

enum WebhookEvent {
    Push(PushEvent),
    Check { kind: TriggerKind, event: CheckEvent },
}

impl WebhookEvent {
    fn parse(event_type: &str, payload: &Value) -> Option<Self> {
        match event_type {
            "push" => PushEvent::from_github_payload(payload).map(WebhookEvent::Push),
            "check_run" | "check_suite" => {
                let kind = if event_type == "check_run" {
                    TriggerKind::CheckRun
                } else {
                    TriggerKind::CheckSuite
                };
                CheckEvent::from_github_payload(event_type, payload)
                    .map(|event| WebhookEvent::Check { kind, event })
            }
            _ => None,
        }
    }

    fn repo_id(&self) -> &RepoId {
        match self {
            WebhookEvent::Push(push) => &push.repo_id,
            WebhookEvent::Check { event, .. } => &event.repo_id,
        }
    }
}

/// Handle GitHub webhook events.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResponse {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());

    if event_type == "ping" {
        info!("Ping event received - webhook is configured correctly");
        return Ok((StatusCode::OK, Json(json!({ "status": "pong" }))));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;

    let Some(event) = WebhookEvent::parse(event_type, &payload) else {
        info!(event = %event_type, "Unhandled event");
        return ignored("unhandled event");
    };

    let Some(repo) = state.config.repo(event.repo_id()) else {
        warn!(repo = %event.repo_id(), "Webhook for unconfigured repository");
        return ignored("repository not configured");
    };

    if let Some(secret) = &repo.webhook_secret {
        if !verify_github_signature(secret, &body, signature) {
            warn!(repo = %repo.repo_id, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }
    }

    info!(event = %event_type, repo = %repo.repo_id, "Received GitHub webhook");
    match event {
        WebhookEvent::Push(push) => handle_push(&state, repo, push).await,
        WebhookEvent::Check { kind, event } => handle_check(&state, repo, kind, event).await,
    }
}

async fn handle_push(state: &AppState, repo: &RepoConfig, push: PushEvent) -> WebhookResponse {
    if push.deleted {
        return ignored("ref deleted");
    }

    let trigger = TriggerInfo {
        kind: TriggerKind::Push,
        action: None,
        sender: push.sender.clone(),
        git_ref: Some(push.git_ref.clone()),
    };
    start(
        state,
        repo,
        &push.after,
        push.branch.as_deref(),
        push.installation_id,
        trigger,
        push.head_commit.clone(),
    )
    .await
}

async fn handle_check(
    state: &AppState,
    repo: &RepoConfig,
    kind: TriggerKind,
    event: CheckEvent,
) -> WebhookResponse {
    match event.action {
        CheckAction::Rerun => {
            let trigger = TriggerInfo {
                kind,
                action: Some("rerun".to_string()),
                sender: event.sender.clone(),
                git_ref: None,
            };
            start(
                state,
                repo,
                &event.head_sha,
                None,
                event.installation_id,
                trigger,
                None,
            )
            .await
        }
        CheckAction::Stop {
            repo_id,
            execution_id,
        } => {
            if repo_id != repo.repo_id {
                return Err(ApiError::BadRequest(format!(
                    "execution {} belongs to {}",
                    execution_id, repo_id
                )));
            }
            let user = event.sender.as_deref().unwrap_or("unknown");
            state.bootstrap.stop(&repo_id, &execution_id, user).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "status": "stopping", "execution_id": execution_id })),
            ))
        }
    }
}

async fn start(
    state: &AppState,
    repo: &RepoConfig,
    commit_sha: &str,
    branch: Option<&str>,
    event_installation: Option<i64>,
    trigger: TriggerInfo,
    commit: Option<CommitMeta>,
) -> WebhookResponse {
    let manifest = state
        .manifests
        .fetch(
            &repo.repo_id,
            commit_sha,
            &state.config.manifest_file,
            repo.installation_id.or(event_installation),
        )
        .await?;

    let started = state
        .start_execution(StartRequest {
            repo_id: &repo.repo_id,
            manifest: manifest.as_deref(),
            commit_sha,
            branch,
            installation_id: event_installation,
            trigger,
            commit,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "execution_id": started.execution_id,
            "trace_id": started.trace_id,
        })),
    ))
}

/// Verify GitHub webhook signature.
fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
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

#[cfg(test)]
pub(crate) fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
