use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::{info, warn};

use super::api_types::{HealthResponse, StatusResponse, WebhookResponse};
use super::branch_gate::GateDecision;
use super::payload::PushEvent;
use super::signature::{SignatureStatus, SIGNATURE_HEADER};
use super::WebhookState;
use crate::deploy::git::Git;
use crate::deploy::record::short_sha;
use crate::deploy::{DeployRequest, Submission};

const EVENT_HEADER: &str = "X-GitHub-Event";
const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

type WebhookReply = (StatusCode, Json<WebhookResponse>);

fn reply(status_code: StatusCode, response: WebhookResponse) -> WebhookReply {
    (status_code, Json(response))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[allow(clippy::too_many_lines)]
pub(super) async fn receive_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookReply {
    let delivery_id = header_str(&headers, DELIVERY_HEADER).map(ToString::to_string);
    let delivery = delivery_id.as_deref().unwrap_or("-");

    if state
        .verifier
        .verify(&body, header_str(&headers, SIGNATURE_HEADER))
        == SignatureStatus::Invalid
    {
        warn!(%delivery, "rejected webhook with missing or invalid signature");
        return reply(
            StatusCode::UNAUTHORIZED,
            WebhookResponse::new("unauthorized", "invalid webhook signature"),
        );
    }

    // Deliveries without an event header are treated as pushes; the payload decides.
    match header_str(&headers, EVENT_HEADER).unwrap_or("push") {
        "push" => {}
        "ping" => {
            info!(%delivery, "webhook ping received");
            return reply(StatusCode::OK, WebhookResponse::new("pong", "pong"));
        }
        other => {
            info!(%delivery, event = %other, "ignoring non-push event");
            return reply(
                StatusCode::OK,
                WebhookResponse::new("ignored", format!("event '{other}' is not deployed")),
            );
        }
    }

    let event = match PushEvent::parse(&body) {
        Ok(event) => event,
        Err(error) => {
            warn!(%delivery, error = %error, "unparsable push payload");
            return reply(
                StatusCode::BAD_REQUEST,
                WebhookResponse::new("invalid", format!("invalid push payload: {error}")),
            );
        }
    };

    let branch = match state.gate.evaluate(&event.reference) {
        GateDecision::Admit { branch } => branch,
        GateDecision::Reject { branch } => {
            info!(%delivery, %branch, repository = %event.repository_name(), "branch not allow-listed; ignored");
            return reply(
                StatusCode::OK,
                WebhookResponse::new("ignored", format!("branch '{branch}' is not deployed"))
                    .for_target(&branch, event.commit_sha()),
            );
        }
    };

    if event.is_branch_deletion() {
        info!(%delivery, %branch, "branch deletion ignored");
        return reply(
            StatusCode::OK,
            WebhookResponse::new("ignored", format!("branch '{branch}' was deleted"))
                .for_target(&branch, None),
        );
    }

    let commit_sha = event.commit_sha().map(ToString::to_string);
    if let Some(sha) = commit_sha.as_deref() {
        if let Err(error) = Git::validate_commit(sha) {
            warn!(%delivery, %branch, error = %error, "push carried an unusable commit id");
            return reply(
                StatusCode::BAD_REQUEST,
                WebhookResponse::new("invalid", format!("{error:#}")).for_target(&branch, None),
            );
        }
    }

    let request = DeployRequest::new(branch.clone(), commit_sha.clone())
        .with_delivery_id(delivery_id.clone());
    let submission = state.queue.submit(request).await;
    let commit = short_sha(commit_sha.as_deref());
    info!(
        %delivery,
        %branch,
        %commit,
        repository = %event.repository_name(),
        outcome = submission.status(),
        "push admitted"
    );

    let (status_code, message) = match &submission {
        Submission::Started => (
            StatusCode::ACCEPTED,
            format!("deploy of {branch} at {commit} started"),
        ),
        Submission::Queued => (
            StatusCode::ACCEPTED,
            format!("deploy of {branch} at {commit} queued behind the running deploy"),
        ),
        Submission::Superseded { replaced } => (
            StatusCode::ACCEPTED,
            format!(
                "deploy of {branch} at {commit} queued, replacing {} at {}",
                replaced.branch,
                short_sha(replaced.commit_sha.as_deref())
            ),
        ),
        Submission::Duplicate => (
            StatusCode::ACCEPTED,
            format!("{branch} at {commit} is already running or queued"),
        ),
        Submission::ShuttingDown => (
            StatusCode::SERVICE_UNAVAILABLE,
            "listener is shutting down; redeliver later".to_string(),
        ),
    };

    reply(
        status_code,
        WebhookResponse::new(submission.status(), message)
            .for_target(&branch, commit_sha.as_deref()),
    )
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(super) async fn status(State(state): State<WebhookState>) -> Json<StatusResponse> {
    let snapshot = state.queue.snapshot().await;
    let log = state.log.clone();
    let last_deploy = match tokio::task::spawn_blocking(move || log.last()).await {
        Ok(Ok(record)) => record,
        Ok(Err(error)) => {
            warn!(error = %format!("{error:#}"), "failed to read deploy log");
            None
        }
        Err(join_error) => {
            warn!(error = %join_error, "deploy log reader panicked");
            None
        }
    };

    Json(StatusResponse {
        running: snapshot.running,
        pending: snapshot.pending,
        last_deploy,
    })
}
