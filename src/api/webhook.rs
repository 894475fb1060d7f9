//! Webhook handler for GitHub status and deployment events

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State as AxumState},
    http::{HeaderMap, StatusCode},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::SharedState;
use crate::event::{EventEnvelope, EventKind};
use crate::github::verify_github_signature;
use crate::receiver::Outcome;

const EVENT_HEADER: &str = "X-GitHub-Event";
const DELIVERY_HEADER: &str = "X-GitHub-Delivery";
const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Handles the GitHub webhook POST request.
///
/// Accepted events are handed to the receiver on a background task and
/// answered with 202 straight away.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let event_name = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok());
    let Some(kind) = event_name.and_then(EventKind::from_github_event) else {
        info!("Ignoring {:?} event", event_name);
        return StatusCode::NO_CONTENT;
    };

    if state.config.github.has_webhook_secret() {
        let secret = state.config.github.webhook_secret.as_deref().unwrap_or_default();
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_github_signature(secret, &body, signature) {
            warn!("Invalid webhook signature from {}", remote.ip());
            return StatusCode::UNAUTHORIZED;
        }
    }

    let delivery = headers
        .get(DELIVERY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    let envelope = match EventEnvelope::new(
        kind,
        delivery,
        remote.ip().to_canonical().to_string(),
        state.config.github.token.clone(),
        body.to_vec(),
    ) {
        Ok(envelope) => envelope,
        Err(e) => {
            info!("Could not parse {} payload: {}", kind.as_str(), e);
            return StatusCode::BAD_REQUEST;
        }
    };

    debug!(guid = envelope.id(), "Accepted {} event", kind.as_str());
    let receiver = Arc::clone(&state.receiver);
    tokio::spawn(async move {
        match receiver.handle(&envelope).await {
            Ok(Outcome::Deployed(reports)) => {
                for report in reports {
                    info!(
                        guid = %report.guid,
                        "{} to {}: {:?}",
                        report.repository,
                        report.environment,
                        report.status
                    );
                }
            }
            Ok(Outcome::Ignored(reason)) => info!(guid = envelope.id(), "{}", reason),
            Ok(Outcome::Duplicate(id)) => {
                info!(guid = envelope.id(), "Skipped duplicate deployment {}", id)
            }
            Err(e) => error!(guid = envelope.id(), "Event handling failed: {}", e),
        }
    });

    StatusCode::ACCEPTED
}
