//! Entry point for one webhook event: origin check, dispatch, execution.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::evaluator::{CommitStatusEvaluator, Decision};
use crate::event::{EventEnvelope, EventFacts};
use crate::executor::{DeploymentExecutor, ExecutionReport};
use crate::idempotency::IdempotencyGuard;
use crate::remote_ip::RemoteIpValidator;

#[derive(Debug)]
pub enum Outcome {
    /// One report per execution, in dispatch order.
    Deployed(Vec<ExecutionReport>),
    Ignored(String),
    /// The deployment id was already executing.
    Duplicate(i64),
}

pub struct Receiver {
    validator: RemoteIpValidator,
    idempotency: IdempotencyGuard,
    evaluator: CommitStatusEvaluator,
    executor: Arc<DeploymentExecutor>,
}

impl Receiver {
    pub fn new(
        validator: RemoteIpValidator,
        idempotency: IdempotencyGuard,
        evaluator: CommitStatusEvaluator,
        executor: Arc<DeploymentExecutor>,
    ) -> Self {
        Self {
            validator,
            idempotency,
            evaluator,
            executor,
        }
    }

    pub fn in_flight(&self) -> Vec<i64> {
        self.idempotency.in_flight()
    }

    /// Handles one event to completion. Fails only on an untrusted origin
    /// or when the allow-list or registry cannot be read; deployment
    /// failures are reported through the returned [`Outcome`].
    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<Outcome> {
        if let Err(e) = self.validator.check(envelope.remote_ip()).await {
            warn!(guid = envelope.id(), "Rejecting {} event: {}", envelope.kind().as_str(), e);
            return Err(e);
        }

        match envelope.facts() {
            EventFacts::DeploymentRequest(facts) => {
                self.idempotency
                    .record(facts.id, envelope.raw_payload())
                    .await;
                let Some(claim) = self.idempotency.claim(facts.id) else {
                    info!(guid = envelope.id(), "Deployment {} is already running", facts.id);
                    return Ok(Outcome::Duplicate(facts.id));
                };
                debug!(guid = envelope.id(), "Claimed deployment {}", claim.id());
                let report = self
                    .executor
                    .execute(facts, envelope.id(), envelope.credential_token())
                    .await;
                Ok(Outcome::Deployed(vec![report]))
            }
            EventFacts::CommitStatus(facts) => {
                let dispatched = self.evaluator.evaluate(facts, envelope.id()).await?;
                if dispatched.is_empty() {
                    let reason = match Decision::decide(facts) {
                        Decision::Deploy => {
                            format!("No deployment targets for {}", facts.repo_full_name)
                        }
                        skipped => skipped.to_string(),
                    };
                    return Ok(Outcome::Ignored(reason));
                }

                let mut reports = Vec::with_capacity(dispatched.len());
                for dispatch in &dispatched {
                    let report = self
                        .executor
                        .execute(&dispatch.request, &dispatch.guid, envelope.credential_token())
                        .await;
                    reports.push(report);
                }
                Ok(Outcome::Deployed(reports))
            }
        }
    }
}
