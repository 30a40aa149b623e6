//! Request/response sub-protocol.
//!
//! An instance may have one outstanding request per declared request name.
//! Issuing a request sends the message, records a [`PendingRequest`] and
//! arms the `request:<name>` timeout slot. Exactly one of Completed,
//! Faulted or TimeoutExpired is then delivered to the instance; any later
//! outcome for the same request is stale.

use std::time::Duration;

use common::RequestId;

use crate::clock::to_time_delta;
use crate::context::{BehaviorContext, Effect};
use crate::error::ActivityError;
use crate::event::{Outcome, Response, SagaMessage, TimeoutPayload};
use crate::instance::{PendingRequest, SagaData, SagaInstance};
use crate::messaging::Headers;

/// Declaration of a request an instance may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    name: &'static str,
    destination: String,
    timeout: Duration,
}

impl RequestSpec {
    pub fn new(name: &'static str, destination: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name,
            destination: destination.into(),
            timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Timeout slot reserved for a request's deadline.
pub fn timeout_slot(request: &str) -> String {
    format!("request:{request}")
}

impl<D: SagaData, M: SagaMessage> BehaviorContext<'_, D, M> {
    /// Issues the named request.
    ///
    /// Replaces any outstanding request of the same name; its outcome will
    /// be dropped as stale when it arrives.
    pub fn request(&mut self, request: &str, message: M) -> Result<RequestId, ActivityError> {
        let spec = self
            .definition
            .request(request)
            .ok_or_else(|| ActivityError::UndeclaredRequest(request.to_string()))?;

        let request_id = RequestId::new();
        let now = self.now();
        self.instance.set_pending(
            spec.name(),
            PendingRequest {
                request_id,
                requested_at: now,
                deadline: now + to_time_delta(spec.timeout()),
            },
        );

        let headers = self.headers(Some((spec.name(), request_id)));
        self.outbox.push(Effect::Send {
            destination: spec.destination().to_string(),
            message,
            headers,
        });

        self.arm(
            &timeout_slot(spec.name()),
            spec.timeout(),
            TimeoutPayload::RequestExpired {
                request: spec.name().to_string(),
                request_id,
            },
        );

        tracing::debug!(
            saga_type = self.saga_type(),
            request = spec.name(),
            %request_id,
            "request issued"
        );
        Ok(request_id)
    }
}

/// Consumes the pending entry for `request` if `request_id` matches it.
///
/// Returns false when the outcome is stale: no request of that name is
/// outstanding, or a newer one replaced it.
pub(crate) fn settle<D>(
    instance: &mut SagaInstance<D>,
    request: &str,
    request_id: RequestId,
) -> bool {
    match instance.pending_request(request) {
        Some(pending) if pending.request_id == request_id => {
            instance.clear_pending(request);
            instance.clear_slot(&timeout_slot(request));
            true
        }
        _ => false,
    }
}

impl Headers {
    /// Builds the response for a request sent with these headers.
    ///
    /// Returns None if the headers do not belong to a request.
    pub fn reply<M>(&self, outcome: Outcome<M>) -> Option<Response<M>> {
        Some(Response {
            saga_type: self.saga_type.clone(),
            correlation_id: self.correlation_id,
            request: self.request.clone()?,
            request_id: self.request_id?,
            outcome,
        })
    }
}
