//! Event dispatcher.
//!
//! One [`SagaEngine`] runs one [`SagaDefinition`]. For every envelope it
//! resolves the target instance, evaluates the transition table, stores
//! the result under an optimistic version check and only then releases the
//! buffered outbound effects.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use common::CorrelationId;
use saga_store::{RepositoryError, SagaRepository};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::clock::{Clock, SystemClock};
use crate::composite;
use crate::config::{EngineConfig, FinalizePolicy};
use crate::context::{BehaviorContext, Effect, Outbox, Trigger};
use crate::correlation::{self, Resolution};
use crate::definition::{MissingInstance, Rule, SagaDefinition};
use crate::error::{ActivityError, Result, SagaError};
use crate::event::{Envelope, EventKey, Outcome, SagaMessage, TimeoutPayload};
use crate::instance::{SagaData, SagaInstance};
use crate::lock::KeyedLocks;
use crate::messaging::MessageBus;
use crate::request;
use crate::scheduler::TimerService;

/// What a dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new instance was created and stored.
    Created {
        correlation_id: CorrelationId,
        state: String,
    },

    /// An existing instance handled the event.
    Updated {
        correlation_id: CorrelationId,
        from: String,
        to: String,
    },

    /// The instance reached a final state.
    Finalized { correlation_id: CorrelationId },

    /// A read-only event was handled; nothing was stored.
    Observed { correlation_id: CorrelationId },

    /// The event is declared Ignore in the instance's state.
    Ignored { correlation_id: CorrelationId },

    /// No rule handles the event in the instance's state, or the envelope
    /// does not belong to this definition.
    Unhandled,

    /// A timeout or request outcome that is no longer current.
    Stale { correlation_id: CorrelationId },

    /// No instance matched and none could be created.
    Missing,
}

impl DispatchOutcome {
    /// Short name used as a metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Created { .. } => "created",
            DispatchOutcome::Updated { .. } => "updated",
            DispatchOutcome::Finalized { .. } => "finalized",
            DispatchOutcome::Observed { .. } => "observed",
            DispatchOutcome::Ignored { .. } => "ignored",
            DispatchOutcome::Unhandled => "unhandled",
            DispatchOutcome::Stale { .. } => "stale",
            DispatchOutcome::Missing => "missing",
        }
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            DispatchOutcome::Created { correlation_id, .. }
            | DispatchOutcome::Updated { correlation_id, .. }
            | DispatchOutcome::Finalized { correlation_id }
            | DispatchOutcome::Observed { correlation_id }
            | DispatchOutcome::Ignored { correlation_id }
            | DispatchOutcome::Stale { correlation_id } => Some(*correlation_id),
            DispatchOutcome::Unhandled | DispatchOutcome::Missing => None,
        }
    }

    /// Returns true if the envelope was dropped without effect.
    pub fn is_dropped(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Unhandled | DispatchOutcome::Stale { .. } | DispatchOutcome::Missing
        )
    }
}

/// Runs one saga definition against a repository and a message bus.
pub struct SagaEngine<D, M, R> {
    definition: Arc<SagaDefinition<D, M>>,
    repository: R,
    bus: Arc<dyn MessageBus<M>>,
    timer: Arc<dyn TimerService<M>>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
    config: EngineConfig,
}

impl<D, M, R> SagaEngine<D, M, R>
where
    D: SagaData,
    M: SagaMessage,
    R: SagaRepository,
{
    /// Creates an engine using the system clock and default settings.
    pub fn new(
        definition: SagaDefinition<D, M>,
        repository: R,
        bus: Arc<dyn MessageBus<M>>,
        timer: Arc<dyn TimerService<M>>,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            repository,
            bus,
            timer,
            clock: Arc::new(SystemClock),
            locks: KeyedLocks::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn definition(&self) -> &SagaDefinition<D, M> {
        &self.definition
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Loads an instance by correlation id.
    pub async fn get(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance<D>>> {
        let record = self
            .repository
            .load(self.definition.name(), correlation_id)
            .await?;
        Ok(record.map(SagaInstance::<D>::from_record).transpose()?)
    }

    /// Dispatches one envelope, retrying on concurrency conflicts.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            saga_type = self.definition.name(),
            kind = envelope.kind(),
            event = %envelope.describe(),
        )
    )]
    pub async fn dispatch(&self, envelope: Envelope<M>) -> Result<DispatchOutcome> {
        let saga_type = self.definition.name();
        let started = Instant::now();
        let max_retries = self.config.max_concurrency_retries;

        let mut retries = 0;
        let result = loop {
            match self.dispatch_once(&envelope).await {
                Err(SagaError::Repository(e)) if is_retryable(&e) => {
                    if retries >= max_retries {
                        tracing::error!(attempts = retries + 1, error = %e, "giving up after concurrency conflicts");
                        break Err(SagaError::RetriesExhausted {
                            attempts: retries + 1,
                            last: e,
                        });
                    }
                    retries += 1;
                    metrics::counter!("saga_concurrency_retries", "saga_type" => saga_type)
                        .increment(1);
                    tracing::debug!(retry = retries, error = %e, "concurrency conflict, retrying");
                }
                other => break other,
            }
        };

        metrics::histogram!("saga_dispatch_duration_seconds", "saga_type" => saga_type)
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => {
                metrics::counter!(
                    "saga_dispatch_total",
                    "saga_type" => saga_type,
                    "outcome" => outcome.label()
                )
                .increment(1);
                if outcome.is_dropped() {
                    metrics::counter!("saga_dispatch_dropped", "saga_type" => saga_type)
                        .increment(1);
                }
            }
            Err(e) => {
                metrics::counter!(
                    "saga_dispatch_total",
                    "saga_type" => saga_type,
                    "outcome" => "error"
                )
                .increment(1);
                tracing::warn!(error = %e, "dispatch failed");
            }
        }

        result
    }

    async fn dispatch_once(&self, envelope: &Envelope<M>) -> Result<DispatchOutcome> {
        let definition = &*self.definition;
        let saga_type = definition.name();

        let (correlation_id, may_create) =
            match correlation::resolve(definition, &self.repository, envelope).await? {
                Resolution::Found {
                    correlation_id,
                    may_create,
                } => (correlation_id, may_create),
                Resolution::Missing => return self.missing(envelope).await,
                Resolution::Unroutable => return Ok(DispatchOutcome::Unhandled),
            };

        let _guard = self.locks.lock(correlation_id).await;
        let now = self.clock.now();

        let (mut instance, created) = match self.repository.load(saga_type, correlation_id).await? {
            Some(record) => (SagaInstance::<D>::from_record(record)?, false),
            None if may_create => (SagaInstance::new(correlation_id, now), true),
            None => return self.missing(envelope).await,
        };

        let start_state =
            definition
                .state(instance.state())
                .ok_or_else(|| SagaError::InvalidState {
                    correlation_id,
                    state: instance.state().to_string(),
                })?;

        // Archived final instances are frozen; late timers and outcomes for
        // them are stale, messages are unhandled.
        if !created && definition.is_final(start_state) {
            return Ok(match envelope {
                Envelope::Message(_) => DispatchOutcome::Unhandled,
                Envelope::Timeout(_) | Envelope::Response(_) => {
                    tracing::debug!(%correlation_id, "delivery to finalized saga dropped");
                    DispatchOutcome::Stale { correlation_id }
                }
            });
        }

        // Consuming a timer slot or a pending request must be stored even if
        // no rule handles the event, otherwise a second outcome could match.
        let mut dirty = false;
        let mut response_address = None;
        let (key, trigger) = match envelope {
            Envelope::Message(delivery) => {
                response_address = delivery.response_address.as_ref();
                (
                    EventKey::Message(delivery.message.message_type()),
                    Trigger::Message(&delivery.message),
                )
            }
            Envelope::Timeout(timeout) => {
                if instance.slot(&timeout.slot) != Some(timeout.token) {
                    tracing::debug!(slot = %timeout.slot, "stale timeout dropped");
                    return Ok(DispatchOutcome::Stale { correlation_id });
                }
                instance.clear_slot(&timeout.slot);
                dirty = true;

                match &timeout.payload {
                    TimeoutPayload::Message(message) => (
                        EventKey::Message(message.message_type()),
                        Trigger::Message(message),
                    ),
                    TimeoutPayload::RequestExpired {
                        request,
                        request_id,
                    } => {
                        let Some(spec) = definition.request(request) else {
                            return Ok(DispatchOutcome::Unhandled);
                        };
                        if !request::settle(&mut instance, spec.name(), *request_id) {
                            tracing::debug!(request = spec.name(), "stale request deadline dropped");
                            return Ok(DispatchOutcome::Stale { correlation_id });
                        }
                        (EventKey::TimeoutExpired(spec.name()), Trigger::Expired)
                    }
                }
            }
            Envelope::Response(response) => {
                let Some(spec) = definition.request(&response.request) else {
                    return Ok(DispatchOutcome::Unhandled);
                };
                if !request::settle(&mut instance, spec.name(), response.request_id) {
                    tracing::debug!(request = spec.name(), "stale request outcome dropped");
                    return Ok(DispatchOutcome::Stale { correlation_id });
                }
                dirty = true;

                match &response.outcome {
                    Outcome::Completed(message) => (
                        EventKey::Completed(spec.name()),
                        Trigger::Message(message),
                    ),
                    Outcome::Faulted(fault) => {
                        (EventKey::Faulted(spec.name()), Trigger::Fault(fault))
                    }
                }
            }
        };

        let read_only = match envelope {
            Envelope::Message(delivery) => definition
                .event(delivery.message.message_type())
                .is_some_and(|event| event.is_read_only()),
            _ => false,
        };

        let rules = definition.rules(start_state, key);
        let ignored = rules.iter().any(|rule| matches!(rule, Rule::Ignore));
        let activity_error = |event: EventKey, source: ActivityError| SagaError::Activity {
            saga_type,
            event: event.to_string(),
            source,
        };

        let mut handled = false;
        let mut ctx = BehaviorContext::new(
            definition,
            &mut instance,
            trigger,
            response_address,
            now,
        );

        if !ignored {
            for rule in &rules {
                if let Rule::Transition(transition) = rule {
                    transition
                        .execute(&mut ctx)
                        .await
                        .map_err(|e| activity_error(key, e))?;
                    handled = true;
                }
            }
        }

        // Prerequisites count whether or not the event has rules of its own
        // in this state.
        if !read_only {
            let progress =
                composite::track(definition.composites(), key, start_state, &mut *ctx.instance);
            dirty |= progress.changed;

            for completed in progress.completed {
                let Some(current) = definition.state(ctx.state()) else {
                    break;
                };
                tracing::debug!(composite = completed.name(), "composite event raised");
                ctx.set_trigger(Trigger::Composite(completed.name()));
                for rule in definition.rules(current, completed.key()) {
                    if let Rule::Transition(transition) = rule {
                        transition
                            .execute(&mut ctx)
                            .await
                            .map_err(|e| activity_error(completed.key(), e))?;
                        handled = true;
                    }
                }
            }
        }

        let outbox = ctx.into_outbox();

        if read_only {
            self.flush(outbox).await?;
            return Ok(if handled {
                DispatchOutcome::Observed { correlation_id }
            } else {
                DispatchOutcome::Unhandled
            });
        }

        if !handled && (created || !dirty) {
            return Ok(if ignored {
                DispatchOutcome::Ignored { correlation_id }
            } else {
                DispatchOutcome::Unhandled
            });
        }

        let end_state = instance.state().to_string();
        let outcome = if definition.is_final(&end_state) {
            match self.config.finalize_policy {
                FinalizePolicy::Remove if created => {}
                FinalizePolicy::Remove => {
                    self.repository
                        .delete(saga_type, correlation_id, instance.version())
                        .await?;
                }
                FinalizePolicy::Archive => self.persist(&mut instance, created, now).await?,
            }
            tracing::info!(%correlation_id, state = %end_state, "saga finalized");
            DispatchOutcome::Finalized { correlation_id }
        } else {
            self.persist(&mut instance, created, now).await?;
            if !handled {
                if ignored {
                    DispatchOutcome::Ignored { correlation_id }
                } else {
                    DispatchOutcome::Unhandled
                }
            } else if created {
                tracing::info!(%correlation_id, state = %end_state, "saga created");
                DispatchOutcome::Created {
                    correlation_id,
                    state: end_state,
                }
            } else {
                tracing::debug!(%correlation_id, from = start_state, to = %end_state, "saga updated");
                DispatchOutcome::Updated {
                    correlation_id,
                    from: start_state.to_string(),
                    to: end_state,
                }
            }
        };

        self.flush(outbox).await?;
        Ok(outcome)
    }

    async fn persist(
        &self,
        instance: &mut SagaInstance<D>,
        created: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        instance.touch(now);
        let unique_key = self.definition.unique_key(instance.data());
        let record = instance.to_record(self.definition.name(), unique_key)?;
        if created {
            self.repository.insert(record).await?;
        } else {
            self.repository.save(record, instance.version()).await?;
        }
        Ok(())
    }

    /// Releases buffered effects in the order activities produced them.
    async fn flush(&self, outbox: Outbox<M>) -> Result<()> {
        if outbox.is_empty() {
            return Ok(());
        }
        for effect in outbox.into_effects() {
            match effect {
                Effect::Publish(message) => self.bus.publish(message).await?,
                Effect::Send {
                    destination,
                    message,
                    headers,
                } => self.bus.send(&destination, message, headers).await?,
                Effect::Respond { address, message } => {
                    self.bus.respond(&address, message).await?
                }
                Effect::Schedule { delay, timeout } => self.timer.schedule(delay, timeout).await?,
            }
        }
        Ok(())
    }

    /// Applies the missing-instance policy of the envelope's event.
    async fn missing(&self, envelope: &Envelope<M>) -> Result<DispatchOutcome> {
        let saga_type = self.definition.name();
        let Envelope::Message(delivery) = envelope else {
            tracing::debug!("instance no longer exists");
            return Ok(DispatchOutcome::Missing);
        };

        let message_type = delivery.message.message_type();
        let Some(event) = self.definition.event(message_type) else {
            return Ok(DispatchOutcome::Unhandled);
        };

        match &event.missing {
            MissingInstance::Ignore => {
                tracing::debug!(message_type, "no matching instance");
                Ok(DispatchOutcome::Missing)
            }
            MissingInstance::Fault => Err(SagaError::MissingInstance {
                saga_type,
                event: message_type.to_string(),
            }),
            MissingInstance::Respond(reply) => {
                match &delivery.response_address {
                    Some(address) => self.bus.respond(address, reply(&delivery.message)).await?,
                    None => tracing::warn!(message_type, "no matching instance and no response address"),
                }
                Ok(DispatchOutcome::Missing)
            }
        }
    }
}

impl<D, M, R> SagaEngine<D, M, R>
where
    D: SagaData,
    M: SagaMessage,
    R: SagaRepository + 'static,
{
    /// Dispatches envelopes from `inbox` until it closes, one task each.
    ///
    /// Dispatch errors are logged; the loop keeps running.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope<M>>) {
        let mut tasks = JoinSet::new();

        while let Some(envelope) = inbox.recv().await {
            let engine = Arc::clone(&self);
            tasks.spawn(async move {
                if let Err(e) = engine.dispatch(envelope).await {
                    tracing::error!(error = %e, "dispatch failed");
                }
            });
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "dispatch task panicked");
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "dispatch task panicked");
            }
        }
        tracing::info!(saga_type = self.definition.name(), "inbox closed, engine stopped");
    }
}

fn is_retryable(error: &RepositoryError) -> bool {
    error.is_conflict() || matches!(error, RepositoryError::NotFound(_))
}
