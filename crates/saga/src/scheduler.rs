//! Scheduled timeouts.
//!
//! Scheduling stores a fresh [`ScheduleToken`] in a named slot of the
//! instance and asks the [`TimerService`] to deliver a [`Timeout`] tagged
//! with that token. When the timeout arrives the engine applies it only if
//! the slot still holds the same token. Rescheduling or unscheduling
//! replaces or clears the token, which turns the outstanding timer into a
//! no-op; timers are never cancelled at the provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ScheduleToken;
use tokio::sync::mpsc;

use crate::clock::{Clock, ManualClock, to_time_delta};
use crate::context::{BehaviorContext, Effect};
use crate::error::TransportError;
use crate::event::{Envelope, SagaMessage, Timeout, TimeoutPayload};
use crate::instance::SagaData;

/// Delivers timeouts after a delay.
#[async_trait]
pub trait TimerService<M: SagaMessage>: Send + Sync {
    /// Arranges for `timeout` to be dispatched after `delay`.
    async fn schedule(&self, delay: Duration, timeout: Timeout<M>) -> Result<(), TransportError>;
}

impl<D: SagaData, M: SagaMessage> BehaviorContext<'_, D, M> {
    /// Schedules `message` to be delivered back to this instance after
    /// `delay`, replacing whatever the slot held.
    pub fn schedule(&mut self, slot: &str, delay: Duration, message: M) -> ScheduleToken {
        self.arm(slot, delay, TimeoutPayload::Message(message))
    }

    /// Clears a slot so its outstanding timeout is ignored on arrival.
    ///
    /// Returns the token that was cleared, if any.
    pub fn unschedule(&mut self, slot: &str) -> Option<ScheduleToken> {
        let cleared = self.instance.clear_slot(slot);
        if cleared.is_some() {
            tracing::debug!(saga_type = self.saga_type(), slot, "timeout unscheduled");
        }
        cleared
    }

    pub(crate) fn arm(
        &mut self,
        slot: &str,
        delay: Duration,
        payload: TimeoutPayload<M>,
    ) -> ScheduleToken {
        let token = ScheduleToken::new();
        if self.instance.set_slot(slot, token).is_some() {
            tracing::debug!(saga_type = self.saga_type(), slot, "timeout rescheduled");
        }

        let timeout = Timeout {
            saga_type: self.saga_type().to_string(),
            correlation_id: self.correlation_id(),
            slot: slot.to_string(),
            token,
            payload,
        };
        self.outbox.push(Effect::Schedule { delay, timeout });
        token
    }
}

/// Timer backed by the tokio runtime.
///
/// Each timeout is a spawned task that sleeps and then pushes the timeout
/// into the engine's inbox.
#[derive(Debug, Clone)]
pub struct TokioTimer<M> {
    inbox: mpsc::UnboundedSender<Envelope<M>>,
}

impl<M: SagaMessage> TokioTimer<M> {
    pub fn new(inbox: mpsc::UnboundedSender<Envelope<M>>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl<M: SagaMessage> TimerService<M> for TokioTimer<M> {
    async fn schedule(&self, delay: Duration, timeout: Timeout<M>) -> Result<(), TransportError> {
        if self.inbox.is_closed() {
            return Err(TransportError::Timer("inbox closed".to_string()));
        }

        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inbox.send(Envelope::Timeout(timeout)).is_err() {
                tracing::debug!("timeout dropped, inbox closed");
            }
        });
        Ok(())
    }
}

struct PendingTimeout<M> {
    due: DateTime<Utc>,
    seq: u64,
    timeout: Timeout<M>,
}

struct ManualTimerState<M> {
    pending: Vec<PendingTimeout<M>>,
    next_seq: u64,
}

/// Timer driven by a [`ManualClock`], for deterministic tests.
///
/// Timeouts are held until the test advances the clock past their due time.
pub struct ManualTimer<M> {
    clock: ManualClock,
    state: Arc<Mutex<ManualTimerState<M>>>,
}

impl<M> Clone for ManualTimer<M> {
    fn clone(&self) -> Self {
        Self {
            clock: self.clock.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<M: SagaMessage> ManualTimer<M> {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(ManualTimerState {
                pending: Vec::new(),
                next_seq: 0,
            })),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Number of timeouts not yet due.
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Advances the clock and returns the timeouts that became due, in due
    /// order. Timeouts due at the same instant keep their scheduling order.
    pub fn advance(&self, by: Duration) -> Vec<Envelope<M>> {
        self.clock.advance(by);
        let now = self.clock.now();

        let mut state = self.state.lock().unwrap();
        let (mut due, pending): (Vec<_>, Vec<_>) =
            state.pending.drain(..).partition(|p| p.due <= now);
        state.pending = pending;

        due.sort_by_key(|p| (p.due, p.seq));
        due.into_iter()
            .map(|p| Envelope::Timeout(p.timeout))
            .collect()
    }
}

#[async_trait]
impl<M: SagaMessage> TimerService<M> for ManualTimer<M> {
    async fn schedule(&self, delay: Duration, timeout: Timeout<M>) -> Result<(), TransportError> {
        let due = self.clock.now() + to_time_delta(delay);
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(PendingTimeout { due, seq, timeout });
        Ok(())
    }
}
