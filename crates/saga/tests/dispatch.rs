//! Integration tests for the dispatcher: correlation, transition rules,
//! timers, requests, persistence and retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use saga::prelude::*;
use saga::{
    DispatchOutcome, EngineConfig, Envelope, FinalizePolicy, InMemoryBus, InMemorySagaRepository,
    ManualClock, ManualTimer, Outcome, ResponseAddress, SagaEngine, SagaError, SagaRepository,
    TimerService, TokioTimer,
};
use saga::{Delivery, Fault};
use saga_store::{RepositoryError, SagaRecord, Version};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Gate {
    opens: u32,
    touches: u32,
    reminders: u32,
    note: Option<String>,
    inspected: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
enum GateMessage {
    Open(CorrelationId),
    Touch(CorrelationId),
    Ping(CorrelationId),
    Close(CorrelationId),
    Arm(CorrelationId, u64),
    Disarm(CorrelationId),
    Remind(CorrelationId),
    Inspect(CorrelationId),
    Jam(CorrelationId),
    Query(CorrelationId),
    InspectGate(CorrelationId),
    Inspected(bool),
    Opened(CorrelationId),
    Touched(CorrelationId),
    Report(String),
    NotFound,
}

impl SagaMessage for GateMessage {
    fn message_type(&self) -> &'static str {
        match self {
            GateMessage::Open(_) => "Open",
            GateMessage::Touch(_) => "Touch",
            GateMessage::Ping(_) => "Ping",
            GateMessage::Close(_) => "Close",
            GateMessage::Arm(..) => "Arm",
            GateMessage::Disarm(_) => "Disarm",
            GateMessage::Remind(_) => "Remind",
            GateMessage::Inspect(_) => "Inspect",
            GateMessage::Jam(_) => "Jam",
            GateMessage::Query(_) => "Query",
            GateMessage::InspectGate(_) => "InspectGate",
            GateMessage::Inspected(_) => "Inspected",
            GateMessage::Opened(_) => "Opened",
            GateMessage::Touched(_) => "Touched",
            GateMessage::Report(_) => "Report",
            GateMessage::NotFound => "NotFound",
        }
    }
}

impl GateMessage {
    fn gate_id(&self) -> Option<CorrelationId> {
        match self {
            GateMessage::Open(id)
            | GateMessage::Touch(id)
            | GateMessage::Ping(id)
            | GateMessage::Close(id)
            | GateMessage::Arm(id, _)
            | GateMessage::Disarm(id)
            | GateMessage::Remind(id)
            | GateMessage::Inspect(id)
            | GateMessage::Jam(id)
            | GateMessage::Query(id) => Some(*id),
            _ => None,
        }
    }
}

const STATES: &[&str] = &["Open", "Inspecting"];

fn gate_definition() -> SagaDefinition<Gate, GateMessage> {
    SagaDefinition::<Gate, GateMessage>::builder("Gate")
        .states(STATES)
        .request(RequestSpec::new(
            "InspectGate",
            "inspector",
            Duration::from_secs(30),
        ))
        .event("Open", |e| e.by_id(GateMessage::gate_id))
        .event("Touch", |e| e.by_id(GateMessage::gate_id))
        .event("Ping", |e| e.by_id(GateMessage::gate_id))
        .event("Close", |e| e.by_id(GateMessage::gate_id))
        .event("Arm", |e| e.by_id(GateMessage::gate_id))
        .event("Disarm", |e| e.by_id(GateMessage::gate_id))
        .event("Inspect", |e| e.by_id(GateMessage::gate_id))
        .event("Jam", |e| e.by_id(GateMessage::gate_id).fault_when_missing())
        .event("Query", |e| {
            e.by_id(GateMessage::gate_id)
                .read_only()
                .respond_when_missing(|_| GateMessage::NotFound)
        })
        .initially("Open", |t| {
            t.then(|ctx| ctx.data_mut().opens += 1)
                .publish(|ctx| GateMessage::Opened(ctx.correlation_id()))
                .transition_to("Open")
        })
        .ignore(&["Open"], "Ping")
        .during_any("Touch", |t| {
            t.then(|ctx| ctx.data_mut().touches += 1)
                .publish(|ctx| GateMessage::Touched(ctx.correlation_id()))
        })
        .during(&["Open"], "Close", |t| {
            t.guard(|ctx| ctx.data().reminders == 0)
                .finalize()
                .otherwise(|b| b.then(|ctx| ctx.data_mut().note = Some("busy".into())))
        })
        .during(&["Open"], "Arm", |t| {
            t.schedule(
                "Reminder",
                |ctx| match ctx.message() {
                    Some(GateMessage::Arm(_, secs)) => Duration::from_secs(*secs),
                    _ => Duration::ZERO,
                },
                |ctx| GateMessage::Remind(ctx.correlation_id()),
            )
        })
        .during(&["Open"], "Disarm", |t| t.unschedule("Reminder"))
        .during(&["Open"], "Remind", |t| {
            t.then(|ctx| ctx.data_mut().reminders += 1)
        })
        .during(&["Open"], "Inspect", |t| {
            t.request("InspectGate", |ctx| {
                GateMessage::InspectGate(ctx.correlation_id())
            })
            .transition_to("Inspecting")
        })
        .during(&["Inspecting"], EventKey::Completed("InspectGate"), |t| {
            t.then(|ctx| {
                if let Some(GateMessage::Inspected(ok)) = ctx.message() {
                    ctx.data_mut().inspected = Some(*ok);
                }
            })
            .transition_to("Open")
        })
        .during(&["Inspecting"], EventKey::Faulted("InspectGate"), |t| {
            t.then(|ctx| {
                let reason = ctx.fault().map(|f| f.reason.clone());
                ctx.data_mut().note = reason;
            })
            .transition_to("Open")
        })
        .during(&["Inspecting"], EventKey::TimeoutExpired("InspectGate"), |t| {
            t.then(|ctx| ctx.data_mut().note = Some("timed out".into()))
                .transition_to("Open")
        })
        .during(&["Open"], "Jam", |t| {
            t.publish(|ctx| GateMessage::Touched(ctx.correlation_id()))
                .try_then(|_| Err(ActivityError::rejected("gate is jammed")))
        })
        .during_any("Query", |t| {
            t.then(|ctx| ctx.data_mut().note = Some("queried".into()))
                .respond(|ctx| GateMessage::Report(ctx.state().to_string()))
        })
        .build()
        .unwrap()
}

struct Harness<R: SagaRepository> {
    engine: Arc<SagaEngine<Gate, GateMessage, R>>,
    repository: R,
    bus: InMemoryBus<GateMessage>,
    timer: ManualTimer<GateMessage>,
}

fn harness() -> Harness<InMemorySagaRepository> {
    harness_with(InMemorySagaRepository::new(), EngineConfig::default())
}

fn harness_with<R: SagaRepository + Clone + 'static>(
    repository: R,
    config: EngineConfig,
) -> Harness<R> {
    let clock = ManualClock::default();
    let bus = InMemoryBus::new();
    let timer = ManualTimer::new(clock.clone());
    let engine = SagaEngine::new(
        gate_definition(),
        repository.clone(),
        Arc::new(bus.clone()),
        Arc::new(timer.clone()),
    )
    .with_clock(Arc::new(clock))
    .with_config(config);

    Harness {
        engine: Arc::new(engine),
        repository,
        bus,
        timer,
    }
}

impl<R: SagaRepository> Harness<R> {
    async fn send(&self, message: GateMessage) -> DispatchOutcome {
        self.engine.dispatch(Envelope::message(message)).await.unwrap()
    }

    async fn gate(&self, id: CorrelationId) -> saga::SagaInstance<Gate> {
        self.engine.get(id).await.unwrap().expect("gate exists")
    }

    async fn record(&self, id: CorrelationId) -> Option<SagaRecord> {
        self.repository.load("Gate", id).await.unwrap()
    }

    async fn advance(&self, secs: u64) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        for envelope in self.timer.advance(Duration::from_secs(secs)) {
            outcomes.push(self.engine.dispatch(envelope).await.unwrap());
        }
        outcomes
    }

    async fn open(&self) -> CorrelationId {
        let id = CorrelationId::new();
        self.send(GateMessage::Open(id)).await;
        id
    }
}

// ============================================================================
// Creation and correlation
// ============================================================================

#[tokio::test]
async fn initial_event_creates_instance() {
    let h = harness();
    let id = CorrelationId::new();

    let outcome = h.send(GateMessage::Open(id)).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Created {
            correlation_id: id,
            state: "Open".into()
        }
    );
    let gate = h.gate(id).await;
    assert_eq!(gate.data().opens, 1);
    assert_eq!(gate.version(), Version::first());
    assert_eq!(h.bus.published(), vec![GateMessage::Opened(id)]);
}

#[tokio::test]
async fn event_without_initial_rule_does_not_create() {
    let h = harness();
    let id = CorrelationId::new();

    assert_eq!(h.send(GateMessage::Touch(id)).await, DispatchOutcome::Missing);
    assert!(h.record(id).await.is_none());
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn undeclared_message_is_unhandled() {
    let h = harness();
    let outcome = h.send(GateMessage::Opened(CorrelationId::new())).await;
    assert_eq!(outcome, DispatchOutcome::Unhandled);
}

#[tokio::test]
async fn initial_event_redelivered_is_unhandled_once_created() {
    let h = harness();
    let id = h.open().await;

    assert_eq!(h.send(GateMessage::Open(id)).await, DispatchOutcome::Unhandled);
    assert_eq!(h.gate(id).await.data().opens, 1);
    assert_eq!(h.gate(id).await.version(), Version::first());
}

#[tokio::test]
async fn every_dispatch_leaves_a_declared_state() {
    let h = harness();
    let id = h.open().await;
    let definition = h.engine.definition();

    for message in [
        GateMessage::Touch(id),
        GateMessage::Ping(id),
        GateMessage::Inspect(id),
        GateMessage::Touch(id),
        GateMessage::Close(id),
    ] {
        h.send(message).await;
        let state = h.gate(id).await.state().to_string();
        assert!(definition.state(&state).is_some(), "undeclared state {state}");
    }
}

// ============================================================================
// Rules
// ============================================================================

#[tokio::test]
async fn ignored_redelivery_leaves_instance_unchanged() {
    let h = harness();
    let id = h.open().await;
    let before = h.record(id).await.unwrap();

    for _ in 0..3 {
        assert_eq!(
            h.send(GateMessage::Ping(id)).await,
            DispatchOutcome::Ignored { correlation_id: id }
        );
    }

    assert_eq!(h.record(id).await.unwrap(), before);
}

#[tokio::test]
async fn during_any_applies_in_declared_states() {
    let h = harness();
    let id = h.open().await;

    h.send(GateMessage::Touch(id)).await;
    h.send(GateMessage::Inspect(id)).await;
    let outcome = h.send(GateMessage::Touch(id)).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Updated {
            correlation_id: id,
            from: "Inspecting".into(),
            to: "Inspecting".into()
        }
    );
    assert_eq!(h.gate(id).await.data().touches, 2);
}

#[tokio::test]
async fn event_not_handled_in_state_is_dropped() {
    let h = harness();
    let id = h.open().await;
    h.send(GateMessage::Inspect(id)).await;
    let before = h.record(id).await.unwrap();

    assert_eq!(h.send(GateMessage::Arm(id, 10)).await, DispatchOutcome::Unhandled);
    assert_eq!(h.record(id).await.unwrap(), before);
}

#[tokio::test]
async fn false_guard_runs_else_branch() {
    let h = harness();
    let id = h.open().await;
    h.send(GateMessage::Arm(id, 5)).await;
    h.advance(5).await;

    let outcome = h.send(GateMessage::Close(id)).await;

    assert!(matches!(outcome, DispatchOutcome::Updated { .. }));
    let gate = h.gate(id).await;
    assert_eq!(gate.state(), "Open");
    assert_eq!(gate.data().note.as_deref(), Some("busy"));
}

// ============================================================================
// Finalization
// ============================================================================

#[tokio::test]
async fn finalized_instance_is_removed() {
    let h = harness();
    let id = h.open().await;

    assert_eq!(
        h.send(GateMessage::Close(id)).await,
        DispatchOutcome::Finalized { correlation_id: id }
    );
    assert!(h.record(id).await.is_none());
    assert_eq!(h.send(GateMessage::Touch(id)).await, DispatchOutcome::Missing);
}

#[tokio::test]
async fn archive_policy_keeps_final_instance() {
    let h = harness_with(
        InMemorySagaRepository::new(),
        EngineConfig::default().with_finalize_policy(FinalizePolicy::Archive),
    );
    let id = h.open().await;

    h.send(GateMessage::Close(id)).await;

    let record = h.record(id).await.unwrap();
    assert_eq!(record.state, FINAL);
    assert_eq!(h.send(GateMessage::Touch(id)).await, DispatchOutcome::Unhandled);
}

#[tokio::test]
async fn archived_instance_ignores_live_timer() {
    let h = harness_with(
        InMemorySagaRepository::new(),
        EngineConfig::default().with_finalize_policy(FinalizePolicy::Archive),
    );
    let id = h.open().await;
    h.send(GateMessage::Arm(id, 60)).await;
    h.send(GateMessage::Close(id)).await;
    let before = h.record(id).await.unwrap();

    let outcomes = h.advance(60).await;

    assert_eq!(outcomes, vec![DispatchOutcome::Stale { correlation_id: id }]);
    assert_eq!(h.record(id).await.unwrap(), before);
}

// ============================================================================
// Scheduled timeouts
// ============================================================================

#[tokio::test]
async fn scheduled_message_is_delivered_after_delay() {
    let h = harness();
    let id = h.open().await;
    h.send(GateMessage::Arm(id, 60)).await;

    assert!(h.gate(id).await.slot("Reminder").is_some());
    assert!(h.advance(59).await.is_empty());

    let outcomes = h.advance(1).await;
    assert_eq!(outcomes.len(), 1);
    let gate = h.gate(id).await;
    assert_eq!(gate.data().reminders, 1);
    assert!(gate.slot("Reminder").is_none());
}

#[tokio::test]
async fn unscheduled_timeout_is_stale() {
    let h = harness();
    let id = h.open().await;
    h.send(GateMessage::Arm(id, 60)).await;
    h.send(GateMessage::Disarm(id)).await;
    let before = h.record(id).await.unwrap();

    let outcomes = h.advance(60).await;

    assert_eq!(outcomes, vec![DispatchOutcome::Stale { correlation_id: id }]);
    assert_eq!(h.record(id).await.unwrap(), before);
}

#[tokio::test]
async fn rescheduling_replaces_token() {
    let h = harness();
    let id = h.open().await;
    h.send(GateMessage::Arm(id, 60)).await;
    h.send(GateMessage::Arm(id, 120)).await;

    assert_eq!(
        h.advance(60).await,
        vec![DispatchOutcome::Stale { correlation_id: id }]
    );
    assert_eq!(h.advance(60).await.len(), 1);
    assert_eq!(h.gate(id).await.data().reminders, 1);
    assert_eq!(h.timer.pending_count(), 0);
}

// ============================================================================
// Requests
// ============================================================================

fn reply(
    h: &Harness<InMemorySagaRepository>,
    outcome: Outcome<GateMessage>,
) -> Envelope<GateMessage> {
    let sent = h.bus.sent();
    let request = sent.last().expect("request sent");
    Envelope::Response(request.headers.reply(outcome).expect("request headers"))
}

#[tokio::test]
async fn request_is_sent_with_headers_and_deadline() {
    let h = harness();
    let id = h.open().await;

    h.send(GateMessage::Inspect(id)).await;

    let sent = h.bus.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination, "inspector");
    assert_eq!(sent[0].message, GateMessage::InspectGate(id));
    assert_eq!(sent[0].headers.request.as_deref(), Some("InspectGate"));

    let gate = h.gate(id).await;
    let pending = gate.pending_request("InspectGate").unwrap();
    assert_eq!(Some(pending.request_id), sent[0].headers.request_id);
    assert_eq!(pending.deadline - pending.requested_at, chrono::TimeDelta::seconds(30));
    assert!(gate.slot("request:InspectGate").is_some());
}

#[tokio::test]
async fn completed_request_excludes_later_outcomes() {
    let h = harness();
    let id = h.open().await;
    h.send(GateMessage::Inspect(id)).await;

    let completed = reply(&h, Outcome::Completed(GateMessage::Inspected(true)));
    let faulted = reply(&h, Outcome::Faulted(Fault::new("inspector down")));

    let outcome = h.engine.dispatch(completed.clone()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Updated { .. }));
    let gate = h.gate(id).await;
    assert_eq!(gate.state(), "Open");
    assert_eq!(gate.data().inspected, Some(true));
    assert!(gate.pending_request("InspectGate").is_none());

    assert_eq!(
        h.engine.dispatch(faulted).await.unwrap(),
        DispatchOutcome::Stale { correlation_id: id }
    );
    assert_eq!(
        h.engine.dispatch(completed).await.unwrap(),
        DispatchOutcome::Stale { correlation_id: id }
    );
    assert_eq!(
        h.advance(30).await,
        vec![DispatchOutcome::Stale { correlation_id: id }]
    );
    assert_eq!(h.gate(id).await.data().note, None);
}

#[tokio::test]
async fn faulted_request_routes_fault() {
    let h = harness();
    let id = h.open().await;
    h.send(GateMessage::Inspect(id)).await;

    let faulted = reply(&h, Outcome::Faulted(Fault::new("inspector down")));
    h.engine.dispatch(faulted).await.unwrap();

    let gate = h.gate(id).await;
    assert_eq!(gate.state(), "Open");
    assert_eq!(gate.data().note.as_deref(), Some("inspector down"));
}

#[tokio::test]
async fn request_deadline_expires_and_late_response_is_stale() {
    let h = harness();
    let id = h.open().await;
    h.send(GateMessage::Inspect(id)).await;
    let completed = reply(&h, Outcome::Completed(GateMessage::Inspected(true)));

    let outcomes = h.advance(30).await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], DispatchOutcome::Updated { .. }));

    let gate = h.gate(id).await;
    assert_eq!(gate.data().note.as_deref(), Some("timed out"));

    assert_eq!(
        h.engine.dispatch(completed).await.unwrap(),
        DispatchOutcome::Stale { correlation_id: id }
    );
    assert_eq!(h.gate(id).await.data().inspected, None);
}

// ============================================================================
// Read-only events and missing instances
// ============================================================================

#[tokio::test]
async fn read_only_event_responds_without_storing() {
    let h = harness();
    let id = h.open().await;
    let before = h.record(id).await.unwrap();
    let address = ResponseAddress::new("client");

    let envelope = Envelope::Message(
        Delivery::new(GateMessage::Query(id)).with_response_address(address.clone()),
    );
    let outcome = h.engine.dispatch(envelope).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Observed { correlation_id: id });
    assert_eq!(h.bus.responses_to(&address), vec![GateMessage::Report("Open".into())]);
    assert_eq!(h.record(id).await.unwrap(), before);
}

#[tokio::test]
async fn missing_instance_responds_not_found() {
    let h = harness();
    let address = ResponseAddress::new("client");

    let envelope = Envelope::Message(
        Delivery::new(GateMessage::Query(CorrelationId::new()))
            .with_response_address(address.clone()),
    );
    let outcome = h.engine.dispatch(envelope).await.unwrap();

    assert_eq!(outcome, DispatchOutcome::Missing);
    assert_eq!(h.bus.responses_to(&address), vec![GateMessage::NotFound]);
}

#[tokio::test]
async fn missing_instance_faults_when_configured() {
    let h = harness();
    let err = h
        .engine
        .dispatch(Envelope::message(GateMessage::Jam(CorrelationId::new())))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::MissingInstance { saga_type: "Gate", .. }));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn activity_error_persists_and_emits_nothing() {
    let h = harness();
    let id = h.open().await;
    h.bus.take_published();
    let before = h.record(id).await.unwrap();

    let err = h
        .engine
        .dispatch(Envelope::message(GateMessage::Jam(id)))
        .await
        .unwrap_err();

    match err {
        SagaError::Activity { event, source, .. } => {
            assert_eq!(event, "Jam");
            assert_eq!(source.to_string(), "gate is jammed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.bus.published().is_empty());
    assert_eq!(h.record(id).await.unwrap(), before);
}

#[tokio::test]
async fn transport_failure_after_persist_is_reported() {
    let h = harness();
    let id = h.open().await;
    h.bus.set_fail_on_publish(true);

    let err = h
        .engine
        .dispatch(Envelope::message(GateMessage::Touch(id)))
        .await
        .unwrap_err();

    assert!(matches!(err, SagaError::Transport(_)));
    assert_eq!(h.gate(id).await.data().touches, 1);
}

#[tokio::test]
async fn invalid_stored_state_is_rejected() {
    let h = harness();
    let id = h.open().await;
    let mut record = h.record(id).await.unwrap();
    record.state = "Demolished".into();
    h.repository.save(record, Version::first()).await.unwrap();

    let err = h
        .engine
        .dispatch(Envelope::message(GateMessage::Touch(id)))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::InvalidState { .. }));
}

// ============================================================================
// Concurrency
// ============================================================================

/// Repository that reports a concurrency conflict for the next N saves.
#[derive(Clone)]
struct ConflictingRepository {
    inner: InMemorySagaRepository,
    conflicts: Arc<AtomicU32>,
}

impl ConflictingRepository {
    fn new(conflicts: u32) -> Self {
        Self {
            inner: InMemorySagaRepository::new(),
            conflicts: Arc::new(AtomicU32::new(conflicts)),
        }
    }
}

#[async_trait]
impl SagaRepository for ConflictingRepository {
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
    ) -> saga_store::Result<Option<SagaRecord>> {
        self.inner.load(saga_type, correlation_id).await
    }

    async fn insert(&self, record: SagaRecord) -> saga_store::Result<Version> {
        self.inner.insert(record).await
    }

    async fn save(&self, record: SagaRecord, expected: Version) -> saga_store::Result<Version> {
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RepositoryError::ConcurrencyConflict {
                correlation_id: record.correlation_id,
                expected,
                actual: expected.next(),
            });
        }
        self.inner.save(record, expected).await
    }

    async fn delete(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
        expected: Version,
    ) -> saga_store::Result<()> {
        self.inner.delete(saga_type, correlation_id, expected).await
    }

    async fn list(&self, saga_type: &str) -> saga_store::Result<Vec<SagaRecord>> {
        self.inner.list(saga_type).await
    }
}

#[tokio::test]
async fn conflicts_are_retried_without_duplicate_effects() {
    let repository = ConflictingRepository::new(0);
    let h = harness_with(repository.clone(), EngineConfig::default());
    let id = h.open().await;
    h.bus.take_published();
    repository.conflicts.store(3, Ordering::SeqCst);

    let outcome = h.send(GateMessage::Touch(id)).await;

    assert!(matches!(outcome, DispatchOutcome::Updated { .. }));
    assert_eq!(h.gate(id).await.data().touches, 1);
    assert_eq!(h.bus.published(), vec![GateMessage::Touched(id)]);
}

#[tokio::test]
async fn exhausted_retries_are_fatal() {
    let repository = ConflictingRepository::new(0);
    let h = harness_with(
        repository.clone(),
        EngineConfig::default().with_max_concurrency_retries(2),
    );
    let id = h.open().await;
    h.bus.take_published();
    repository.conflicts.store(u32::MAX, Ordering::SeqCst);

    let err = h
        .engine
        .dispatch(Envelope::message(GateMessage::Touch(id)))
        .await
        .unwrap_err();

    assert!(matches!(err, SagaError::RetriesExhausted { attempts: 3, .. }));
    assert!(h.bus.published().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatches_to_one_instance_are_serialized() {
    let h = harness();
    let id = h.open().await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let engine = Arc::clone(&h.engine);
        handles.push(tokio::spawn(async move {
            engine
                .dispatch(Envelope::message(GateMessage::Touch(id)))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let gate = h.gate(id).await;
    assert_eq!(gate.data().touches, 20);
    assert_eq!(gate.version(), Version::new(21));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engines_sharing_a_repository_converge() {
    let repository = InMemorySagaRepository::new();
    let config = EngineConfig::default().with_max_concurrency_retries(10);
    let first = harness_with(repository.clone(), config.clone());
    let second = harness_with(repository.clone(), config);
    let id = first.open().await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = if i % 2 == 0 {
            Arc::clone(&first.engine)
        } else {
            Arc::clone(&second.engine)
        };
        handles.push(tokio::spawn(async move {
            engine
                .dispatch(Envelope::message(GateMessage::Touch(id)))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(first.gate(id).await.data().touches, 10);
}

// ============================================================================
// Inbox loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn run_loop_dispatches_inbox_and_timers() {
    let (inbox, receiver) = tokio::sync::mpsc::unbounded_channel();
    let bus = InMemoryBus::new();
    let timer: Arc<dyn TimerService<GateMessage>> = Arc::new(TokioTimer::new(inbox.clone()));
    let engine = Arc::new(SagaEngine::new(
        gate_definition(),
        InMemorySagaRepository::new(),
        Arc::new(bus.clone()),
        timer,
    ));

    let id = CorrelationId::new();
    engine
        .dispatch(Envelope::message(GateMessage::Open(id)))
        .await
        .unwrap();

    let runner = tokio::spawn(Arc::clone(&engine).run(receiver));
    inbox.send(Envelope::message(GateMessage::Arm(id, 5))).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    let gate = engine.get(id).await.unwrap().unwrap();
    assert_eq!(gate.data().reminders, 1);
    runner.abort();
}
