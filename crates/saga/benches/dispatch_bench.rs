use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use saga::prelude::*;
use saga::{
    Envelope, InMemoryBus, InMemorySagaRepository, ManualClock, ManualTimer, SagaEngine,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Counter {
    hits: u64,
}

#[derive(Debug, Clone)]
enum CounterMessage {
    Start(CorrelationId),
    Hit(CorrelationId),
    Ping(CorrelationId),
    Expire(CorrelationId),
}

impl SagaMessage for CounterMessage {
    fn message_type(&self) -> &'static str {
        match self {
            CounterMessage::Start(_) => "Start",
            CounterMessage::Hit(_) => "Hit",
            CounterMessage::Ping(_) => "Ping",
            CounterMessage::Expire(_) => "Expire",
        }
    }
}

fn counter_id(message: &CounterMessage) -> Option<CorrelationId> {
    match message {
        CounterMessage::Start(id)
        | CounterMessage::Hit(id)
        | CounterMessage::Ping(id)
        | CounterMessage::Expire(id) => Some(*id),
    }
}

type Engine = SagaEngine<Counter, CounterMessage, InMemorySagaRepository>;

fn engine() -> Engine {
    let definition = SagaDefinition::<Counter, CounterMessage>::builder("Counter")
        .states(&["Counting"])
        .event("Start", |e| e.by_id(counter_id))
        .event("Hit", |e| e.by_id(counter_id))
        .event("Ping", |e| e.by_id(counter_id))
        .initially("Start", |t| t.transition_to("Counting"))
        .during(&["Counting"], "Hit", |t| {
            t.then(|ctx| ctx.data_mut().hits += 1).schedule_after(
                "Expiry",
                Duration::from_secs(60),
                |ctx| CounterMessage::Expire(ctx.correlation_id()),
            )
        })
        .ignore(&["Counting"], "Ping")
        .build()
        .unwrap();

    let clock = ManualClock::default();
    SagaEngine::new(
        definition,
        InMemorySagaRepository::new(),
        Arc::new(InMemoryBus::new()),
        Arc::new(ManualTimer::new(clock.clone())),
    )
    .with_clock(Arc::new(clock))
}

fn bench_create_instance(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = engine();

    c.bench_function("saga/create_instance", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine
                    .dispatch(Envelope::message(CounterMessage::Start(CorrelationId::new())))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_update_instance(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = engine();
    let id = CorrelationId::new();
    rt.block_on(async {
        engine
            .dispatch(Envelope::message(CounterMessage::Start(id)))
            .await
            .unwrap();
    });

    c.bench_function("saga/update_with_schedule", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine
                    .dispatch(Envelope::message(CounterMessage::Hit(id)))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_ignored_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let engine = engine();
    let id = CorrelationId::new();
    rt.block_on(async {
        engine
            .dispatch(Envelope::message(CounterMessage::Start(id)))
            .await
            .unwrap();
    });

    c.bench_function("saga/ignored_event", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine
                    .dispatch(Envelope::message(CounterMessage::Ping(id)))
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_create_instance,
    bench_update_instance,
    bench_ignored_event
);
criterion_main!(benches);
