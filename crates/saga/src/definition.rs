//! Declarative saga definitions.
//!
//! A [`SagaDefinition`] is the transition table of one workflow: its
//! states, the events it consumes and how they correlate, and which
//! activities run for each (state, event) pair.
//!
//! ```ignore
//! let book = SagaDefinition::<Book, LibraryMessage>::builder("Book")
//!     .states(&["Available", "Reserved"])
//!     .event("BookAdded", |e| e.by_id(LibraryMessage::book_id))
//!     .initially("BookAdded", |t| t.then(copy_title).transition_to("Available"))
//!     .ignore(&["Reserved"], "ReservationRequested")
//!     .build()?;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::CorrelationId;
use futures_util::future::BoxFuture;

use crate::composite::CompositeSpec;
use crate::context::BehaviorContext;
use crate::error::{ActivityError, DefinitionError};
use crate::event::{EventKey, SagaMessage};
use crate::instance::SagaData;
use crate::request::RequestSpec;
use crate::state::{FINAL, INITIAL, Scope};

pub type Action<D, M> =
    Arc<dyn Fn(&mut BehaviorContext<'_, D, M>) -> Result<(), ActivityError> + Send + Sync>;
pub type Factory<D, M> = Arc<dyn Fn(&BehaviorContext<'_, D, M>) -> M + Send + Sync>;
pub type Condition<D, M> = Arc<dyn Fn(&BehaviorContext<'_, D, M>) -> bool + Send + Sync>;
pub type DelayFn<D, M> = Arc<dyn Fn(&BehaviorContext<'_, D, M>) -> Duration + Send + Sync>;

type IdFn<M> = Arc<dyn Fn(&M) -> Option<CorrelationId> + Send + Sync>;
type MatchFn<D, M> = Arc<dyn Fn(&D, &M) -> bool + Send + Sync>;
type ReplyFn<M> = Arc<dyn Fn(&M) -> M + Send + Sync>;
type KeyFn<D> = Arc<dyn Fn(&D) -> Option<String> + Send + Sync>;

fn action<D, M, F>(f: F) -> Action<D, M>
where
    F: Fn(&mut BehaviorContext<'_, D, M>) -> Result<(), ActivityError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An activity with its own async work, e.g. a call to a collaborator.
#[async_trait]
pub trait CustomActivity<D, M>: Send + Sync
where
    D: SagaData,
    M: SagaMessage,
{
    async fn execute(&self, ctx: &mut BehaviorContext<'_, D, M>) -> Result<(), ActivityError>;
}

/// One step of a behavior.
pub enum Activity<D, M> {
    /// Runs a synchronous closure, typically copying message fields.
    Then(Action<D, M>),
    Publish(Factory<D, M>),
    Send {
        destination: String,
        factory: Factory<D, M>,
    },
    Respond(Factory<D, M>),
    Schedule {
        slot: &'static str,
        delay: DelayFn<D, M>,
        factory: Factory<D, M>,
    },
    Unschedule {
        slot: &'static str,
    },
    Request {
        request: &'static str,
        factory: Factory<D, M>,
    },
    If {
        condition: Condition<D, M>,
        then: Vec<Activity<D, M>>,
        otherwise: Vec<Activity<D, M>>,
    },
    TransitionTo(&'static str),
    Finalize,
    Execute(Arc<dyn CustomActivity<D, M>>),
}

/// Runs activities in order; each sees the effects of the previous ones.
pub(crate) fn run_activities<'a, 'c, D, M>(
    activities: &'a [Activity<D, M>],
    ctx: &'a mut BehaviorContext<'c, D, M>,
) -> BoxFuture<'a, Result<(), ActivityError>>
where
    D: SagaData,
    M: SagaMessage,
    'c: 'a,
{
    Box::pin(async move {
        for activity in activities {
            match activity {
                Activity::Then(f) => f(&mut *ctx)?,
                Activity::Publish(factory) => {
                    let message = factory(&*ctx);
                    ctx.publish(message);
                }
                Activity::Send {
                    destination,
                    factory,
                } => {
                    let message = factory(&*ctx);
                    ctx.send(destination.clone(), message);
                }
                Activity::Respond(factory) => {
                    let message = factory(&*ctx);
                    ctx.respond(message);
                }
                Activity::Schedule {
                    slot,
                    delay,
                    factory,
                } => {
                    let delay = delay(&*ctx);
                    let message = factory(&*ctx);
                    ctx.schedule(slot, delay, message);
                }
                Activity::Unschedule { slot } => {
                    ctx.unschedule(slot);
                }
                Activity::Request { request, factory } => {
                    let message = factory(&*ctx);
                    ctx.request(request, message)?;
                }
                Activity::If {
                    condition,
                    then,
                    otherwise,
                } => {
                    let branch = if condition(&*ctx) { then } else { otherwise };
                    run_activities(branch, &mut *ctx).await?;
                }
                Activity::TransitionTo(state) => ctx.transition_to(*state),
                Activity::Finalize => ctx.finalize(),
                Activity::Execute(custom) => custom.execute(&mut *ctx).await?,
            }
        }
        Ok(())
    })
}

/// Fluent construction of activity lists.
pub trait Activities<D: SagaData, M: SagaMessage>: Sized {
    fn push(self, activity: Activity<D, M>) -> Self;

    fn then<F>(self, f: F) -> Self
    where
        F: Fn(&mut BehaviorContext<'_, D, M>) + Send + Sync + 'static,
    {
        self.push(Activity::Then(action(
            move |ctx: &mut BehaviorContext<'_, D, M>| {
                f(ctx);
                Ok(())
            },
        )))
    }

    /// Like [`then`](Activities::then), but the closure may fail the dispatch.
    fn try_then<F>(self, f: F) -> Self
    where
        F: Fn(&mut BehaviorContext<'_, D, M>) -> Result<(), ActivityError> + Send + Sync + 'static,
    {
        self.push(Activity::Then(action(f)))
    }

    fn publish<F>(self, factory: F) -> Self
    where
        F: Fn(&BehaviorContext<'_, D, M>) -> M + Send + Sync + 'static,
    {
        self.push(Activity::Publish(Arc::new(factory)))
    }

    fn send<F>(self, destination: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&BehaviorContext<'_, D, M>) -> M + Send + Sync + 'static,
    {
        self.push(Activity::Send {
            destination: destination.into(),
            factory: Arc::new(factory),
        })
    }

    fn respond<F>(self, factory: F) -> Self
    where
        F: Fn(&BehaviorContext<'_, D, M>) -> M + Send + Sync + 'static,
    {
        self.push(Activity::Respond(Arc::new(factory)))
    }

    /// Schedules a message with a delay computed from the context.
    fn schedule<G, F>(self, slot: &'static str, delay: G, factory: F) -> Self
    where
        G: Fn(&BehaviorContext<'_, D, M>) -> Duration + Send + Sync + 'static,
        F: Fn(&BehaviorContext<'_, D, M>) -> M + Send + Sync + 'static,
    {
        self.push(Activity::Schedule {
            slot,
            delay: Arc::new(delay),
            factory: Arc::new(factory),
        })
    }

    /// Schedules a message with a fixed delay.
    fn schedule_after<F>(self, slot: &'static str, delay: Duration, factory: F) -> Self
    where
        F: Fn(&BehaviorContext<'_, D, M>) -> M + Send + Sync + 'static,
    {
        self.schedule(slot, move |_: &BehaviorContext<'_, D, M>| delay, factory)
    }

    fn unschedule(self, slot: &'static str) -> Self {
        self.push(Activity::Unschedule { slot })
    }

    fn request<F>(self, request: &'static str, factory: F) -> Self
    where
        F: Fn(&BehaviorContext<'_, D, M>) -> M + Send + Sync + 'static,
    {
        self.push(Activity::Request {
            request,
            factory: Arc::new(factory),
        })
    }

    fn if_else<C, T, E>(self, condition: C, then: T, otherwise: E) -> Self
    where
        C: Fn(&BehaviorContext<'_, D, M>) -> bool + Send + Sync + 'static,
        T: FnOnce(Behavior<D, M>) -> Behavior<D, M>,
        E: FnOnce(Behavior<D, M>) -> Behavior<D, M>,
    {
        self.push(Activity::If {
            condition: Arc::new(condition),
            then: then(Behavior::new()).activities,
            otherwise: otherwise(Behavior::new()).activities,
        })
    }

    fn if_then<C, T>(self, condition: C, then: T) -> Self
    where
        C: Fn(&BehaviorContext<'_, D, M>) -> bool + Send + Sync + 'static,
        T: FnOnce(Behavior<D, M>) -> Behavior<D, M>,
    {
        self.if_else(condition, then, |b| b)
    }

    fn transition_to(self, state: &'static str) -> Self {
        self.push(Activity::TransitionTo(state))
    }

    fn finalize(self) -> Self {
        self.push(Activity::Finalize)
    }

    fn execute<A>(self, activity: A) -> Self
    where
        A: CustomActivity<D, M> + 'static,
    {
        self.push(Activity::Execute(Arc::new(activity)))
    }
}

/// A bare activity list, used for branches.
pub struct Behavior<D, M> {
    activities: Vec<Activity<D, M>>,
}

impl<D, M> Behavior<D, M> {
    fn new() -> Self {
        Self {
            activities: Vec::new(),
        }
    }
}

impl<D: SagaData, M: SagaMessage> Activities<D, M> for Behavior<D, M> {
    fn push(mut self, activity: Activity<D, M>) -> Self {
        self.activities.push(activity);
        self
    }
}

/// Activities bound to one event key, with an optional guard.
pub struct Transition<D, M> {
    key: EventKey,
    guard: Option<Condition<D, M>>,
    activities: Vec<Activity<D, M>>,
    otherwise: Vec<Activity<D, M>>,
}

impl<D: SagaData, M: SagaMessage> Transition<D, M> {
    fn new(key: EventKey) -> Self {
        Self {
            key,
            guard: None,
            activities: Vec::new(),
            otherwise: Vec::new(),
        }
    }

    pub fn key(&self) -> EventKey {
        self.key
    }

    /// Runs the activities only if `condition` holds.
    pub fn guard<C>(mut self, condition: C) -> Self
    where
        C: Fn(&BehaviorContext<'_, D, M>) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(condition));
        self
    }

    /// Activities to run when the guard is false.
    pub fn otherwise<E>(mut self, otherwise: E) -> Self
    where
        E: FnOnce(Behavior<D, M>) -> Behavior<D, M>,
    {
        self.otherwise = otherwise(Behavior::new()).activities;
        self
    }

    pub(crate) async fn execute(
        &self,
        ctx: &mut BehaviorContext<'_, D, M>,
    ) -> Result<(), ActivityError> {
        let passes = self.guard.as_ref().is_none_or(|guard| guard(&*ctx));
        let branch = if passes {
            &self.activities
        } else {
            &self.otherwise
        };
        run_activities(branch, ctx).await
    }
}

impl<D: SagaData, M: SagaMessage> Activities<D, M> for Transition<D, M> {
    fn push(mut self, activity: Activity<D, M>) -> Self {
        self.activities.push(activity);
        self
    }
}

/// An entry of the transition table.
pub(crate) enum Rule<D, M> {
    Transition(Transition<D, M>),
    /// The event is a deliberate no-op in this scope.
    Ignore,
}

/// How an event finds its instance.
pub(crate) enum Correlation<D, M> {
    Unset,
    ById(IdFn<M>),
    ByPredicate {
        matches: MatchFn<D, M>,
        new_id: NewId,
    },
}

/// Id given to an instance created by a predicate-correlated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewId {
    /// The inbound message id, so redelivery maps to the same instance.
    MessageId,
    /// A fresh random id.
    Fresh,
}

/// What to do when an event matches no instance and may not create one.
pub enum MissingInstance<M> {
    /// Drop the event.
    Ignore,
    /// Fail the dispatch with [`SagaError::MissingInstance`](crate::SagaError::MissingInstance).
    Fault,
    /// Respond to the requester with the message built from the event.
    Respond(ReplyFn<M>),
}

/// Declaration of an event the workflow consumes.
pub struct EventConfig<D, M> {
    name: &'static str,
    pub(crate) correlation: Correlation<D, M>,
    insert_on_initial: bool,
    read_only: bool,
    pub(crate) missing: MissingInstance<M>,
}

impl<D, M> EventConfig<D, M> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            correlation: Correlation::Unset,
            insert_on_initial: true,
            read_only: false,
            missing: MissingInstance::Ignore,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Correlates by an id carried in the message.
    ///
    /// A message for which `id` returns None cannot be routed.
    pub fn by_id<F>(mut self, id: F) -> Self
    where
        F: Fn(&M) -> Option<CorrelationId> + Send + Sync + 'static,
    {
        self.correlation = Correlation::ById(Arc::new(id));
        self
    }

    /// Correlates by evaluating `matches` against each stored instance.
    pub fn by_predicate<F>(mut self, matches: F) -> Self
    where
        F: Fn(&D, &M) -> bool + Send + Sync + 'static,
    {
        self.correlation = Correlation::ByPredicate {
            matches: Arc::new(matches),
            new_id: NewId::MessageId,
        };
        self
    }

    /// Chooses the id of instances this predicate-correlated event creates.
    pub fn new_id(mut self, new_id: NewId) -> Self {
        if let Correlation::ByPredicate { new_id: slot, .. } = &mut self.correlation {
            *slot = new_id;
        }
        self
    }

    /// Never creates instances, even if an `Initially` rule exists.
    pub fn existing_only(mut self) -> Self {
        self.insert_on_initial = false;
        self
    }

    /// Never creates instances and never stores changes.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self.insert_on_initial = false;
        self
    }

    pub fn fault_when_missing(mut self) -> Self {
        self.missing = MissingInstance::Fault;
        self
    }

    pub fn respond_when_missing<F>(mut self, reply: F) -> Self
    where
        F: Fn(&M) -> M + Send + Sync + 'static,
    {
        self.missing = MissingInstance::Respond(Arc::new(reply));
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn inserts_on_initial(&self) -> bool {
        self.insert_on_initial
    }
}

/// A validated transition table.
pub struct SagaDefinition<D, M> {
    name: &'static str,
    states: HashSet<&'static str>,
    final_states: HashSet<&'static str>,
    events: HashMap<&'static str, EventConfig<D, M>>,
    rules: HashMap<(Scope, EventKey), Vec<Rule<D, M>>>,
    composites: Vec<CompositeSpec>,
    requests: HashMap<&'static str, RequestSpec>,
    unique_key: Option<KeyFn<D>>,
}

impl<D: SagaData, M: SagaMessage> SagaDefinition<D, M> {
    pub fn builder(name: &'static str) -> SagaDefinitionBuilder<D, M> {
        SagaDefinitionBuilder::new(name)
    }

    /// The saga type, used as the repository partition.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the declared name for `state`, if it belongs to this definition.
    pub fn state(&self, state: &str) -> Option<&'static str> {
        self.states.get(state).copied()
    }

    /// Returns true for `Final` and for states declared final.
    pub fn is_final(&self, state: &str) -> bool {
        state == FINAL || self.final_states.contains(state)
    }

    pub fn event(&self, message_type: &str) -> Option<&EventConfig<D, M>> {
        self.events.get(message_type)
    }

    pub fn request(&self, request: &str) -> Option<&RequestSpec> {
        self.requests.get(request)
    }

    pub fn composites(&self) -> &[CompositeSpec] {
        &self.composites
    }

    /// Returns true if an `Initially` rule handles `key`.
    pub fn creates_on(&self, key: EventKey) -> bool {
        self.rules.contains_key(&(Scope::During(INITIAL), key))
    }

    pub(crate) fn unique_key(&self, data: &D) -> Option<String> {
        self.unique_key.as_ref().and_then(|key| key(data))
    }

    /// Rules for `key` that apply in `state`, most specific scope first.
    pub(crate) fn rules(&self, state: &'static str, key: EventKey) -> Vec<&Rule<D, M>> {
        Scope::applicable(state)
            .into_iter()
            .filter_map(|scope| self.rules.get(&(scope, key)))
            .flatten()
            .collect()
    }
}

/// Builder for [`SagaDefinition`]; validation happens in [`build`](Self::build).
pub struct SagaDefinitionBuilder<D, M> {
    name: &'static str,
    states: Vec<&'static str>,
    final_states: Vec<&'static str>,
    events: Vec<EventConfig<D, M>>,
    rules: Vec<(Scope, EventKey, Rule<D, M>)>,
    composites: Vec<CompositeSpec>,
    requests: Vec<RequestSpec>,
    unique_key: Option<KeyFn<D>>,
}

impl<D: SagaData, M: SagaMessage> SagaDefinitionBuilder<D, M> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            states: Vec::new(),
            final_states: Vec::new(),
            events: Vec::new(),
            rules: Vec::new(),
            composites: Vec::new(),
            requests: Vec::new(),
            unique_key: None,
        }
    }

    /// Declares states besides `Initial` and `Final`.
    pub fn states(mut self, states: &[&'static str]) -> Self {
        self.states.extend_from_slice(states);
        self
    }

    /// Marks declared states as final: reaching one finalizes the instance.
    pub fn final_states(mut self, states: &[&'static str]) -> Self {
        self.final_states.extend_from_slice(states);
        self
    }

    /// Declares a consumed event.
    pub fn event<F>(mut self, message_type: &'static str, configure: F) -> Self
    where
        F: FnOnce(EventConfig<D, M>) -> EventConfig<D, M>,
    {
        self.events.push(configure(EventConfig::new(message_type)));
        self
    }

    /// Rule for instances that are being created by this event.
    pub fn initially<F>(self, key: impl Into<EventKey>, configure: F) -> Self
    where
        F: FnOnce(Transition<D, M>) -> Transition<D, M>,
    {
        self.rule(Scope::During(INITIAL), key.into(), configure)
    }

    /// Rule for instances in any of `states`.
    pub fn during<F>(
        mut self,
        states: &[&'static str],
        key: impl Into<EventKey>,
        configure: F,
    ) -> Self
    where
        F: FnOnce(Transition<D, M>) -> Transition<D, M> + Clone,
    {
        let key = key.into();
        for &state in states {
            self = self.rule(Scope::During(state), key, configure.clone());
        }
        self
    }

    /// Rule for instances in every state except `Initial` and `Final`.
    pub fn during_any<F>(self, key: impl Into<EventKey>, configure: F) -> Self
    where
        F: FnOnce(Transition<D, M>) -> Transition<D, M>,
    {
        self.rule(Scope::Any, key.into(), configure)
    }

    /// Declares `key` a deliberate no-op in `states`.
    pub fn ignore(mut self, states: &[&'static str], key: impl Into<EventKey>) -> Self {
        let key = key.into();
        for &state in states {
            self.rules.push((Scope::During(state), key, Rule::Ignore));
        }
        self
    }

    pub fn composite(mut self, composite: CompositeSpec) -> Self {
        self.composites.push(composite);
        self
    }

    pub fn request(mut self, request: RequestSpec) -> Self {
        self.requests.push(request);
        self
    }

    /// Natural key stored with each instance and enforced unique by the
    /// repository.
    pub fn unique_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&D) -> Option<String> + Send + Sync + 'static,
    {
        self.unique_key = Some(Arc::new(key));
        self
    }

    fn rule<F>(mut self, scope: Scope, key: EventKey, configure: F) -> Self
    where
        F: FnOnce(Transition<D, M>) -> Transition<D, M>,
    {
        let transition = configure(Transition::new(key));
        self.rules.push((scope, key, Rule::Transition(transition)));
        self
    }

    /// Validates the declarations and produces the definition.
    pub fn build(self) -> Result<SagaDefinition<D, M>, DefinitionError> {
        let mut states: HashSet<&'static str> = HashSet::from([INITIAL, FINAL]);
        for &state in &self.states {
            if !states.insert(state) {
                return Err(DefinitionError::DuplicateState(state));
            }
        }

        let unknown = |state: &'static str, context: String| DefinitionError::UnknownState {
            state,
            context,
        };

        for &state in &self.final_states {
            if !states.contains(state) {
                return Err(unknown(state, "final_states".to_string()));
            }
        }

        let mut events = HashMap::new();
        for event in self.events {
            if matches!(event.correlation, Correlation::Unset) {
                return Err(DefinitionError::Uncorrelated(event.name));
            }
            if events.contains_key(event.name) {
                return Err(DefinitionError::DuplicateEvent(event.name));
            }
            events.insert(event.name, event);
        }

        let mut requests = HashMap::new();
        for request in self.requests {
            if requests.contains_key(request.name()) {
                return Err(DefinitionError::DuplicateRequest(request.name()));
            }
            requests.insert(request.name(), request);
        }

        let mut composites = HashSet::new();
        for composite in &self.composites {
            if !composites.insert(composite.name()) {
                return Err(DefinitionError::DuplicateComposite(composite.name()));
            }
            composite.validate()?;
        }

        let mut rules: HashMap<(Scope, EventKey), Vec<Rule<D, M>>> = HashMap::new();
        for (scope, key, rule) in self.rules {
            if let Scope::During(state) = scope
                && !states.contains(state)
            {
                return Err(unknown(state, format!("During({state}) for {key}")));
            }
            if let Rule::Transition(transition) = &rule {
                let activities = transition.activities.iter().chain(&transition.otherwise);
                validate_activities(activities, &states, &requests, key)?;
            }
            rules.entry((scope, key)).or_default().push(rule);
        }

        Ok(SagaDefinition {
            name: self.name,
            states,
            final_states: self.final_states.into_iter().collect(),
            events,
            rules,
            composites: self.composites,
            requests,
            unique_key: self.unique_key,
        })
    }
}

fn validate_activities<'a, D: 'a, M: 'a>(
    activities: impl IntoIterator<Item = &'a Activity<D, M>>,
    states: &HashSet<&'static str>,
    requests: &HashMap<&'static str, RequestSpec>,
    key: EventKey,
) -> Result<(), DefinitionError> {
    for activity in activities {
        match activity {
            Activity::TransitionTo(state) if !states.contains(state) => {
                return Err(DefinitionError::UnknownState {
                    state: *state,
                    context: format!("TransitionTo in {key}"),
                });
            }
            Activity::Request { request, .. } if !requests.contains_key(request) => {
                return Err(DefinitionError::UndeclaredRequest(*request));
            }
            Activity::If {
                then, otherwise, ..
            } => validate_activities(then.iter().chain(otherwise), states, requests, key)?,
            _ => {}
        }
    }
    Ok(())
}
