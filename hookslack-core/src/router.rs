// ABOUTME: Event router: primary FIFO plus a throttled slow queue, drained on a host timer tick.
// ABOUTME: Dispatches envelopes to string-keyed handlers with team context, and issues queued API requests.

use crate::config::RouterConfig;
use crate::envelope::Envelope;
use crate::error::SlackError;
use crate::metrics;
use crate::recorder::Recorder;
use crate::request::{OutboundRequest, Params};
use crate::team::Team;
use chrono::{DateTime, Duration, Utc};
use hookslack_task::{find_error, HookEvent, HookHandle, Runtime};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

/// Handler invoked for every envelope whose handler name matches.
pub type Handler = Rc<dyn Fn(&Envelope, &EventRouter, &EventContext) -> anyhow::Result<()>>;

/// Something waiting in a router queue.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Event(Envelope),
    Request(OutboundRequest),
}

/// A payload reference to a team entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRef {
    /// The team already knows this entity
    Resolved(Value),
    /// Bare identifier, passed through as-is
    Unresolved(String),
}

impl EntityRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            EntityRef::Resolved(value) => value.get("id").and_then(Value::as_str),
            EntityRef::Unresolved(id) => Some(id),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, EntityRef::Resolved(_))
    }
}

/// Context attached to an envelope right before dispatch.
#[derive(Debug, Default)]
pub struct EventContext {
    pub team: Option<Rc<RefCell<Team>>>,
    /// `user` / `channel` references found in the payload
    pub refs: HashMap<String, EntityRef>,
    /// Originally sent message, for streamed replies
    pub reply: Option<Value>,
}

impl EventContext {
    pub fn user(&self) -> Option<&EntityRef> {
        self.refs.get("user")
    }

    pub fn channel(&self) -> Option<&EntityRef> {
        self.refs.get("channel")
    }
}

/// What a single `handle_next` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Both queues were empty (or the slow queue was not due)
    Idle,
    Dispatched(String),
    /// No handler registered; logged, never raised
    Unknown(String),
    Ignored(String),
    HandlerFailed(String),
    /// Request handed to the HTTP pipeline, with the attempt's response id
    RequestIssued(String),
    /// Request not ready yet, moved to the slow queue
    RequestDeferred(String),
    RequestDropped(String),
}

struct TickHook {
    interval_ms: u64,
    handle: HookHandle,
}

struct RouterState {
    runtime: Runtime,
    config: RouterConfig,
    queue: RefCell<VecDeque<QueueItem>>,
    slow_queue: RefCell<VecDeque<QueueItem>>,
    slow_moved_at: Cell<Option<DateTime<Utc>>>,
    handlers: RefCell<HashMap<String, Handler>>,
    teams: RefCell<HashMap<String, Rc<RefCell<Team>>>>,
    recorder: RefCell<Option<Recorder>>,
    shutting_down: Cell<bool>,
    started: Cell<bool>,
    tick: RefCell<Option<TickHook>>,
    tick_token: String,
}

/// Central hub for streamed events, request replies, and queued requests.
#[derive(Clone)]
pub struct EventRouter {
    state: Rc<RouterState>,
}

impl EventRouter {
    pub fn new(runtime: Runtime, config: RouterConfig) -> Self {
        Self {
            state: Rc::new(RouterState {
                runtime,
                config,
                queue: RefCell::new(VecDeque::new()),
                slow_queue: RefCell::new(VecDeque::new()),
                slow_moved_at: Cell::new(None),
                handlers: RefCell::new(HashMap::new()),
                teams: RefCell::new(HashMap::new()),
                recorder: RefCell::new(None),
                shutting_down: Cell::new(false),
                started: Cell::new(false),
                tick: RefCell::new(None),
                tick_token: format!("router-tick:{}", uuid::Uuid::new_v4()),
            }),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.state.runtime
    }

    pub fn config(&self) -> &RouterConfig {
        &self.state.config
    }

    pub fn register_handler(
        &self,
        name: &str,
        handler: impl Fn(&Envelope, &EventRouter, &EventContext) -> anyhow::Result<()> + 'static,
    ) {
        self.state
            .handlers
            .borrow_mut()
            .insert(name.to_string(), Rc::new(handler));
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.state.handlers.borrow().contains_key(name)
    }

    pub fn register_team(&self, team: Team) -> Rc<RefCell<Team>> {
        let id = team.id.clone();
        let team = Rc::new(RefCell::new(team));
        self.state
            .teams
            .borrow_mut()
            .insert(id.clone(), Rc::clone(&team));
        tracing::debug!(team = %id, "Registered team");
        team
    }

    pub fn team(&self, id: &str) -> Option<Rc<RefCell<Team>>> {
        self.state.teams.borrow().get(id).cloned()
    }

    pub fn disconnected_teams(&self) -> Vec<String> {
        self.state
            .teams
            .borrow()
            .values()
            .filter(|team| !team.borrow().is_connected())
            .map(|team| team.borrow().id.clone())
            .collect()
    }

    pub fn set_recorder(&self, recorder: Option<Recorder>) {
        *self.state.recorder.borrow_mut() = recorder;
    }

    pub fn is_recording(&self) -> bool {
        self.state.recorder.borrow().is_some()
    }

    /// Queue an envelope for dispatch.
    pub fn receive(&self, envelope: Envelope) {
        if let Some(recorder) = self.state.recorder.borrow().as_ref() {
            if let Err(e) = recorder.record(&envelope) {
                tracing::warn!(error = %e, "Failed to record event");
            }
        }
        tracing::trace!(handler = %envelope.handler_name(), "Queued event");
        self.state
            .queue
            .borrow_mut()
            .push_back(QueueItem::Event(envelope));
        self.reschedule();
    }

    /// Queue an API request to be issued by the router.
    pub fn receive_request(&self, request: OutboundRequest) {
        if self.state.shutting_down.get() {
            tracing::debug!(method = %request.method, "Shutting down, not queueing request");
            metrics::request_dropped("shutdown");
            return;
        }
        self.state
            .queue
            .borrow_mut()
            .push_back(QueueItem::Request(request));
        self.reschedule();
    }

    /// Queue work on the throttled slow queue.
    pub fn receive_slow(&self, item: QueueItem) {
        self.state.slow_queue.borrow_mut().push_back(item);
        self.reschedule();
    }

    /// Build and queue an API request with the router's retry budget.
    pub fn enqueue_request(&self, team: &str, method: &str, params: Params) {
        let mut request = OutboundRequest::new(team, method, params, self.state.runtime.now())
            .with_retries(self.state.config.request_retries);
        if let Some(known) = self.team(team) {
            if let Some(api) = known.borrow().api() {
                request = request.with_api_base(api.api_base());
            }
        }
        self.receive_request(request);
    }

    pub fn queue_len(&self) -> usize {
        self.state.queue.borrow().len()
    }

    pub fn slow_queue_len(&self) -> usize {
        self.state.slow_queue.borrow().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.shutting_down.get()
    }

    /// Process one queue item.
    pub fn handle_next(&self) -> DispatchOutcome {
        let now = self.state.runtime.now();
        self.promote_slow(now);

        let item = self.state.queue.borrow_mut().pop_front();
        match item {
            None => DispatchOutcome::Idle,
            Some(QueueItem::Request(request)) => self.process_request(request, now),
            Some(QueueItem::Event(envelope)) => self.dispatch(&envelope),
        }
    }

    /// Move one item from the slow queue when its interval has passed.
    fn promote_slow(&self, now: DateTime<Utc>) {
        if self.state.slow_queue.borrow().is_empty() {
            return;
        }
        let interval = Duration::milliseconds(self.state.config.slow_queue_interval_ms as i64);
        let due = match self.state.slow_moved_at.get() {
            Some(at) => at + interval < now,
            None => true,
        };
        if !due {
            return;
        }
        let item = self.state.slow_queue.borrow_mut().pop_front();
        if let Some(item) = item {
            tracing::debug!("Moving one item from the slow queue");
            self.state.queue.borrow_mut().push_back(item);
            self.state.slow_moved_at.set(Some(now));
        }
    }

    fn process_request(&self, request: OutboundRequest, now: DateTime<Utc>) -> DispatchOutcome {
        if self.state.shutting_down.get() {
            metrics::request_dropped("shutdown");
            return DispatchOutcome::RequestDropped(request.method);
        }
        if !request.should_try() {
            tracing::warn!(
                method = %request.method,
                team = %request.team,
                tries = request.tries,
                "Max retries for request, giving up"
            );
            metrics::request_dropped("retries");
            return DispatchOutcome::RequestDropped(request.method);
        }
        if !request.retry_ready(now) {
            let method = request.method.clone();
            self.receive_slow(QueueItem::Request(request));
            return DispatchOutcome::RequestDeferred(method);
        }
        self.issue(request, now)
    }

    fn issue(&self, mut request: OutboundRequest, now: DateTime<Utc>) -> DispatchOutcome {
        let api = self
            .team(&request.team)
            .and_then(|team| team.borrow().api());
        let Some(api) = api else {
            tracing::warn!(
                team = %request.team,
                method = %request.method,
                "{}",
                SlackError::NoApi(request.team.clone())
            );
            metrics::request_dropped("no_api");
            return DispatchOutcome::RequestDropped(request.method);
        };

        request.tried(now);
        let response_id = request.response_id.clone();
        let router = self.clone();
        let rt = self.state.runtime.clone();
        let name = format!("request:{}", request.method);
        self.state.runtime.spawn(&name, async move {
            match api.call_request(&rt, &request).await {
                Ok(payload) => {
                    let envelope = Envelope::from_http(&request, payload, rt.now());
                    router.receive(envelope);
                    Ok(())
                }
                Err(error)
                    if find_error::<SlackError>(&error).is_some_and(SlackError::is_transport) =>
                {
                    tracing::info!(
                        method = %request.method,
                        tries = request.tries,
                        error = %error,
                        "Request failed, queueing retry"
                    );
                    router.receive_slow(QueueItem::Request(request));
                    Ok(())
                }
                Err(error) => Err(error),
            }
        });
        DispatchOutcome::RequestIssued(response_id)
    }

    fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        let name = envelope.handler_name().to_string();
        if self.state.config.ignored_events.iter().any(|e| *e == name) {
            tracing::trace!(handler = %name, "Ignoring event");
            return DispatchOutcome::Ignored(name);
        }

        let context = self.context_for(envelope);
        if envelope.reply_to().is_some() {
            self.resolve_reply(envelope, &context);
        }

        let handler = self.state.handlers.borrow().get(&name).cloned();
        let Some(handler) = handler else {
            tracing::warn!(
                handler = %name,
                team = ?envelope.team,
                "No handler for event, skipping"
            );
            metrics::event_unknown(&name);
            return DispatchOutcome::Unknown(name);
        };

        match handler(envelope, self, &context) {
            Ok(()) => {
                tracing::trace!(handler = %name, "Dispatched event");
                metrics::event_dispatched(&name);
                DispatchOutcome::Dispatched(name)
            }
            Err(error) => {
                tracing::error!(
                    handler = %name,
                    team = ?envelope.team,
                    error = %format!("{error:#}"),
                    "Event handler failed"
                );
                metrics::handler_failed(&name);
                DispatchOutcome::HandlerFailed(name)
            }
        }
    }

    fn context_for(&self, envelope: &Envelope) -> EventContext {
        let team = envelope.team.as_deref().and_then(|id| self.team(id));
        let mut refs = HashMap::new();
        for field in ["user", "channel"] {
            let Some(id) = envelope.reference(field) else {
                continue;
            };
            let known = team.as_ref().and_then(|team| {
                let team = team.borrow();
                match field {
                    "user" => team.user(id).cloned(),
                    _ => team.channel(id).cloned(),
                }
            });
            let entity = match known {
                Some(value) => EntityRef::Resolved(value),
                None => EntityRef::Unresolved(id.to_string()),
            };
            refs.insert(field.to_string(), entity);
        }

        let reply = match (envelope.reply_to(), team.as_ref()) {
            (Some(id), Some(team)) => team.borrow_mut().take_sent(id),
            _ => None,
        };

        EventContext { team, refs, reply }
    }

    /// Resume routines waiting for the reply to a streamed message.
    fn resolve_reply(&self, envelope: &Envelope, context: &EventContext) {
        let (Some(id), Some(team)) = (envelope.reply_to(), context.team.as_ref()) else {
            return;
        };
        let key = team.borrow().reply_key(id);
        self.state
            .runtime
            .resolve(&key, HookEvent::Value(envelope.payload.clone()));
    }

    /// Register the tick callback and hook the first timer.
    pub fn start(&self) {
        let weak: Weak<RouterState> = Rc::downgrade(&self.state);
        self.state
            .runtime
            .register_callback(&self.state.tick_token, move |_| {
                if let Some(state) = weak.upgrade() {
                    EventRouter { state }.on_tick();
                }
            });
        self.state.started.set(true);
        self.reschedule();
    }

    /// Drain up to `events_per_tick` items, then adjust the tick interval.
    pub fn on_tick(&self) -> usize {
        let mut handled = 0;
        for _ in 0..self.state.config.events_per_tick {
            if self.handle_next() == DispatchOutcome::Idle {
                break;
            }
            handled += 1;
        }
        self.reschedule();
        handled
    }

    pub fn tick_token(&self) -> &str {
        &self.state.tick_token
    }

    /// Current tick interval, if the timer is hooked
    pub fn tick_interval(&self) -> Option<u64> {
        self.state.tick.borrow().as_ref().map(|tick| tick.interval_ms)
    }

    fn desired_interval(&self) -> u64 {
        let config = &self.state.config;
        if !self.state.queue.borrow().is_empty() {
            config.busy_interval_ms
        } else if !self.state.slow_queue.borrow().is_empty() {
            config
                .slow_queue_interval_ms
                .clamp(config.busy_interval_ms, config.idle_interval_ms)
        } else {
            config.idle_interval_ms
        }
    }

    /// Re-hook the tick timer only if the desired interval changed.
    pub fn reschedule(&self) -> bool {
        if !self.state.started.get() || self.state.shutting_down.get() {
            return false;
        }
        let desired = self.desired_interval();
        let mut tick = self.state.tick.borrow_mut();
        if tick.as_ref().is_some_and(|t| t.interval_ms == desired) {
            return false;
        }
        let host = self.state.runtime.host();
        if let Some(previous) = tick.take() {
            host.unhook(previous.handle);
        }
        let handle = host.hook_timer(desired, 0, &self.state.tick_token);
        *tick = Some(TickHook {
            interval_ms: desired,
            handle,
        });
        tracing::debug!(interval_ms = desired, "Router tick rescheduled");
        true
    }

    /// Stop talking to the remote service: drop queued requests, unhook the
    /// tick, and cancel live tasks. Returns the number of dropped requests.
    pub fn shutdown(&self) -> usize {
        if self.state.shutting_down.replace(true) {
            return 0;
        }
        let mut dropped = 0;
        for queue in [&self.state.queue, &self.state.slow_queue] {
            let mut queue = queue.borrow_mut();
            let before = queue.len();
            queue.retain(|item| matches!(item, QueueItem::Event(_)));
            dropped += before - queue.len();
        }
        for _ in 0..dropped {
            metrics::request_dropped("shutdown");
        }

        if let Some(tick) = self.state.tick.borrow_mut().take() {
            self.state.runtime.host().unhook(tick.handle);
        }
        self.state
            .runtime
            .unregister_callback(&self.state.tick_token);
        let cancelled = self.state.runtime.cancel_all();
        tracing::info!(dropped, cancelled, "Router shut down");
        dropped
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("queue", &self.queue_len())
            .field("slow_queue", &self.slow_queue_len())
            .field("teams", &self.state.teams.borrow().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
