//! Event dispatch: middleware, waits, then the route table
//!
//! Every incoming event first runs through the middleware chain, which may
//! rewrite or swallow it. Surviving events are offered to the wait registry.
//! If no wait consumes the event, routes are tried in ascending priority
//! until one handles it. A [`Completion`] describing the outcome is then
//! fanned out to route handlers and observers on separate tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::Engine;
use super::error::{EngineError, Fault, Result};
use super::event::{Message, Scope, WaitId};
use super::matcher::ScopeMatcher;

/// Application handler attached to a route
pub trait Handler: Send + Sync {
    /// Handle an event no wait consumed. `Ok(true)` stops routing.
    fn handle(&self, engine: &Engine, scope: &Scope, message: &Message) -> anyhow::Result<bool>;

    /// Called after every dispatch applicable to this route's scope kind
    fn on_dispatched(&self, _completion: &Completion) {}

    /// Called once when the dispatcher shuts down
    fn shutdown(&self) {}
}

impl<F> Handler for F
where
    F: Fn(&Engine, &Scope, &Message) -> anyhow::Result<bool> + Send + Sync,
{
    fn handle(&self, engine: &Engine, scope: &Scope, message: &Message) -> anyhow::Result<bool> {
        self(engine, scope, message)
    }
}

/// Pre-processing stage run before any wait or route sees an event
pub trait Middleware: Send + Sync {
    /// Return the (possibly rewritten) event, or `None` to swallow it
    fn process(&self, scope: Scope, message: Message) -> Option<(Scope, Message)>;
}

impl<F> Middleware for F
where
    F: Fn(Scope, Message) -> Option<(Scope, Message)> + Send + Sync,
{
    fn process(&self, scope: Scope, message: Message) -> Option<(Scope, Message)> {
        self(scope, message)
    }
}

/// Receives a [`Completion`] after every dispatch
pub trait DispatchObserver: Send + Sync {
    /// Called on a spawned task once dispatch has finished
    fn on_dispatched(&self, completion: &Completion);
}

impl<F> DispatchObserver for F
where
    F: Fn(&Completion) + Send + Sync,
{
    fn on_dispatched(&self, completion: &Completion) {
        self(completion)
    }
}

/// What consumed an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandledBy {
    /// A pending wait
    Conversation(WaitId),
    /// A route, by name
    Handler(String),
}

/// Outcome of one dispatch
#[derive(Debug, Clone)]
pub struct Completion {
    /// Scope after middleware
    pub scope: Scope,
    /// Message after middleware
    pub message: Message,
    /// Scope as received
    pub original_scope: Scope,
    /// Message as received
    pub original_message: Message,
    /// Who handled the event, if anyone
    pub handled_by: Option<HandledBy>,
    /// Handler failure, rendered
    pub error: Option<String>,
    /// When dispatch finished
    pub finished_at: DateTime<Utc>,
}

impl Completion {
    /// Whether a wait or route handled the event
    pub fn is_handled(&self) -> bool {
        self.handled_by.is_some()
    }
}

/// One entry of the route table
pub struct Route {
    name: String,
    matcher: ScopeMatcher,
    handler: Arc<dyn Handler>,
    priority: i32,
    in_group: bool,
    in_private: bool,
    serialized: bool,
    enabled: bool,
}

impl Route {
    /// Route accepting every scope, at priority 0
    pub fn new<H: Handler + 'static>(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            matcher: ScopeMatcher::All,
            handler: Arc::new(handler),
            priority: 0,
            in_group: true,
            in_private: true,
            serialized: false,
            enabled: true,
        }
    }

    /// Restrict the scopes this route sees
    pub fn matching(mut self, matcher: ScopeMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Lower values run first
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Only group events
    pub fn group_only(mut self) -> Self {
        self.in_group = true;
        self.in_private = false;
        self
    }

    /// Only private events
    pub fn private_only(mut self) -> Self {
        self.in_group = false;
        self.in_private = true;
        self
    }

    /// Run the handler under a per-route lock
    pub fn serialized(mut self) -> Self {
        self.serialized = true;
        self
    }

    /// Start disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

struct RouteEntry {
    name: String,
    matcher: ScopeMatcher,
    handler: Arc<dyn Handler>,
    in_group: bool,
    in_private: bool,
    serialized: Option<Mutex<()>>,
    enabled: AtomicBool,
}

impl RouteEntry {
    fn accepts_kind(&self, scope: &Scope) -> bool {
        if scope.is_group() {
            self.in_group
        } else {
            self.in_private
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn handle(&self, engine: &Engine, scope: &Scope, message: &Message) -> anyhow::Result<bool> {
        match &self.serialized {
            Some(lock) => {
                let _guard = lock.lock();
                self.handler.handle(engine, scope, message)
            }
            None => self.handler.handle(engine, scope, message),
        }
    }
}

/// Builds a [`Dispatcher`] from an ordered registration table
pub struct DispatcherBuilder {
    engine: Engine,
    middleware: Vec<Arc<dyn Middleware>>,
    routes: Vec<Route>,
    observers: Vec<Arc<dyn DispatchObserver>>,
}

impl DispatcherBuilder {
    /// Start an empty table
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            middleware: Vec::new(),
            routes: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Append a middleware stage
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Append a route; equal priorities keep insertion order
    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Append an observer
    pub fn observer<O: DispatchObserver + 'static>(mut self, observer: O) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Freeze the table
    pub fn build(mut self) -> Dispatcher {
        self.routes.sort_by_key(|route| route.priority);
        let routes = self
            .routes
            .into_iter()
            .map(|route| RouteEntry {
                name: route.name,
                matcher: route.matcher,
                handler: route.handler,
                in_group: route.in_group,
                in_private: route.in_private,
                serialized: route.serialized.then(|| Mutex::new(())),
                enabled: AtomicBool::new(route.enabled),
            })
            .collect();

        Dispatcher {
            inner: Arc::new(DispatcherInner {
                engine: self.engine,
                middleware: self.middleware,
                routes,
                observers: self.observers,
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

struct DispatcherInner {
    engine: Engine,
    middleware: Vec<Arc<dyn Middleware>>,
    routes: Vec<RouteEntry>,
    observers: Vec<Arc<dyn DispatchObserver>>,
    shut_down: AtomicBool,
}

/// Single entry point for incoming events
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Start building a dispatcher
    pub fn builder(engine: Engine) -> DispatcherBuilder {
        DispatcherBuilder::new(engine)
    }

    /// The engine events are dispatched into
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Dispatch one event.
    ///
    /// Returns `Ok(None)` when middleware swallowed the event. A handler
    /// failure is returned as [`EngineError::Handler`], and a conversation
    /// that failed on this event as [`EngineError::Conversation`], after
    /// observers have been notified.
    pub fn dispatch(&self, scope: Scope, message: Message) -> Result<Option<Completion>> {
        let original_scope = scope;
        let original_message = message.clone();

        let mut event = (scope, message);
        for middleware in &self.inner.middleware {
            match middleware.process(event.0, event.1) {
                Some(next) => event = next,
                None => {
                    tracing::debug!(scope = %original_scope, "event swallowed by middleware");
                    return Ok(None);
                }
            }
        }
        let (scope, message) = event;

        let outcome = self.inner.engine.registry().dispatch_outcome(&scope, &message);
        let mut handled_by = outcome.consumed.map(HandledBy::Conversation);
        // A conversation that failed on this event is reported like a failed handler.
        let mut failure = outcome.faults.into_iter().next().map(Fault::into_error);

        if handled_by.is_none() {
            for route in &self.inner.routes {
                if !route.is_enabled()
                    || !route.accepts_kind(&scope)
                    || !route.matcher.matches(Some(&scope))
                {
                    continue;
                }
                match route.handle(&self.inner.engine, &scope, &message) {
                    Ok(true) => {
                        handled_by = Some(HandledBy::Handler(route.name.clone()));
                        break;
                    }
                    Ok(false) => {}
                    Err(source) => {
                        tracing::warn!(route = %route.name, scope = %scope, error = %source, "handler failed");
                        if failure.is_none() {
                            failure = Some(EngineError::Handler {
                                name: route.name.clone(),
                                source,
                            });
                        }
                        break;
                    }
                }
            }
        }

        if let Some(by) = &handled_by {
            tracing::debug!(scope = %scope, handled_by = ?by, "event handled");
        }

        let completion = Completion {
            scope,
            message,
            original_scope,
            original_message,
            handled_by,
            error: failure.as_ref().map(ToString::to_string),
            finished_at: Utc::now(),
        };
        self.notify(&completion);

        match failure {
            Some(err) => Err(err),
            None => Ok(Some(completion)),
        }
    }

    fn notify(&self, completion: &Completion) {
        let handle = self.inner.engine.registry().scheduler().handle();

        for route in &self.inner.routes {
            if !route.is_enabled() || !route.accepts_kind(&completion.scope) {
                continue;
            }
            let handler = route.handler.clone();
            let completion = completion.clone();
            handle.spawn(async move { handler.on_dispatched(&completion) });
        }
        for observer in &self.inner.observers {
            let observer = observer.clone();
            let completion = completion.clone();
            handle.spawn(async move { observer.on_dispatched(&completion) });
        }
    }

    /// Enable or disable a route. Returns `false` for an unknown name.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for route in self.inner.routes.iter().filter(|route| route.name == name) {
            route.enabled.store(enabled, Ordering::SeqCst);
            found = true;
        }
        found
    }

    /// Route names in the order they are tried
    pub fn route_names(&self) -> Vec<String> {
        self.inner
            .routes
            .iter()
            .map(|route| route.name.clone())
            .collect()
    }

    /// Run every handler's shutdown hook. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for route in &self.inner.routes {
            route.handler.shutdown();
        }
        tracing::info!(routes = self.inner.routes.len(), "dispatcher shut down");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.route_names())
            .field("middleware", &self.inner.middleware.len())
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}
