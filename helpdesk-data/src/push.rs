//! Reconnecting push channel for server-initiated ticket events.
//!
//! The channel owns the subscriber registry and the connection lifecycle.
//! Bytes on the wire are the transport's business (see `hub`).

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PushError;
use crate::types::{StatusChange, Ticket, TicketId, TicketRef};

/// The four server-initiated event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TicketCreated,
    TicketUpdated,
    TicketStatusChanged,
    TicketDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::TicketCreated,
        EventKind::TicketUpdated,
        EventKind::TicketStatusChanged,
        EventKind::TicketDeleted,
    ];

    /// Hub method name for this event.
    pub fn target(self) -> &'static str {
        match self {
            EventKind::TicketCreated => "TicketCreated",
            EventKind::TicketUpdated => "TicketUpdated",
            EventKind::TicketStatusChanged => "TicketStatusChanged",
            EventKind::TicketDeleted => "TicketDeleted",
        }
    }

    pub fn from_target(target: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.target().eq_ignore_ascii_case(target))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target())
    }
}

impl FromStr for EventKind {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_target(s.trim())
            .ok_or_else(|| PushError::Protocol(format!("unknown event '{}'", s)))
    }
}

/// Created/updated payload. The id is always known; the full ticket only
/// when the server sent one that normalizes cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketNotice {
    pub id: TicketId,
    pub ticket: Option<Ticket>,
}

impl TicketNotice {
    fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        match Ticket::deserialize(&value) {
            Ok(ticket) => Ok(Self {
                id: ticket.id,
                ticket: Some(ticket),
            }),
            Err(_) => TicketRef::deserialize(value).map(|r| Self {
                id: r.id,
                ticket: None,
            }),
        }
    }
}

/// A decoded push notification. A hint to refetch, never an authoritative diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    TicketCreated(TicketNotice),
    TicketUpdated(TicketNotice),
    TicketStatusChanged(StatusChange),
    TicketDeleted(TicketRef),
}

impl PushEvent {
    pub fn decode(kind: EventKind, payload: serde_json::Value) -> Result<Self, PushError> {
        let bad =
            |e: serde_json::Error| PushError::Protocol(format!("bad {} payload: {}", kind, e));
        let event = match kind {
            EventKind::TicketCreated => {
                PushEvent::TicketCreated(TicketNotice::from_value(payload).map_err(bad)?)
            }
            EventKind::TicketUpdated => {
                PushEvent::TicketUpdated(TicketNotice::from_value(payload).map_err(bad)?)
            }
            EventKind::TicketStatusChanged => {
                PushEvent::TicketStatusChanged(serde_json::from_value(payload).map_err(bad)?)
            }
            EventKind::TicketDeleted => {
                PushEvent::TicketDeleted(serde_json::from_value(payload).map_err(bad)?)
            }
        };
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            PushEvent::TicketCreated(_) => EventKind::TicketCreated,
            PushEvent::TicketUpdated(_) => EventKind::TicketUpdated,
            PushEvent::TicketStatusChanged(_) => EventKind::TicketStatusChanged,
            PushEvent::TicketDeleted(_) => EventKind::TicketDeleted,
        }
    }

    pub fn ticket_id(&self) -> TicketId {
        match self {
            PushEvent::TicketCreated(notice) | PushEvent::TicketUpdated(notice) => notice.id,
            PushEvent::TicketStatusChanged(change) => change.id,
            PushEvent::TicketDeleted(r) => r.id,
        }
    }
}

// --- Transport seam ---

/// What a connected transport reports back to the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Event {
        target: String,
        payload: serde_json::Value,
    },
    /// The connection dropped; the transport is retrying.
    Reconnecting(Option<String>),
    Reconnected,
    /// The transport gave up or the server closed for good.
    Closed(Option<String>),
}

/// A duplex connection to the push server.
///
/// `connect` resolves once the first connection is established. After that
/// the transport reports through the returned receiver, reconnecting on its
/// own, until it sends `Closed`, drops the sender, or `cancel` fires.
pub trait PushTransport: Send + Sync + 'static {
    fn connect(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<mpsc::Receiver<TransportSignal>, PushError>> + Send;
}

// --- Subscriptions ---

/// Handle to a registered handler.
///
/// `unsubscribe` is idempotent. Dropping the handle unsubscribes too;
/// `detach` keeps the handler for the channel's lifetime instead.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    pub fn is_active(&self) -> bool {
        self.dispose.is_some()
    }

    pub fn detach(mut self) {
        self.dispose = None;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

type EventHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(Option<&str>) + Send + Sync>;

struct Registered {
    id: u64,
    kind: EventKind,
    once: bool,
    handler: EventHandler,
}

#[derive(Clone)]
enum Hook {
    Connected(Arc<dyn Fn() + Send + Sync>),
    Reconnecting(ErrorHandler),
    Closed(ErrorHandler),
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<Registered>,
    hooks: Vec<(u64, Hook)>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

// --- Channel ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

type PendingStart = Shared<BoxFuture<'static, Result<(), PushError>>>;

/// One start/stop cycle. `epoch` tells a finished connect or a closing
/// transport whether it still belongs to the live session.
#[derive(Default)]
struct Session {
    epoch: u64,
    pending: Option<PendingStart>,
    cancel: Option<CancellationToken>,
}

impl Session {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.cancel.is_some()
    }
}

struct ChannelInner<T> {
    transport: T,
    registry: Mutex<Registry>,
    session: Mutex<Session>,
    state: watch::Sender<ChannelState>,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: PushTransport> ChannelInner<T> {
    fn set_state(&self, state: ChannelState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "push channel state");
            *current = state;
            true
        });
    }

    async fn connect(
        self: Arc<Self>,
        epoch: u64,
        cancel: CancellationToken,
    ) -> Result<(), PushError> {
        let result = self.transport.connect(cancel.clone()).await;

        let current = {
            let mut session = lock(&self.session);
            let current = session.is_current(epoch) && !cancel.is_cancelled();
            if current {
                session.pending = None;
                match &result {
                    Ok(_) => self.set_state(ChannelState::Connected),
                    Err(_) => {
                        session.cancel = None;
                        self.set_state(ChannelState::Disconnected);
                    }
                }
            }
            current
        };
        if !current {
            // stop() ran while connecting and already reported the close.
            return Err(PushError::Stopped);
        }

        match result {
            Ok(signals) => {
                info!("push channel connected");
                self.fire_connected();
                tokio::spawn(pump(Arc::downgrade(&self), signals, epoch, cancel));
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "push channel failed to connect");
                self.fire_error_hook(false, Some(&err.to_string()));
                Err(err)
            }
        }
    }

    fn deliver(&self, target: &str, payload: serde_json::Value) {
        let Some(kind) = EventKind::from_target(target) else {
            debug!(%target, "ignoring unknown hub method");
            return;
        };
        let event = match PushEvent::decode(kind, payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "dropping undecodable push event");
                return;
            }
        };
        debug!(event = %kind, ticket_id = event.ticket_id(), "push event");

        let snapshot: Vec<(u64, bool, EventHandler)> = {
            let mut registry = lock(&self.registry);
            let snapshot = registry
                .handlers
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| (r.id, r.once, Arc::clone(&r.handler)))
                .collect();
            registry.handlers.retain(|r| !(r.kind == kind && r.once));
            snapshot
        };

        for (id, once, handler) in snapshot {
            // Unsubscribed by an earlier handler of this same event.
            if !once && !lock(&self.registry).handlers.iter().any(|r| r.id == id) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(event = %kind, handler = id, "push handler panicked");
            }
        }
    }

    fn hooks(&self) -> Vec<(u64, Hook)> {
        lock(&self.registry).hooks.clone()
    }

    fn fire_connected(&self) {
        for (id, hook) in self.hooks() {
            if let Hook::Connected(callback) = hook {
                if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                    error!(hook = id, "connected callback panicked");
                }
            }
        }
    }

    /// `reconnecting` selects between the reconnecting and closed hooks.
    fn fire_error_hook(&self, reconnecting: bool, err: Option<&str>) {
        for (id, hook) in self.hooks() {
            let callback = match (hook, reconnecting) {
                (Hook::Reconnecting(cb), true) | (Hook::Closed(cb), false) => cb,
                _ => continue,
            };
            if catch_unwind(AssertUnwindSafe(|| callback(err))).is_err() {
                error!(hook = id, "lifecycle callback panicked");
            }
        }
    }

    fn remove(&self, id: u64) {
        let mut registry = lock(&self.registry);
        registry.handlers.retain(|r| r.id != id);
        registry.hooks.retain(|(hook_id, _)| *hook_id != id);
    }
}

impl<T> Drop for ChannelInner<T> {
    fn drop(&mut self) {
        if let Some(cancel) = lock(&self.session).cancel.take() {
            cancel.cancel();
        }
    }
}

/// Relay transport signals into the channel until the session ends.
async fn pump<T: PushTransport>(
    inner: Weak<ChannelInner<T>>,
    mut signals: mpsc::Receiver<TransportSignal>,
    epoch: u64,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            signal = signals.recv() => signal,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match signal {
            Some(TransportSignal::Event { target, payload }) => inner.deliver(&target, payload),
            Some(TransportSignal::Reconnecting(err)) => {
                info!(error = err.as_deref().unwrap_or("none"), "push channel reconnecting");
                inner.set_state(ChannelState::Reconnecting);
                inner.fire_error_hook(true, err.as_deref());
            }
            Some(TransportSignal::Reconnected) => {
                info!("push channel reconnected");
                inner.set_state(ChannelState::Connected);
                inner.fire_connected();
            }
            Some(TransportSignal::Closed(err)) => {
                close_session(&inner, epoch, err.as_deref());
                return;
            }
            None => {
                close_session(&inner, epoch, None);
                return;
            }
        }
    }
}

fn close_session<T: PushTransport>(inner: &ChannelInner<T>, epoch: u64, err: Option<&str>) {
    {
        let mut session = lock(&inner.session);
        if !session.is_current(epoch) {
            return;
        }
        session.cancel = None;
        inner.set_state(ChannelState::Disconnected);
    }
    match err {
        Some(err) => warn!(error = %err, "push channel closed"),
        None => info!("push channel closed"),
    }
    inner.fire_error_hook(false, err);
}

/// Reconnecting push channel. Cheap to clone; clones share the connection
/// and the subscriber registry.
pub struct PushChannel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for PushChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PushTransport> PushChannel<T> {
    pub fn new(transport: T) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                registry: Mutex::new(Registry::default()),
                session: Mutex::new(Session::default()),
                state,
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Connect if not already connected. Concurrent callers share a single
    /// attempt and all see its outcome. A failed first connect is not retried.
    pub async fn start(&self) -> Result<(), PushError> {
        let pending = {
            let mut session = lock(&self.inner.session);
            if let Some(pending) = &session.pending {
                pending.clone()
            } else if session.cancel.is_some() {
                // Connected or reconnecting already.
                return Ok(());
            } else {
                let cancel = CancellationToken::new();
                session.epoch += 1;
                session.cancel = Some(cancel.clone());
                self.inner.set_state(ChannelState::Connecting);
                info!(epoch = session.epoch, "push channel connecting");
                let pending = Arc::clone(&self.inner)
                    .connect(session.epoch, cancel)
                    .boxed()
                    .shared();
                session.pending = Some(pending.clone());
                tokio::spawn(pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Disconnect. Handlers stay registered for the next `start`.
    pub async fn stop(&self) {
        {
            let mut session = lock(&self.inner.session);
            session.pending = None;
            let Some(cancel) = session.cancel.take() else {
                return;
            };
            cancel.cancel();
            self.inner.set_state(ChannelState::Disconnected);
        }
        info!("push channel stopped");
        self.inner.fire_error_hook(false, None);
    }

    fn register_handler(&self, kind: EventKind, once: bool, handler: EventHandler) -> Subscription {
        let id = {
            let mut registry = lock(&self.inner.registry);
            let id = registry.next_id();
            registry.handlers.push(Registered {
                id,
                kind,
                once,
                handler,
            });
            id
        };
        self.disposer(id)
    }

    fn register_hook(&self, hook: Hook) -> Subscription {
        let id = {
            let mut registry = lock(&self.inner.registry);
            let id = registry.next_id();
            registry.hooks.push((id, hook));
            id
        };
        self.disposer(id)
    }

    fn disposer(&self, id: u64) -> Subscription {
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(id);
            }
        })
    }

    /// Call `handler` for every `kind` event, in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.register_handler(kind, false, Arc::new(handler))
    }

    /// Like `subscribe`, but the handler is removed after its first call.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.register_handler(kind, true, Arc::new(handler))
    }

    /// Called on the first connect and after every successful reconnect.
    pub fn on_connected<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register_hook(Hook::Connected(Arc::new(callback)))
    }

    pub fn on_reconnecting<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.register_hook(Hook::Reconnecting(Arc::new(callback)))
    }

    /// Called when the channel goes down for good: stop, retries exhausted,
    /// or a failed initial connect.
    pub fn on_closed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&str>) + Send + Sync + 'static,
    {
        self.register_hook(Hook::Closed(Arc::new(callback)))
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        lock(&self.inner.registry)
            .handlers
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }

    pub fn hook_count(&self) -> usize {
        lock(&self.inner.registry).hooks.len()
    }
}
