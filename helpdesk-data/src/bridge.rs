//! Wires push events to cache invalidations and connection status.
//!
//! | Event               | Invalidates                       |
//! |---------------------|-----------------------------------|
//! | TicketCreated       | every ticket list                 |
//! | TicketUpdated       | every ticket list, that ticket    |
//! | TicketStatusChanged | every ticket list, that ticket    |
//! | TicketDeleted       | every ticket list, that ticket    |
//!
//! All list variants are invalidated instead of diffing the payload into
//! them; ticket volumes are small and the server stays the source of truth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::client::HelpdeskApi;
use crate::live::{ConnectionAction, ConnectionStore};
use crate::push::{EventKind, PushChannel, PushEvent, PushTransport, Subscription};
use crate::queries::HelpdeskQueries;

/// Apply one push event to the cache.
pub fn apply_event<A: HelpdeskApi>(queries: &HelpdeskQueries<A>, event: &PushEvent) {
    let lists = queries.invalidate_ticket_lists();
    let item = match event {
        PushEvent::TicketCreated(_) => None,
        PushEvent::TicketUpdated(_)
        | PushEvent::TicketStatusChanged(_)
        | PushEvent::TicketDeleted(_) => {
            let id = event.ticket_id();
            queries.invalidate_ticket(id);
            Some(id)
        }
    };
    debug!(event = %event.kind(), lists, ticket_id = ?item, "push event invalidated cache");
}

/// Holds no business data, only the registrations it made. Dropping the
/// bridge removes them.
pub struct SyncBridge<A> {
    queries: HelpdeskQueries<A>,
    connection: Arc<ConnectionStore>,
    wiring: Mutex<Vec<Subscription>>,
    /// Set while the channel is down; events sent meanwhile are lost, so the
    /// next connect refreshes everything ticket-shaped.
    missed: Arc<AtomicBool>,
}

impl<A: HelpdeskApi> SyncBridge<A> {
    pub fn new(queries: HelpdeskQueries<A>, connection: Arc<ConnectionStore>) -> Self {
        Self {
            queries,
            connection,
            wiring: Mutex::new(Vec::new()),
            missed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionStore> {
        &self.connection
    }

    /// Register with `channel`. Any earlier wiring is torn down first, so
    /// calling this again never double-registers.
    pub fn attach<T: PushTransport>(&self, channel: &PushChannel<T>) {
        let mut wiring = self.lock();
        if !wiring.is_empty() {
            debug!(count = wiring.len(), "replacing previous bridge wiring");
        }
        wiring.clear();

        for kind in EventKind::ALL {
            let queries = self.queries.clone();
            wiring.push(channel.subscribe(kind, move |event| apply_event(&queries, event)));
        }

        let connection = Arc::clone(&self.connection);
        let queries = self.queries.clone();
        let was_down = Arc::clone(&self.missed);
        wiring.push(channel.on_connected(move || {
            connection.dispatch(ConnectionAction::Connected);
            if was_down.swap(false, Ordering::SeqCst) {
                let count = queries.invalidate_all_tickets();
                info!(count, "refreshing tickets after reconnect");
            }
        }));

        let connection = Arc::clone(&self.connection);
        let was_down = Arc::clone(&self.missed);
        wiring.push(channel.on_reconnecting(move |err| {
            was_down.store(true, Ordering::SeqCst);
            connection.dispatch(ConnectionAction::Reconnecting(err.map(str::to_string)));
        }));

        let connection = Arc::clone(&self.connection);
        let was_down = Arc::clone(&self.missed);
        wiring.push(channel.on_closed(move |err| {
            was_down.store(true, Ordering::SeqCst);
            connection.dispatch(ConnectionAction::Closed(err.map(str::to_string)));
        }));
    }

    /// Remove every registration. Safe to call repeatedly.
    pub fn detach(&self) {
        let previous = std::mem::take(&mut *self.lock());
        drop(previous);
    }

    pub fn is_attached(&self) -> bool {
        !self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.wiring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
