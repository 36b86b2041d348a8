//! Typed reads and mutations over the shared query cache.

use std::sync::Arc;

use futures::future::FutureExt;
use tracing::{debug, info};

use crate::cache::{Fetcher, QueryCache, QueryObserver, QueryState};
use crate::client::HelpdeskApi;
use crate::error::{ApiError, Result};
use crate::types::*;

/// Identity of one cached server resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// A ticket list for one server-side filter. Always built from a
    /// normalized `TicketQuery`.
    Tickets(TicketQuery),
    Ticket(TicketId),
    Agents,
}

impl QueryKey {
    pub fn tickets(query: TicketQuery) -> Self {
        QueryKey::Tickets(query.normalized())
    }

    pub fn is_ticket_list(&self) -> bool {
        matches!(self, QueryKey::Tickets(_))
    }
}

/// Cached payload. The variant always matches the key it is stored under.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Tickets(Vec<Ticket>),
    Ticket(Ticket),
    Agents(Vec<Agent>),
}

impl Resource {
    pub fn into_tickets(self) -> Option<Vec<Ticket>> {
        match self {
            Resource::Tickets(tickets) => Some(tickets),
            _ => None,
        }
    }

    pub fn into_ticket(self) -> Option<Ticket> {
        match self {
            Resource::Ticket(ticket) => Some(ticket),
            _ => None,
        }
    }

    pub fn into_agents(self) -> Option<Vec<Agent>> {
        match self {
            Resource::Agents(agents) => Some(agents),
            _ => None,
        }
    }
}

pub type HelpdeskCache = QueryCache<QueryKey, Resource>;
pub type ResourceObserver = QueryObserver<QueryKey, Resource>;

fn mismatch(key: &QueryKey) -> ApiError {
    ApiError::Decode(format!("cached value does not match key {:?}", key))
}

/// The remote data client paired with the query cache.
///
/// Reads go through the cache; mutations call the client directly and
/// invalidate the keys they affect once the server has accepted them.
pub struct HelpdeskQueries<A> {
    api: Arc<A>,
    cache: HelpdeskCache,
}

impl<A> Clone for HelpdeskQueries<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            cache: self.cache.clone(),
        }
    }
}

impl<A: HelpdeskApi> HelpdeskQueries<A> {
    pub fn new(api: A) -> Self {
        Self::with_cache(Arc::new(api), HelpdeskCache::new())
    }

    pub fn with_cache(api: Arc<A>, cache: HelpdeskCache) -> Self {
        Self { api, cache }
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn cache(&self) -> &HelpdeskCache {
        &self.cache
    }

    /// Fetcher that loads `key` from the remote client.
    pub fn fetcher(&self, key: &QueryKey) -> Fetcher<Resource> {
        let api = Arc::clone(&self.api);
        let key = key.clone();
        Arc::new(move || {
            let api = Arc::clone(&api);
            let key = key.clone();
            async move {
                match key {
                    QueryKey::Tickets(query) => {
                        api.list_tickets(&query).await.map(Resource::Tickets)
                    }
                    QueryKey::Ticket(id) => api.get_ticket(id).await.map(Resource::Ticket),
                    QueryKey::Agents => api.list_agents().await.map(Resource::Agents),
                }
            }
            .boxed()
        })
    }

    // --- Reads ---

    /// Snapshot of a ticket list, starting a fetch if it is stale.
    pub fn tickets(&self, query: TicketQuery) -> QueryState<Vec<Ticket>> {
        let key = QueryKey::tickets(query);
        self.cache
            .read(&key, self.fetcher(&key))
            .map(Resource::into_tickets)
    }

    pub async fn fetch_tickets(&self, query: TicketQuery) -> Result<Vec<Ticket>> {
        let key = QueryKey::tickets(query);
        let resource = self.cache.fetch(&key, self.fetcher(&key)).await?;
        resource.into_tickets().ok_or_else(|| mismatch(&key))
    }

    pub fn ticket(&self, id: TicketId) -> QueryState<Ticket> {
        let key = QueryKey::Ticket(id);
        self.cache
            .read(&key, self.fetcher(&key))
            .map(Resource::into_ticket)
    }

    pub async fn fetch_ticket(&self, id: TicketId) -> Result<Ticket> {
        let key = QueryKey::Ticket(id);
        let resource = self.cache.fetch(&key, self.fetcher(&key)).await?;
        resource.into_ticket().ok_or_else(|| mismatch(&key))
    }

    pub fn agents(&self) -> QueryState<Vec<Agent>> {
        let key = QueryKey::Agents;
        self.cache
            .read(&key, self.fetcher(&key))
            .map(Resource::into_agents)
    }

    pub async fn fetch_agents(&self) -> Result<Vec<Agent>> {
        let key = QueryKey::Agents;
        let resource = self.cache.fetch(&key, self.fetcher(&key)).await?;
        resource.into_agents().ok_or_else(|| mismatch(&key))
    }

    /// Keep `key` observed. While the returned handle lives, invalidating the
    /// key refetches it right away.
    pub fn observe(&self, key: QueryKey) -> ResourceObserver {
        let fetcher = self.fetcher(&key);
        self.cache.observe(key, fetcher)
    }

    pub fn observe_tickets(&self, query: TicketQuery) -> ResourceObserver {
        self.observe(QueryKey::tickets(query))
    }

    // --- Invalidation ---

    /// Every ticket-list key, whatever its filter.
    pub fn invalidate_ticket_lists(&self) -> usize {
        let count = self.cache.invalidate_matching(QueryKey::is_ticket_list);
        debug!(count, "invalidated ticket lists");
        count
    }

    pub fn invalidate_ticket(&self, id: TicketId) -> bool {
        self.cache.invalidate(&QueryKey::Ticket(id))
    }

    /// Ticket lists and single tickets alike, e.g. after push events may
    /// have been missed.
    pub fn invalidate_all_tickets(&self) -> usize {
        self.cache
            .invalidate_matching(|key| matches!(key, QueryKey::Tickets(_) | QueryKey::Ticket(_)))
    }

    pub fn invalidate_agents(&self) -> bool {
        self.cache.invalidate(&QueryKey::Agents)
    }

    // --- Mutations ---

    pub async fn create_ticket(&self, draft: &TicketDraft) -> Result<Ticket> {
        let ticket = self.api.create_ticket(draft).await?;
        info!(ticket_id = ticket.id, "ticket created");
        self.invalidate_ticket_lists();
        Ok(ticket)
    }

    pub async fn update_ticket(&self, id: TicketId, edit: &TicketEdit) -> Result<Ticket> {
        let ticket = self.api.update_ticket(id, edit).await?;
        info!(ticket_id = id, "ticket updated");
        self.invalidate_ticket(id);
        self.invalidate_ticket_lists();
        Ok(ticket)
    }

    pub async fn update_ticket_status(&self, id: TicketId, status: TicketStatus) -> Result<Ticket> {
        let ticket = self.api.update_ticket_status(id, status).await?;
        info!(ticket_id = id, status = %status, "ticket status changed");
        self.invalidate_ticket(id);
        self.invalidate_ticket_lists();
        Ok(ticket)
    }

    pub async fn assign_ticket(&self, id: TicketId, agent_id: Option<AgentId>) -> Result<()> {
        self.api.assign_ticket(id, agent_id).await?;
        info!(ticket_id = id, ?agent_id, "ticket assignment changed");
        self.invalidate_ticket(id);
        self.invalidate_ticket_lists();
        Ok(())
    }

    pub async fn delete_ticket(&self, id: TicketId) -> Result<()> {
        self.api.delete_ticket(id).await?;
        info!(ticket_id = id, "ticket deleted");
        self.invalidate_ticket(id);
        self.invalidate_ticket_lists();
        Ok(())
    }

    pub async fn create_agent(&self, draft: &AgentDraft) -> Result<Agent> {
        let agent = self.api.create_agent(draft).await?;
        info!(agent_id = agent.id, "agent created");
        self.invalidate_agents();
        Ok(agent)
    }
}
