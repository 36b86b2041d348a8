#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use helpdesk_data::error::{ApiError, PushError};
use helpdesk_data::push::{PushTransport, TransportSignal};
use helpdesk_data::types::*;
use helpdesk_data::HelpdeskApi;

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
}

pub fn ticket(id: TicketId, title: &str) -> Ticket {
    Ticket {
        id,
        title: title.to_string(),
        description: String::new(),
        status: TicketStatus::Open,
        priority: TicketPriority::Medium,
        created_at: at(1, 9),
        updated_at: at(1, 9),
        agent_id: None,
        agent_name: None,
    }
}

pub fn agent(id: AgentId, name: &str) -> Agent {
    Agent {
        id,
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        is_active: true,
        created_at: at(1, 8),
    }
}

#[derive(Default)]
struct Db {
    tickets: Vec<Ticket>,
    agents: Vec<Agent>,
}

/// In-memory backend that behaves like the REST server and counts calls.
#[derive(Default)]
pub struct FakeBackend {
    db: Mutex<Db>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FakeBackend {
    pub fn new(tickets: Vec<Ticket>, agents: Vec<Agent>) -> Self {
        Self {
            db: Mutex::new(Db { tickets, agents }),
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn record(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
    }

    /// Change a ticket behind the client's back, as another operator would.
    pub fn set_status(&self, id: TicketId, status: TicketStatus) {
        let mut db = self.db.lock().unwrap();
        if let Some(t) = db.tickets.iter_mut().find(|t| t.id == id) {
            t.status = status;
        }
    }

    pub fn rename(&self, id: TicketId, title: &str) {
        let mut db = self.db.lock().unwrap();
        if let Some(t) = db.tickets.iter_mut().find(|t| t.id == id) {
            t.title = title.to_string();
        }
    }

    pub fn insert(&self, ticket: Ticket) {
        self.db.lock().unwrap().tickets.push(ticket);
    }

    pub fn remove(&self, id: TicketId) {
        self.db.lock().unwrap().tickets.retain(|t| t.id != id);
    }

    fn find(&self, id: TicketId) -> Result<Ticket, ApiError> {
        self.db
            .lock()
            .unwrap()
            .tickets
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("ticket {}", id)))
    }
}

impl HelpdeskApi for FakeBackend {
    async fn list_tickets(&self, query: &TicketQuery) -> Result<Vec<Ticket>, ApiError> {
        self.record("list_tickets");
        tokio::task::yield_now().await;
        let search = query.search.as_deref().map(str::to_lowercase);
        let db = self.db.lock().unwrap();
        Ok(db
            .tickets
            .iter()
            .filter(|t| query.status.map_or(true, |s| t.status == s))
            .filter(|t| query.priority.map_or(true, |p| t.priority == p))
            .filter(|t| {
                search
                    .as_deref()
                    .map_or(true, |s| t.title.to_lowercase().contains(s))
            })
            .cloned()
            .collect())
    }

    async fn get_ticket(&self, id: TicketId) -> Result<Ticket, ApiError> {
        self.record("get_ticket");
        tokio::task::yield_now().await;
        self.find(id)
    }

    async fn create_ticket(&self, draft: &TicketDraft) -> Result<Ticket, ApiError> {
        self.record("create_ticket");
        let body = draft.validate()?;
        let mut db = self.db.lock().unwrap();
        let id = db.tickets.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let ticket = Ticket {
            id,
            title: body.title,
            description: body.description.unwrap_or_default(),
            status: TicketStatus::Open,
            priority: draft.priority,
            created_at: at(2, 9),
            updated_at: at(2, 9),
            agent_id: None,
            agent_name: None,
        };
        db.tickets.push(ticket.clone());
        Ok(ticket)
    }

    async fn update_ticket(&self, id: TicketId, edit: &TicketEdit) -> Result<Ticket, ApiError> {
        self.record("update_ticket");
        let body = edit.validate()?;
        let mut db = self.db.lock().unwrap();
        let t = db
            .tickets
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| ApiError::NotFound(format!("ticket {}", id)))?;
        t.title = body.title;
        t.description = body.description;
        t.priority = edit.priority;
        Ok(t.clone())
    }

    async fn update_ticket_status(
        &self,
        id: TicketId,
        status: TicketStatus,
    ) -> Result<Ticket, ApiError> {
        self.record("update_ticket_status");
        self.set_status(id, status);
        self.find(id)
    }

    async fn assign_ticket(&self, id: TicketId, agent_id: Option<AgentId>) -> Result<(), ApiError> {
        self.record("assign_ticket");
        let mut db = self.db.lock().unwrap();
        let name = match agent_id {
            Some(agent_id) => Some(
                db.agents
                    .iter()
                    .find(|a| a.id == agent_id)
                    .map(|a| a.name.clone())
                    .ok_or_else(|| ApiError::NotFound(format!("agent {}", agent_id)))?,
            ),
            None => None,
        };
        let t = db
            .tickets
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| ApiError::NotFound(format!("ticket {}", id)))?;
        t.agent_id = agent_id;
        t.agent_name = name;
        Ok(())
    }

    async fn delete_ticket(&self, id: TicketId) -> Result<(), ApiError> {
        self.record("delete_ticket");
        let mut db = self.db.lock().unwrap();
        let before = db.tickets.len();
        db.tickets.retain(|t| t.id != id);
        if db.tickets.len() == before {
            return Err(ApiError::NotFound(format!("ticket {}", id)));
        }
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, ApiError> {
        self.record("list_agents");
        tokio::task::yield_now().await;
        Ok(self.db.lock().unwrap().agents.clone())
    }

    async fn create_agent(&self, draft: &AgentDraft) -> Result<Agent, ApiError> {
        self.record("create_agent");
        let body = draft.validate()?;
        let mut db = self.db.lock().unwrap();
        let id = db.agents.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        let created = Agent {
            id,
            name: body.name,
            email: body.email,
            is_active: true,
            created_at: at(2, 8),
        };
        db.agents.push(created.clone());
        Ok(created)
    }
}

/// Push transport driven by the test through a sender per connection.
#[derive(Default)]
pub struct ManualTransport {
    links: Mutex<VecDeque<mpsc::Receiver<TransportSignal>>>,
    pub connects: AtomicUsize,
}

impl ManualTransport {
    /// Queue one successful connection and return its signal sender.
    pub fn link(&self) -> mpsc::Sender<TransportSignal> {
        let (tx, rx) = mpsc::channel(32);
        self.links.lock().unwrap().push_back(rx);
        tx
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl PushTransport for ManualTransport {
    async fn connect(
        &self,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TransportSignal>, PushError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.links
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PushError::Connect("no link queued".into()))
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}
