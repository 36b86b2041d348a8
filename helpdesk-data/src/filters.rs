//! Ticket list filters and the derivation of visible rows.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;
use crate::state::{Reducer, StateStore};
use crate::types::{AgentId, Ticket, TicketPriority, TicketQuery, TicketStatus};

/// Either every value or exactly one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Choice<T> {
    #[default]
    All,
    Only(T),
}

impl<T: PartialEq + Copy> Choice<T> {
    pub fn accepts(&self, value: T) -> bool {
        match self {
            Choice::All => true,
            Choice::Only(wanted) => *wanted == value,
        }
    }

    pub fn as_option(&self) -> Option<T> {
        match self {
            Choice::All => None,
            Choice::Only(value) => Some(*value),
        }
    }
}

impl<T: FromStr<Err = ApiError>> FromStr for Choice<T> {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(Choice::All);
        }
        s.parse().map(Choice::Only)
    }
}

impl<T: fmt::Display> fmt::Display for Choice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::All => f.write_str("All"),
            Choice::Only(value) => write!(f, "{}", value),
        }
    }
}

/// Assignment filter. Agent id 0 is an ordinary id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AgentFilter {
    #[default]
    Any,
    Unassigned,
    Agent(AgentId),
}

impl AgentFilter {
    pub fn accepts(&self, ticket: &Ticket) -> bool {
        match self {
            AgentFilter::Any => true,
            AgentFilter::Unassigned => ticket.agent_id.is_none(),
            AgentFilter::Agent(id) => ticket.agent_id == Some(*id),
        }
    }
}

impl FromStr for AgentFilter {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "all" => Ok(AgentFilter::Any),
            "unassigned" | "none" => Ok(AgentFilter::Unassigned),
            other => other.parse().map(AgentFilter::Agent).map_err(|_| {
                ApiError::Validation(format!(
                    "invalid agent filter '{}'. Use 'any', 'unassigned' or an agent id",
                    s
                ))
            }),
        }
    }
}

/// The dashboard's filter selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketFilters {
    pub status: Choice<TicketStatus>,
    pub priority: Choice<TicketPriority>,
    pub agent: AgentFilter,
    pub search: String,
}

impl TicketFilters {
    /// Trimmed, lowercased search term, if any.
    fn needle(&self) -> Option<String> {
        let trimmed = self.search.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_lowercase())
    }

    pub fn matches(&self, ticket: &Ticket) -> bool {
        self.status.accepts(ticket.status)
            && self.priority.accepts(ticket.priority)
            && self.agent.accepts(ticket)
            && self
                .needle()
                .map_or(true, |needle| search_matches(ticket, &needle))
    }

    /// Server-side part of the filter. The agent filter is applied locally only.
    pub fn to_query(&self) -> TicketQuery {
        TicketQuery {
            status: self.status.as_option(),
            priority: self.priority.as_option(),
            search: self.needle().map(|_| self.search.trim().to_string()),
        }
    }

    /// True when at least one predicate narrows the list.
    pub fn is_active(&self) -> bool {
        self.status != Choice::All
            || self.priority != Choice::All
            || self.agent != AgentFilter::Any
            || self.needle().is_some()
    }
}

fn search_matches(ticket: &Ticket, needle: &str) -> bool {
    let contains = |haystack: &str| haystack.to_lowercase().contains(needle);
    contains(&ticket.title)
        || contains(&ticket.description)
        || ticket.agent_name.as_deref().is_some_and(|name| contains(name))
        || contains(ticket.status.as_str())
        || contains(ticket.priority.as_str())
        || ticket.id.to_string().contains(needle)
}

/// Tickets passing every active filter, in input order.
pub fn visible(tickets: &[Ticket], filters: &TicketFilters) -> Vec<Ticket> {
    tickets
        .iter()
        .filter(|ticket| filters.matches(ticket))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    SetStatus(Choice<TicketStatus>),
    SetPriority(Choice<TicketPriority>),
    SetAgent(AgentFilter),
    SetSearch(String),
    Reset,
}

pub struct Filters;

impl Reducer for Filters {
    type State = TicketFilters;
    type Action = FilterAction;

    fn reduce(state: &TicketFilters, action: FilterAction) -> TicketFilters {
        let mut next = state.clone();
        match action {
            FilterAction::SetStatus(status) => next.status = status,
            FilterAction::SetPriority(priority) => next.priority = priority,
            FilterAction::SetAgent(agent) => next.agent = agent,
            FilterAction::SetSearch(search) => next.search = search,
            FilterAction::Reset => next = TicketFilters::default(),
        }
        next
    }
}

pub type FilterStore = StateStore<Filters>;

// --- Sorting ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Id,
    Title,
    Status,
    Priority,
    Agent,
    Created,
    Updated,
}

impl FromStr for SortKey {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "id" => Ok(SortKey::Id),
            "title" => Ok(SortKey::Title),
            "status" => Ok(SortKey::Status),
            "priority" => Ok(SortKey::Priority),
            "agent" => Ok(SortKey::Agent),
            "created" | "created_at" => Ok(SortKey::Created),
            "updated" | "updated_at" => Ok(SortKey::Updated),
            _ => Err(ApiError::Validation(format!(
                "unknown sort column '{}'. Valid values: id, title, status, priority, agent, created, updated",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TicketSort {
    pub key: SortKey,
    pub descending: bool,
}

impl TicketSort {
    pub fn new(key: SortKey, descending: bool) -> Self {
        Self { key, descending }
    }
}

fn compare_by(key: SortKey, a: &Ticket, b: &Ticket) -> Ordering {
    match key {
        SortKey::Id => Ordering::Equal,
        SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        SortKey::Status => a.status.rank().cmp(&b.status.rank()),
        SortKey::Priority => a.priority.rank().cmp(&b.priority.rank()),
        SortKey::Agent => match (&a.agent_name, &b.agent_name) {
            (Some(x), Some(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
        SortKey::Created => a.created_at.cmp(&b.created_at),
        SortKey::Updated => a.updated_at.cmp(&b.updated_at),
    }
}

/// Sort rows in place. Ties break by id; unassigned tickets sort last by
/// agent in either direction.
pub fn sort_tickets(rows: &mut [Ticket], sort: TicketSort) {
    rows.sort_by(|a, b| {
        let unassigned_last = sort.key == SortKey::Agent
            && a.agent_name.is_some() != b.agent_name.is_some();
        let primary = compare_by(sort.key, a, b);
        let primary = if sort.descending && !unassigned_last {
            primary.reverse()
        } else {
            primary
        };
        let tie = if sort.descending {
            b.id.cmp(&a.id)
        } else {
            a.id.cmp(&b.id)
        };
        primary.then(tie)
    });
}
