//! Dashboard counters derived from the cached ticket list.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::types::{Agent, AgentId, Ticket, TicketId, TicketPriority, TicketStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TicketStats {
    pub total: usize,
    pub open: usize,
    pub in_progress: usize,
    pub resolved: usize,
    pub critical: usize,
}

impl TicketStats {
    pub fn from_tickets(tickets: &[Ticket]) -> Self {
        tickets.iter().fold(Self::default(), |mut stats, ticket| {
            stats.total += 1;
            match ticket.status {
                TicketStatus::Open => stats.open += 1,
                TicketStatus::InProgress => stats.in_progress += 1,
                TicketStatus::Resolved => stats.resolved += 1,
            }
            if ticket.priority == TicketPriority::Critical {
                stats.critical += 1;
            }
            stats
        })
    }
}

/// Tickets created on one UTC calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: usize,
}

/// One point per day from the earliest to the latest creation date, with
/// zero for days without tickets.
pub fn daily_created(tickets: &[Ticket]) -> Vec<DailyCount> {
    let mut by_day: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for ticket in tickets {
        *by_day.entry(ticket.created_at.date_naive()).or_default() += 1;
    }

    let (Some(&first), Some(&last)) = (by_day.keys().next(), by_day.keys().next_back()) else {
        return Vec::new();
    };

    first
        .iter_days()
        .take_while(|day| *day <= last)
        .map(|date| DailyCount {
            date,
            count: by_day.get(&date).copied().unwrap_or(0),
        })
        .collect()
}

/// Tickets currently assigned to one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentWorkload {
    pub agent_id: AgentId,
    pub name: String,
    pub ticket_ids: Vec<TicketId>,
}

impl AgentWorkload {
    pub fn count(&self) -> usize {
        self.ticket_ids.len()
    }
}

/// Per-agent assignment, in agent order, computed from the tickets
/// themselves rather than any id list the backend sends with the agent.
pub fn agent_workloads(agents: &[Agent], tickets: &[Ticket]) -> Vec<AgentWorkload> {
    let mut assigned: BTreeMap<AgentId, Vec<TicketId>> = BTreeMap::new();
    for ticket in tickets {
        if let Some(agent_id) = ticket.agent_id {
            assigned.entry(agent_id).or_default().push(ticket.id);
        }
    }

    agents
        .iter()
        .map(|agent| AgentWorkload {
            agent_id: agent.id,
            name: agent.name.clone(),
            ticket_ids: assigned.get(&agent.id).cloned().unwrap_or_default(),
        })
        .collect()
}
