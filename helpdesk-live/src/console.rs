//! Plain-text rendering of the ticket board.

use helpdesk_data::filters::{sort_tickets, visible, TicketSort};
use helpdesk_data::stats::{agent_workloads, daily_created, TicketStats};
use helpdesk_data::{Agent, ConnectionState, Ticket, TicketFilters};

const TITLE_WIDTH: usize = 40;

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

pub fn stats_line(stats: &TicketStats) -> String {
    format!(
        "{} tickets: {} open, {} in progress, {} resolved, {} critical",
        stats.total, stats.open, stats.in_progress, stats.resolved, stats.critical
    )
}

pub fn status_line(connection: &ConnectionState) -> String {
    match &connection.last_error {
        Some(err) => format!("[{}] {}", connection.label(), err),
        None => format!("[{}]", connection.label()),
    }
}

pub fn ticket_row(ticket: &Ticket) -> String {
    format!(
        "#{:<5} {:<11} {:<9} {:<16} {}",
        ticket.id,
        ticket.status.as_str(),
        ticket.priority.as_str(),
        ticket.agent_name.as_deref().unwrap_or("-"),
        truncate(&ticket.title, TITLE_WIDTH)
    )
}

/// Build the whole board: status, counters, then the filtered and sorted rows.
pub fn render_board(
    tickets: &[Ticket],
    filters: &TicketFilters,
    sort: TicketSort,
    connection: &ConnectionState,
) -> String {
    let mut rows = visible(tickets, filters);
    sort_tickets(&mut rows, sort);

    let mut lines = vec![
        status_line(connection),
        stats_line(&TicketStats::from_tickets(tickets)),
    ];
    if filters.is_active() {
        lines.push(format!("showing {} of {}", rows.len(), tickets.len()));
    }
    if rows.is_empty() {
        lines.push("no tickets".to_string());
    }
    lines.extend(rows.iter().map(ticket_row));
    lines.join("\n")
}

pub fn render_workloads(agents: &[Agent], tickets: &[Ticket]) -> String {
    agent_workloads(agents, tickets)
        .iter()
        .map(|w| format!("{:<16} {}", w.name, w.count()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per day since the first ticket, with a bar per ticket.
pub fn render_daily(tickets: &[Ticket]) -> String {
    daily_created(tickets)
        .iter()
        .map(|day| format!("{} {:>3} {}", day.date, day.count, "#".repeat(day.count)))
        .collect::<Vec<_>>()
        .join("\n")
}
