mod console;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use helpdesk_data::filters::{SortKey, TicketSort};
use helpdesk_data::{
    AgentFilter, Choice, ConnectionState, ConnectionStore, HelpdeskConfig, HelpdeskQueries,
    HubOptions, HubTransport, PushChannel, QueryKey, Resource, RestClient, SyncBridge,
    TicketFilters, TicketPriority, TicketQuery, TicketStatus,
};

#[derive(Parser)]
#[command(name = "helpdesk-live", about = "Live view of the help-desk ticket board")]
struct Cli {
    /// Path to config file (default: ~/.config/helpdesk/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Profile to use from the config file (prod or dev)
    #[arg(long)]
    env: Option<String>,

    /// Only show tickets with this status (Open, InProgress, Resolved, all)
    #[arg(long, default_value = "all")]
    status: Choice<TicketStatus>,

    /// Only show tickets with this priority (Low, Medium, High, Critical, all)
    #[arg(long, default_value = "all")]
    priority: Choice<TicketPriority>,

    /// Agent id, "unassigned", or "any"
    #[arg(long, default_value = "any")]
    agent: AgentFilter,

    /// Case-insensitive text search
    #[arg(long, default_value = "")]
    search: String,

    /// Sort column (id, title, status, priority, agent, created, updated)
    #[arg(long, default_value = "id")]
    sort: SortKey,

    /// Sort descending
    #[arg(long)]
    desc: bool,
}

impl Cli {
    fn filters(&self) -> TicketFilters {
        TicketFilters {
            status: self.status,
            priority: self.priority,
            agent: self.agent,
            search: self.search.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let filters = cli.filters();
    let sort = TicketSort::new(cli.sort, cli.desc);

    let config = HelpdeskConfig::load(cli.config.as_deref(), cli.env.as_deref())?;
    info!(env = %config.env, api = %config.api_base_url, hub = %config.push_url, "loaded config");

    let queries = HelpdeskQueries::new(RestClient::from_config(&config)?);
    let connection = Arc::new(ConnectionStore::default());
    let channel = PushChannel::new(HubTransport::new(HubOptions::from_config(&config)));
    let bridge = SyncBridge::new(queries.clone(), Arc::clone(&connection));
    bridge.attach(&channel);

    let cancel = CancellationToken::new();
    let status_handle = spawn_status_log(connection.subscribe(), cancel.clone());

    // The board still works from REST alone when the hub is unreachable.
    if let Err(e) = channel.start().await {
        error!(error = %e, "push channel unavailable, showing snapshots only");
    }

    let mut tickets = queries.observe_tickets(filters.to_query());
    // Workloads and the daily series cover every ticket, whatever the board shows.
    let mut everything = queries.observe_tickets(TicketQuery::all());
    let mut agents = queries.observe(QueryKey::Agents);
    let mut all_tickets = Vec::new();
    let mut latest_agents = Vec::new();

    info!("console started, waiting for data");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                cancel.cancel();
                break;
            }

            state = tickets.changed() => {
                if let Some(e) = &state.error {
                    warn!(error = %e, "ticket list refresh failed");
                }
                if state.is_fetching() {
                    continue;
                }
                if let Some(rows) = state.data.and_then(Resource::into_tickets) {
                    println!(
                        "{}\n",
                        console::render_board(&rows, &filters, sort, &connection.get())
                    );
                }
            }

            state = everything.changed() => {
                if state.is_fetching() {
                    continue;
                }
                if let Some(rows) = state.data.and_then(Resource::into_tickets) {
                    all_tickets = rows;
                    println!("{}\n", console::render_daily(&all_tickets));
                    if !latest_agents.is_empty() {
                        println!("{}\n", console::render_workloads(&latest_agents, &all_tickets));
                    }
                }
            }

            state = agents.changed() => {
                if let Some(e) = &state.error {
                    warn!(error = %e, "agent list refresh failed");
                }
                if let Some(rows) = state.data.and_then(Resource::into_agents) {
                    latest_agents = rows;
                    println!("{}\n", console::render_workloads(&latest_agents, &all_tickets));
                }
            }
        }
    }

    bridge.detach();
    channel.stop().await;
    if let Err(e) = status_handle.await {
        warn!(error = %e, "status task ended abnormally");
    }
    info!("console stopped");
    Ok(())
}

/// Log every connection status transition until cancelled.
fn spawn_status_log(
    mut rx: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = rx.borrow_and_update().clone();
                    match &state.last_error {
                        Some(err) if !state.connected => {
                            warn!(status = state.label(), error = %err, "connection status");
                        }
                        _ => info!(status = state.label(), "connection status"),
                    }
                }
            }
        }
    })
}
