pub mod bridge;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod filters;
pub mod hub;
pub mod live;
pub mod push;
pub mod queries;
pub mod state;
pub mod stats;
pub mod types;

pub use bridge::SyncBridge;
pub use cache::{Freshness, QueryCache, QueryState};
pub use client::{HelpdeskApi, RestClient};
pub use config::HelpdeskConfig;
pub use error::{ApiError, PushError};
pub use filters::{AgentFilter, Choice, FilterAction, FilterStore, TicketFilters};
pub use hub::{HubOptions, HubTransport};
pub use live::{ConnectionAction, ConnectionState, ConnectionStore};
pub use push::{EventKind, PushChannel, PushEvent, Subscription};
pub use queries::{HelpdeskQueries, QueryKey, Resource};
pub use types::{Agent, AgentId, Ticket, TicketId, TicketPriority, TicketQuery, TicketStatus};
