use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::error::ApiError;

pub type TicketId = i64;
pub type AgentId = i64;

/// Problems turning a wire payload into a domain value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("unknown ticket status {0}")]
    UnknownStatus(String),

    #[error("unknown ticket priority {0}")]
    UnknownPriority(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

impl From<NormalizeError> for ApiError {
    fn from(err: NormalizeError) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// An enum value as the backend sends it: a numeric code or its name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WireCode {
    Code(i64),
    Name(String),
}

impl fmt::Display for WireCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireCode::Code(code) => write!(f, "{}", code),
            WireCode::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// Ticket lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "WireCode")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 3] = [
        TicketStatus::Open,
        TicketStatus::InProgress,
        TicketStatus::Resolved,
    ];

    /// Numeric code used on the wire.
    pub fn code(self) -> u8 {
        match self {
            TicketStatus::Open => 0,
            TicketStatus::InProgress => 1,
            TicketStatus::Resolved => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TicketStatus::Open),
            1 => Some(TicketStatus::InProgress),
            2 => Some(TicketStatus::Resolved),
            _ => None,
        }
    }

    /// Sort rank: Open < InProgress < Resolved.
    pub fn rank(self) -> u8 {
        self.code()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Open => "Open",
            TicketStatus::InProgress => "InProgress",
            TicketStatus::Resolved => "Resolved",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', '-', ' '], "").as_str() {
            "open" => Ok(TicketStatus::Open),
            "inprogress" => Ok(TicketStatus::InProgress),
            "resolved" => Ok(TicketStatus::Resolved),
            _ => Err(ApiError::Validation(format!(
                "unknown ticket status '{}'. Valid values: Open, InProgress, Resolved",
                s
            ))),
        }
    }
}

impl TryFrom<WireCode> for TicketStatus {
    type Error = NormalizeError;

    fn try_from(value: WireCode) -> Result<Self, Self::Error> {
        let parsed = match &value {
            WireCode::Code(code) => TicketStatus::from_code(*code),
            WireCode::Name(name) => name.parse().ok(),
        };
        parsed.ok_or_else(|| NormalizeError::UnknownStatus(value.to_string()))
    }
}

/// Ticket urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "WireCode")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TicketPriority {
    pub const ALL: [TicketPriority; 4] = [
        TicketPriority::Low,
        TicketPriority::Medium,
        TicketPriority::High,
        TicketPriority::Critical,
    ];

    pub fn code(self) -> u8 {
        match self {
            TicketPriority::Low => 0,
            TicketPriority::Medium => 1,
            TicketPriority::High => 2,
            TicketPriority::Critical => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TicketPriority::Low),
            1 => Some(TicketPriority::Medium),
            2 => Some(TicketPriority::High),
            3 => Some(TicketPriority::Critical),
            _ => None,
        }
    }

    /// Sort rank: Low < Medium < High < Critical.
    pub fn rank(self) -> u8 {
        self.code()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TicketPriority::Low => "Low",
            TicketPriority::Medium => "Medium",
            TicketPriority::High => "High",
            TicketPriority::Critical => "Critical",
        }
    }
}

impl fmt::Display for TicketPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketPriority {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(TicketPriority::Low),
            "medium" => Ok(TicketPriority::Medium),
            "high" => Ok(TicketPriority::High),
            "critical" => Ok(TicketPriority::Critical),
            _ => Err(ApiError::Validation(format!(
                "unknown ticket priority '{}'. Valid values: Low, Medium, High, Critical",
                s
            ))),
        }
    }
}

impl TryFrom<WireCode> for TicketPriority {
    type Error = NormalizeError;

    fn try_from(value: WireCode) -> Result<Self, Self::Error> {
        let parsed = match &value {
            WireCode::Code(code) => TicketPriority::from_code(*code),
            WireCode::Name(name) => name.parse().ok(),
        };
        parsed.ok_or_else(|| NormalizeError::UnknownPriority(value.to_string()))
    }
}

/// Parse a backend timestamp. Zone-less values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, NormalizeError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| NormalizeError::InvalidTimestamp(raw.to_string()))
}

fn wire_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

// --- Tickets ---

/// Ticket exactly as the backend may send it (REST body or push payload).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTicket {
    pub id: TicketId,
    pub title: String,
    pub description: Option<String>,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    #[serde(deserialize_with = "wire_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "wire_timestamp")]
    pub updated_at: DateTime<Utc>,
    pub agent_id: Option<AgentId>,
    pub agent_name: Option<String>,
}

/// A support ticket after normalization.
///
/// Invariant: `agent_id == None` implies `agent_name == None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawTicket")]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub agent_id: Option<AgentId>,
    pub agent_name: Option<String>,
}

/// Map a wire ticket to the domain shape.
///
/// Absent description becomes empty. An unassigned ticket never carries an
/// agent name, and a blank name is treated as absent.
pub fn normalize_ticket(raw: RawTicket) -> Ticket {
    let agent_name = match raw.agent_id {
        Some(_) => raw.agent_name.filter(|name| !name.trim().is_empty()),
        None => None,
    };

    Ticket {
        id: raw.id,
        title: raw.title,
        description: raw.description.unwrap_or_default(),
        status: raw.status,
        priority: raw.priority,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        agent_id: raw.agent_id,
        agent_name,
    }
}

impl From<RawTicket> for Ticket {
    fn from(raw: RawTicket) -> Self {
        normalize_ticket(raw)
    }
}

impl From<Ticket> for RawTicket {
    fn from(ticket: Ticket) -> Self {
        RawTicket {
            id: ticket.id,
            title: ticket.title,
            description: Some(ticket.description),
            status: ticket.status,
            priority: ticket.priority,
            created_at: ticket.created_at,
            updated_at: ticket.updated_at,
            agent_id: ticket.agent_id,
            agent_name: ticket.agent_name,
        }
    }
}

impl Ticket {
    pub fn is_assigned(&self) -> bool {
        self.agent_id.is_some()
    }
}

// --- Agents ---

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAgent {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(deserialize_with = "wire_timestamp")]
    pub created_at: DateTime<Utc>,
    /// Sent by the backend but not trusted; workloads are derived from tickets.
    #[serde(default)]
    pub ticket_ids: Vec<TicketId>,
}

/// A support agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawAgent")]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<RawAgent> for Agent {
    fn from(raw: RawAgent) -> Self {
        Agent {
            id: raw.id,
            name: raw.name,
            email: raw.email,
            is_active: raw.is_active,
            created_at: raw.created_at,
        }
    }
}

// --- Push payloads ---

/// Payload of `TicketStatusChanged`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub id: TicketId,
    pub status: TicketStatus,
    #[serde(default)]
    pub previous_status: Option<TicketStatus>,
}

/// Payload of `TicketDeleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    pub id: TicketId,
}

// --- Queries ---

/// Server-side filter for `GET /tickets`. `None` means unfiltered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TicketQuery {
    pub status: Option<TicketStatus>,
    pub priority: Option<TicketPriority>,
    pub search: Option<String>,
}

impl TicketQuery {
    /// The unfiltered list.
    pub fn all() -> Self {
        Self::default()
    }

    /// Canonical form: trimmed search, blank search dropped. Two queries that
    /// produce the same request normalize to the same value.
    pub fn normalized(self) -> Self {
        let search = self
            .search
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self { search, ..self }
    }

    pub fn is_unfiltered(&self) -> bool {
        self.clone().normalized() == Self::all()
    }

    /// Query-string parameters for this filter.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(status) = self.status {
            params.push(("status", status.to_string()));
        }
        if let Some(priority) = self.priority {
            params.push(("priority", priority.to_string()));
        }
        if let Some(search) = self.search.as_deref().map(str::trim) {
            if !search.is_empty() {
                params.push(("search", search.to_string()));
            }
        }
        params
    }
}

// --- Mutation inputs ---

fn require(field: &str, value: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::Validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

/// Input for creating a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketDraft {
    pub title: String,
    pub description: Option<String>,
    pub customer_email: String,
    pub priority: TicketPriority,
}

impl TicketDraft {
    pub fn new(
        title: impl Into<String>,
        customer_email: impl Into<String>,
        priority: TicketPriority,
    ) -> Self {
        Self {
            title: title.into(),
            description: None,
            customer_email: customer_email.into(),
            priority,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check required fields and build the request body.
    pub fn validate(&self) -> Result<CreateTicketBody, ApiError> {
        Ok(CreateTicketBody {
            title: require("title", &self.title)?,
            description: self.description.as_deref().map(|d| d.trim().to_string()),
            customer_email: require("customer email", &self.customer_email)?,
            priority: self.priority.code(),
        })
    }
}

/// Input for editing a ticket's text and priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketEdit {
    pub title: String,
    pub description: String,
    pub priority: TicketPriority,
}

impl TicketEdit {
    pub fn validate(&self) -> Result<UpdateTicketBody, ApiError> {
        Ok(UpdateTicketBody {
            title: require("title", &self.title)?,
            description: self.description.trim().to_string(),
            priority: self.priority.code(),
        })
    }
}

/// Input for creating an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDraft {
    pub name: String,
    pub email: String,
}

impl AgentDraft {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    pub fn validate(&self) -> Result<CreateAgentBody, ApiError> {
        Ok(CreateAgentBody {
            name: require("name", &self.name)?,
            email: require("email", &self.email)?,
        })
    }
}

// --- Wire request bodies ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTicketBody {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub customer_email: String,
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateTicketBody {
    pub title: String,
    pub description: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateStatusBody {
    pub status: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignBody {
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateAgentBody {
    pub name: String,
    pub email: String,
}
