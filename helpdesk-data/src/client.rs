use std::future::Future;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::HelpdeskConfig;
use crate::error::{ApiError, Result};
use crate::types::*;

/// Typed request functions against the help-desk backend.
///
/// Every response is normalized into domain types before it is returned.
pub trait HelpdeskApi: Send + Sync + 'static {
    fn list_tickets(&self, query: &TicketQuery) -> impl Future<Output = Result<Vec<Ticket>>> + Send;

    fn get_ticket(&self, id: TicketId) -> impl Future<Output = Result<Ticket>> + Send;

    fn create_ticket(&self, draft: &TicketDraft) -> impl Future<Output = Result<Ticket>> + Send;

    fn update_ticket(
        &self,
        id: TicketId,
        edit: &TicketEdit,
    ) -> impl Future<Output = Result<Ticket>> + Send;

    fn update_ticket_status(
        &self,
        id: TicketId,
        status: TicketStatus,
    ) -> impl Future<Output = Result<Ticket>> + Send;

    /// `None` unassigns the ticket.
    fn assign_ticket(
        &self,
        id: TicketId,
        agent_id: Option<AgentId>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_ticket(&self, id: TicketId) -> impl Future<Output = Result<()>> + Send;

    fn list_agents(&self) -> impl Future<Output = Result<Vec<Agent>>> + Send;

    fn create_agent(&self, draft: &AgentDraft) -> impl Future<Output = Result<Agent>> + Send;
}

/// `HelpdeskApi` over the REST contract rooted at `{base_url}/api`.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &HelpdeskConfig) -> Result<Self> {
        Self::new(&config.api_base_url, config.request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    /// Send a request and map non-2xx answers onto `ApiError`.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            warn!(request = %what, error = %e, "network error");
            ApiError::Network(e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(request = %what, status = status.as_u16(), "request succeeded");
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            debug!(request = %what, "not found");
            return Err(ApiError::NotFound(what.to_string()));
        }
        warn!(request = %what, status = status.as_u16(), "API error");
        Err(ApiError::Server {
            status: status.as_u16(),
            message: if message.is_empty() {
                status.canonical_reason().unwrap_or("unknown").to_string()
            } else {
                message
            },
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl HelpdeskApi for RestClient {
    async fn list_tickets(&self, query: &TicketQuery) -> Result<Vec<Ticket>> {
        let request = self.http.get(self.url("/tickets")).query(&query.params());
        let response = self.send(request, "list tickets").await?;
        Self::json(response).await
    }

    async fn get_ticket(&self, id: TicketId) -> Result<Ticket> {
        let request = self.http.get(self.url(&format!("/tickets/{}", id)));
        let response = self.send(request, &format!("ticket {}", id)).await?;
        Self::json(response).await
    }

    async fn create_ticket(&self, draft: &TicketDraft) -> Result<Ticket> {
        let body = draft.validate()?;
        let request = self.http.post(self.url("/tickets")).json(&body);
        let response = self.send(request, "create ticket").await?;
        Self::json(response).await
    }

    async fn update_ticket(&self, id: TicketId, edit: &TicketEdit) -> Result<Ticket> {
        let body = edit.validate()?;
        let request = self.http.put(self.url(&format!("/tickets/{}", id))).json(&body);
        let response = self.send(request, &format!("ticket {}", id)).await?;
        Self::json(response).await
    }

    async fn update_ticket_status(&self, id: TicketId, status: TicketStatus) -> Result<Ticket> {
        let body = UpdateStatusBody {
            status: status.code(),
        };
        let request = self
            .http
            .patch(self.url(&format!("/tickets/{}/status", id)))
            .json(&body);
        let response = self.send(request, &format!("ticket {}", id)).await?;
        Self::json(response).await
    }

    async fn assign_ticket(&self, id: TicketId, agent_id: Option<AgentId>) -> Result<()> {
        let request = self
            .http
            .patch(self.url(&format!("/tickets/{}/assign", id)))
            .json(&AssignBody { agent_id });
        // The backend gives no guarantee about the body, so it is ignored.
        self.send(request, &format!("ticket {}", id)).await?;
        Ok(())
    }

    async fn delete_ticket(&self, id: TicketId) -> Result<()> {
        let request = self.http.delete(self.url(&format!("/tickets/{}", id)));
        self.send(request, &format!("ticket {}", id)).await?;
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let request = self.http.get(self.url("/agents"));
        let response = self.send(request, "list agents").await?;
        Self::json(response).await
    }

    async fn create_agent(&self, draft: &AgentDraft) -> Result<Agent> {
        let body = draft.validate()?;
        let request = self.http.post(self.url("/agents")).json(&body);
        let response = self.send(request, "create agent").await?;
        Self::json(response).await
    }
}
