use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duet_wire::{decode_sse_response, EventStream};
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Message, Role, SessionId};

/// Body of one outbound send.
#[derive(Debug, Clone, Serialize)]
pub struct SendRequest {
    pub session_id: Option<SessionId>,
    pub text: String,
}

/// Result of the non-streaming creation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SendOutcome {
    pub request_id: Option<Uuid>,
    #[serde(rename = "dialogue_session_id")]
    pub session_id: Option<SessionId>,
}

/// Server row for one persisted message, mapped into the engine's model.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRow {
    pub id: Uuid,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub partner_draft: Option<String>,
}

impl MessageRow {
    pub fn into_message(self) -> Message {
        let role = if self.role == "user" { Role::User } else { Role::Assistant };
        let mut message = Message {
            id: self.id,
            role,
            segments: Vec::new(),
            content: String::new(),
            tool_loading: false,
            created_at: self.created_at,
        };
        if !self.content.is_empty() {
            message = message.push_token(&self.content);
        }
        if let Some(draft) = self.partner_draft {
            message = message.push_partner_draft(&draft);
        }
        message
    }
}

/// Authenticated upstream for sends and history reads. Implemented over
/// HTTP in production and scripted in tests.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open the token stream for one send. The returned sequence is finite
    /// and not restartable.
    async fn open_stream(&self, request: &SendRequest, bearer: &str) -> Result<EventStream>;

    /// Non-streaming creation endpoint, used once by the fallback path.
    async fn post_once(&self, request: &SendRequest, bearer: &str) -> Result<SendOutcome>;

    /// Fetch the full persisted history of a session.
    async fn fetch_history(&self, session: SessionId, bearer: &str) -> Result<Vec<Message>>;
}

/// Access-token source. May fail or expire; treated as a send precondition.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;
}

/// Production transport over HTTP.
pub struct HttpChatTransport {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpChatTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.into(),
        })
    }

    fn bearer(token: &str) -> Result<HeaderValue> {
        HeaderValue::from_str(&format!("Bearer {}", token)).context("Invalid access token")
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open_stream(&self, request: &SendRequest, bearer: &str) -> Result<EventStream> {
        let response = self
            .http_client
            .post(format!("{}/dialogue/stream", self.base_url))
            .header(AUTHORIZATION, Self::bearer(bearer)?)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .json(request)
            .send()
            .await
            .context("Failed to open stream")?;

        Ok(decode_sse_response(response))
    }

    async fn post_once(&self, request: &SendRequest, bearer: &str) -> Result<SendOutcome> {
        let response = self
            .http_client
            .post(format!("{}/dialogue", self.base_url))
            .header(AUTHORIZATION, Self::bearer(bearer)?)
            .json(request)
            .send()
            .await
            .context("Non-streaming send failed")?
            .error_for_status()
            .context("Non-streaming send rejected")?;

        response
            .json::<SendOutcome>()
            .await
            .context("Failed to parse send outcome")
    }

    async fn fetch_history(&self, session: SessionId, bearer: &str) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = self
            .http_client
            .get(format!("{}/sessions/{}/messages", self.base_url, session))
            .header(AUTHORIZATION, Self::bearer(bearer)?)
            .send()
            .await
            .context("History request failed")?
            .error_for_status()
            .context("History request rejected")?
            .json()
            .await
            .context("Failed to parse history rows")?;

        Ok(rows.into_iter().map(MessageRow::into_message).collect())
    }
}
