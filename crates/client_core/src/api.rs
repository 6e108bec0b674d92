use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Conversation, ConversationId, Message},
    protocol::{ApiEnvelope, ConversationFilters, SendMessageRequest, TransferTarget},
};
use tracing::debug;

/// REST surface of the conversation backend. Every response is wrapped in an
/// `ApiEnvelope`; implementations unwrap it and surface failures as errors.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self, filters: &ConversationFilters) -> Result<Vec<Conversation>>;
    async fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation>;
    async fn send_message(&self, conversation_id: &ConversationId, content: &str)
        -> Result<Message>;
    async fn transfer_conversation(
        &self,
        conversation_id: &ConversationId,
        target: &TransferTarget,
    ) -> Result<Conversation>;
    async fn finish_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation>;
    async fn archive_conversation(&self, conversation_id: &ConversationId)
        -> Result<Conversation>;
    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()>;
}

pub struct MissingConversationApi;

#[async_trait]
impl ConversationApi for MissingConversationApi {
    async fn list_conversations(&self, _filters: &ConversationFilters) -> Result<Vec<Conversation>> {
        Err(anyhow!("conversation api unavailable"))
    }

    async fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        Err(anyhow!(
            "conversation api unavailable; cannot load {conversation_id}"
        ))
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        _content: &str,
    ) -> Result<Message> {
        Err(anyhow!(
            "conversation api unavailable; cannot send to {conversation_id}"
        ))
    }

    async fn transfer_conversation(
        &self,
        conversation_id: &ConversationId,
        _target: &TransferTarget,
    ) -> Result<Conversation> {
        Err(anyhow!(
            "conversation api unavailable; cannot transfer {conversation_id}"
        ))
    }

    async fn finish_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        Err(anyhow!(
            "conversation api unavailable; cannot finish {conversation_id}"
        ))
    }

    async fn archive_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Conversation> {
        Err(anyhow!(
            "conversation api unavailable; cannot archive {conversation_id}"
        ))
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()> {
        Err(anyhow!(
            "conversation api unavailable; cannot mark {conversation_id} read"
        ))
    }
}

pub struct HttpConversationApi {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            token: token.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.token)
    }
}

async fn send_request(request: RequestBuilder, route: &str) -> Result<(reqwest::StatusCode, Vec<u8>)> {
    let response = request
        .send()
        .await
        .with_context(|| format!("{route}: request failed"))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .with_context(|| format!("{route}: failed to read response body"))?;
    debug!(route, status = status.as_u16(), "api: response");
    Ok((status, body.to_vec()))
}

/// Unwraps the envelope even on error statuses, since failures carry their
/// reason in the body.
async fn fetch<T: DeserializeOwned>(request: RequestBuilder, route: &str) -> Result<T> {
    let (status, body) = send_request(request, route).await?;
    let envelope: ApiEnvelope<T> = serde_json::from_slice(&body)
        .with_context(|| format!("{route}: unreadable response ({status})"))?;
    envelope
        .into_result()
        .with_context(|| format!("{route} failed"))
}

async fn acknowledge(request: RequestBuilder, route: &str) -> Result<()> {
    let (status, body) = send_request(request, route).await?;
    let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_slice(&body)
        .with_context(|| format!("{route}: unreadable response ({status})"))?;
    if envelope.success {
        return Ok(());
    }
    envelope
        .into_result()
        .map(|_| ())
        .with_context(|| format!("{route} failed"))
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(&self, filters: &ConversationFilters) -> Result<Vec<Conversation>> {
        fetch(self.get("/conversations").query(filters), "list conversations").await
    }

    async fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        fetch(
            self.get(&format!("/conversations/{conversation_id}")),
            "get conversation",
        )
        .await
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<Message> {
        fetch(
            self.post(&format!("/conversations/{conversation_id}/messages"))
                .json(&SendMessageRequest {
                    content: content.to_string(),
                }),
            "send message",
        )
        .await
    }

    async fn transfer_conversation(
        &self,
        conversation_id: &ConversationId,
        target: &TransferTarget,
    ) -> Result<Conversation> {
        fetch(
            self.post(&format!("/conversations/{conversation_id}/transfer"))
                .json(target),
            "transfer conversation",
        )
        .await
    }

    async fn finish_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        fetch(
            self.post(&format!("/conversations/{conversation_id}/finish")),
            "finish conversation",
        )
        .await
    }

    async fn archive_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Conversation> {
        fetch(
            self.post(&format!("/conversations/{conversation_id}/archive")),
            "archive conversation",
        )
        .await
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()> {
        acknowledge(
            self.post(&format!("/conversations/{conversation_id}/read")),
            "mark read",
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
