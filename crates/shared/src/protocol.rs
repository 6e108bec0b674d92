use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{Conversation, ConversationId, ConversationStatus, MessageId, Role, SectorId, Sender, UserId},
    error::{ApiError, ApiException, ErrorCode},
};

/// Auth payload sent as the first frame of every transport session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: String,
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Authenticate(AuthPayload),
    Join {
        room: String,
    },
    Leave {
        room: String,
    },
    Heartbeat {
        sent_at: DateTime<Utc>,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    MarkRead {
        conversation_id: ConversationId,
    },
}

impl ClientRequest {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientRequest::Authenticate(_) => "authenticate",
            ClientRequest::Join { .. } => "join",
            ClientRequest::Leave { .. } => "leave",
            ClientRequest::Heartbeat { .. } => "heartbeat",
            ClientRequest::Typing { .. } => "typing",
            ClientRequest::MarkRead { .. } => "mark_read",
        }
    }
}

/// A message as delivered by the server, before local stamping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    HeartbeatAck {
        #[serde(default)]
        server_time: Option<DateTime<Utc>>,
    },
    NewConversation {
        conversation: Conversation,
    },
    NewMessage {
        conversation_id: ConversationId,
        message: MessagePayload,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    ConversationUpdated {
        conversation: Conversation,
    },
    MessageRead {
        conversation_id: ConversationId,
        #[serde(default)]
        reader_id: Option<UserId>,
    },
    Error(ApiError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConversationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<SectorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_id: Option<SectorId>,
}

/// Uniform REST response wrapper: `{success, data|error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: ApiError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, ApiException> {
        if !self.success {
            let error = self
                .error
                .unwrap_or_else(|| ApiError::new(ErrorCode::Internal, "request failed"));
            return Err(ApiException::new(error.code, error.message));
        }
        self.data.ok_or_else(|| {
            ApiException::new(ErrorCode::Internal, "successful response without data")
        })
    }
}
