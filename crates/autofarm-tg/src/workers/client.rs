use super::WorkerId;
use crate::posting::AdContent;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::{ApiError, RequestError};

/// Messaging session of a single worker account
#[async_trait]
pub(crate) trait WorkerClient: Send + Sync {
    async fn send(&self, chat: ChatId, content: &AdContent) -> Result<(), SendError>;
}

/// Classification of the errors returned by the messaging API that
/// the worker pool reacts to differently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum SendError {
    #[error("Flood wait for {0:?}")]
    FloodWait(Duration),

    /// The worker can't post to this particular chat anymore
    #[error("Banned in the chat: {0}")]
    BannedInChat(String),

    /// The worker can't post anywhere anymore
    #[error("Worker account is unusable: {0}")]
    Revoked(String),

    #[error("{0}")]
    Other(String),
}

impl SendError {
    pub(crate) fn from_request_error(err: RequestError) -> Self {
        match err {
            RequestError::RetryAfter(wait) => Self::FloodWait(wait),
            RequestError::Api(api_err) => Self::from_api_error(api_err),
            other => Self::Other(other.to_string()),
        }
    }

    fn from_api_error(err: ApiError) -> Self {
        let message = err.to_string();
        match err {
            ApiError::BotBlocked
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::CantInitiateConversation
            | ApiError::UserDeactivated => Self::BannedInChat(message),
            // The bot API responds with `Unauthorized` to a revoked token
            ApiError::NotFound => Self::Revoked(message),
            // Also returned when the worker can't access the content storage
            // chat, so it says nothing about the destination
            ApiError::ChatNotFound => Self::Other(message),
            ApiError::Unknown(description) if is_write_forbidden(&description) => {
                Self::BannedInChat(description)
            }
            ApiError::Unknown(description) => Self::Other(description),
            _ => Self::Other(message),
        }
    }
}

fn is_write_forbidden(description: &str) -> bool {
    lazy_regex::regex_is_match!(
        r"(?i)CHAT_WRITE_FORBIDDEN|not enough rights|have no rights|was kicked|is deactivated",
        description
    )
}

/// Worker that posts via a separate bot token. The bot must be a member
/// of the content storage chat, because the ads are copied from there.
pub(crate) struct TgWorkerClient {
    bot: Bot,
    content_storage_chat: ChatId,
}

impl TgWorkerClient {
    pub(crate) fn new(token: String, content_storage_chat: ChatId) -> Self {
        Self {
            bot: Bot::with_client(token, teloxide::net::client_from_env()),
            content_storage_chat,
        }
    }
}

/// Creates the clients for the configured tokens. Worker ids are the 1-based
/// positions of the tokens.
pub(crate) fn tg_worker_clients(
    tokens: &[String],
    content_storage_chat: ChatId,
) -> BTreeMap<WorkerId, Arc<dyn WorkerClient>> {
    (1..)
        .zip(tokens)
        .map(|(id, token)| {
            let client: Arc<dyn WorkerClient> =
                Arc::new(TgWorkerClient::new(token.clone(), content_storage_chat));
            (WorkerId(id), client)
        })
        .collect()
}

#[async_trait]
impl WorkerClient for TgWorkerClient {
    async fn send(&self, chat: ChatId, content: &AdContent) -> Result<(), SendError> {
        let result = match content.storage_message_id {
            Some(message_id) => self
                .bot
                .copy_message(chat, self.content_storage_chat, message_id)
                .await
                .map(drop),
            None => self.bot.send_message(chat, &content.text).await.map(drop),
        };

        result.map_err(SendError::from_request_error)
    }
}
