use serde::Deserialize;
use teloxide::types::{ChatId, UserId};

#[derive(Deserialize)]
pub(crate) struct Config {
    pub(crate) bot_token: String,

    /// User that has access to the maintainer commands
    pub(crate) maintainer: UserId,

    /// Private chat where the ad messages are copied to. The ads are
    /// copied from there by the workers, so all of them must be members
    /// of this chat.
    pub(crate) content_storage_chat: ChatId,
}
