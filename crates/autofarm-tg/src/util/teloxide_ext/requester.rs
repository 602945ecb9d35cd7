//! Rust analyzer is very slow on processing requester extension here, so extracted
//! it to a separate module to limit the scope of analysis.

use easy_ext::ext;
use teloxide::prelude::*;
use teloxide::requests::Requester;
use teloxide::types::Message;
use teloxide::utils::markdown;

/// There is [`RequesterExt`] in [`teloxide::prelude`]. We name this symbol
/// different to avoid collisions.
#[ext(UtilRequesterExt)]
pub(crate) impl<T: Requester> T {
    /// Reply to the message. The text must already be escaped for MarkdownV2.
    fn reply_md(&self, msg: &Message, text: impl Into<String>) -> Self::SendMessage {
        self.send_message(msg.chat.id, text)
            .reply_to_message_id(msg.id)
            .allow_sending_without_reply(true)
    }

    /// Same as [`Self::reply_md`], but escapes the plain text
    fn reply_plain(&self, msg: &Message, text: &str) -> Self::SendMessage {
        self.reply_md(msg, markdown::escape(text))
    }

    fn reply_help_md_escaped<Cmd: teloxide::utils::command::BotCommands>(
        &self,
        msg: &Message,
    ) -> Self::SendMessage {
        self.reply_plain(msg, &Cmd::descriptions().to_string())
    }
}
