mod requester;

use easy_ext::ext;
use teloxide::types::{Chat, UpdateKind, User};

pub(crate) mod prelude {
    pub(crate) use super::{
        requester::UtilRequesterExt as _, ChatExt as _, UpdateKindExt as _, UserExt as _,
    };
}

#[ext(UserExt)]
pub(crate) impl User {
    fn debug_id(&self) -> String {
        let name = self.username.clone().unwrap_or_else(|| self.full_name());
        format!("{name} ({})", self.id)
    }
}

#[ext(ChatExt)]
pub(crate) impl Chat {
    fn debug_id(&self) -> String {
        let title = self.title().unwrap_or("{unknown_chat_title}");
        let username = self
            .username()
            .map(|name| format!("@{name}, "))
            .unwrap_or_default();

        format!("{title} ({username}{})", self.id)
    }

    /// Name of the chat that is shown to the users in the lists of destinations
    fn display_name(&self) -> String {
        self.title()
            .map(ToOwned::to_owned)
            .or_else(|| self.username().map(|name| format!("@{name}")))
            .unwrap_or_else(|| self.id.to_string())
    }
}

#[ext(UpdateKindExt)]
pub(crate) impl UpdateKind {
    fn discriminator(&self) -> &'static str {
        macro_rules! stringify_enum {
            ($val:expr, $($variant:ident)*) => {
                match $val {$( UpdateKind::$variant(_) => stringify!($variant), )*}
            }
        }
        stringify_enum! {
            self,
            Message
            EditedMessage
            ChannelPost
            EditedChannelPost
            InlineQuery
            ChosenInlineResult
            CallbackQuery
            ShippingQuery
            PreCheckoutQuery
            Poll
            PollAnswer
            MyChatMember
            ChatMember
            ChatJoinRequest
            Error
        }
    }
}
