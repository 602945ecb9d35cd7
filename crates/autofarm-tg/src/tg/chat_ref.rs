use crate::error::{err, UserError};
use crate::Result;
use std::str::FromStr;
use teloxide::types::{ChatId, Recipient};

/// Reference to a channel or a group typed by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChatRef {
    Id(ChatId),
    Username(String),
}

impl ChatRef {
    pub(crate) fn recipient(&self) -> Recipient {
        match self {
            ChatRef::Id(id) => Recipient::Id(*id),
            ChatRef::Username(username) => Recipient::ChannelUsername(format!("@{username}")),
        }
    }
}

impl FromStr for ChatRef {
    type Err = crate::Error;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();

        // Ids of users are positive, so only channels and groups are accepted
        if let Ok(id) = input.parse::<i64>() {
            if id < 0 {
                return Ok(ChatRef::Id(ChatId(id)));
            }
        }

        if let Some(username) = input.strip_prefix('@') {
            if lazy_regex::regex_is_match!(r"^[a-zA-Z]\w{3,31}$", username) {
                return Ok(ChatRef::Username(username.to_owned()));
            }
        }

        // Link to a message in a private channel. Their ids in the bot API
        // have the `-100` prefix.
        if let Some((_, id)) = lazy_regex::regex_captures!(
            r"^(?:https?://)?(?:www\.)?(?:t|telegram)\.me/c/(\d{1,15})(?:/\d+)?/?$",
            input
        ) {
            if let Ok(id) = format!("-100{id}").parse() {
                return Ok(ChatRef::Id(ChatId(id)));
            }
        }

        if let Some((_, username)) = lazy_regex::regex_captures!(
            r"^(?:https?://)?(?:www\.)?(?:t|telegram)\.me/([a-zA-Z]\w{3,31})(?:/\d+)?/?$",
            input
        ) {
            return Ok(ChatRef::Username(username.to_owned()));
        }

        Err(err!(UserError::InvalidChat {
            input: input.to_owned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn assert_parsed(input: &str, expected: ChatRef) {
        assert_eq!(input.parse::<ChatRef>().unwrap(), expected, "{input}");
    }

    #[track_caller]
    fn assert_invalid(input: &str) {
        let err = input.parse::<ChatRef>().unwrap_err();
        assert!(err.is_user_error(), "{input}: {err}");
    }

    fn username(name: &str) -> ChatRef {
        ChatRef::Username(name.to_owned())
    }

    #[test]
    fn parses_usernames() {
        assert_parsed("@rust_lang", username("rust_lang"));
        assert_parsed("  @rust_lang ", username("rust_lang"));
        assert_parsed("https://t.me/rust_lang", username("rust_lang"));
        assert_parsed("t.me/rust_lang/", username("rust_lang"));
        assert_parsed("https://telegram.me/rust_lang/1234", username("rust_lang"));
    }

    #[test]
    fn parses_ids() {
        assert_parsed("-1001234567890", ChatRef::Id(ChatId(-1001234567890)));
        assert_parsed("-4567", ChatRef::Id(ChatId(-4567)));
        assert_parsed(
            "https://t.me/c/1234567890/42",
            ChatRef::Id(ChatId(-1001234567890)),
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_invalid("");
        assert_invalid("12345");
        assert_invalid("rust_lang");
        assert_invalid("@ab");
        assert_invalid("@1abc");
        assert_invalid("https://example.com/rust_lang");
    }

    #[test]
    fn recipient_of_username_has_at_sign() {
        assert_eq!(
            username("rust_lang").recipient(),
            Recipient::ChannelUsername("@rust_lang".to_owned())
        );
    }
}
