mod ext;
mod macros;

use crate::prelude::*;
use crate::util::DynError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing_error::SpanTrace;

pub(crate) use ext::*;
pub(crate) use macros::*;

pub(crate) mod prelude {
    pub(crate) use super::ext::{OptionExt as _, ResultExt as _};
}

pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Describes any possible error that may happen in the application lifetime.
#[derive(Clone)]
pub struct Error {
    imp: Arc<ErrorImp>,
}

struct ErrorImp {
    /// Small identifier used for debugging purposes.
    /// It is mentioned in the chat when the error happens.
    /// This way we as developers can copy it and lookup the logs using this id.
    id: String,
    kind: ErrorKind,

    // Participates only in debug impl
    spantrace: SpanTrace,
}

#[derive(Error, Debug)]
pub(crate) enum ErrorKind {
    #[error(transparent)]
    User {
        #[from]
        source: UserError,
    },

    #[error(transparent)]
    HttpClient {
        #[from]
        source: crate::http::HttpClientError,
    },

    #[error(transparent)]
    Tg {
        #[from]
        source: teloxide::RequestError,
    },

    #[error(transparent)]
    Db {
        #[from]
        source: crate::db::DbError,
    },

    #[error(transparent)]
    Payment {
        #[from]
        source: crate::payments::PaymentError,
    },

    /// Unrecoverable kind of error, that is not supposed to happen, but when
    /// it happens we can't do anything reasonable about it, so no structural
    /// error handling is possible, this error is just propagated to the top.
    #[error("FATAL: {message}")]
    Fatal {
        message: String,
        source: Option<Box<DynError>>,
    },
}

impl From<sqlx::Error> for ErrorKind {
    fn from(err: sqlx::Error) -> Self {
        Self::Db { source: err.into() }
    }
}

impl From<sqlx_bat::Error> for ErrorKind {
    fn from(err: sqlx_bat::Error) -> Self {
        Self::Db { source: err.into() }
    }
}

/// Errors caused by the wrong input from the bot users. Their messages are
/// shown to the users as is.
#[derive(Debug, Error)]
pub(crate) enum UserError {
    #[error("You don't have an active subscription. Use /tiers to see the plans")]
    NoSubscription,

    #[error("Slot #{slot_number} doesn't exist. Use /slots to see your slots")]
    SlotNotFound { slot_number: i32 },

    #[error("Destination #{destination_id} doesn't exist in slot #{slot_number}")]
    DestinationNotFound {
        slot_number: i32,
        destination_id: i64,
    },

    #[error("This chat is already a destination of slot #{slot_number}")]
    DestinationAlreadyExists { slot_number: i32 },

    #[error("Couldn't recognize a chat in `{input}`. Use @username, a t.me link or a numeric chat id")]
    InvalidChat { input: String },

    #[error("Reply to the message that should be posted with this command")]
    NoReplyMessage,

    #[error("Only text, photo, video, animation and document messages can be posted")]
    UnsupportedContent,

    #[error("Posting interval must be at least {min_minutes} minutes")]
    IntervalTooShort { min_minutes: i32 },

    #[error("Unknown tier `{input}`. Use /tiers to see the plans")]
    UnknownTier { input: String },

    #[error("Unknown currency `{input}`. Supported: {supported}")]
    UnknownCrypto { input: String, supported: String },

    #[error("Payment `{payment_id}` was not found")]
    PaymentNotFound { payment_id: String },

    #[error("Invalid command arguments. Expected: {expected}")]
    InvalidArgs { expected: &'static str },
}

impl Error {
    pub(crate) fn id(&self) -> &str {
        &self.imp.id
    }

    /// Errors caused by interaction with the user.
    /// These are most likely caused by humanz sending wrong input.
    pub(crate) fn is_user_error(&self) -> bool {
        match &self.imp.kind {
            ErrorKind::User { .. } => true,
            ErrorKind::HttpClient { .. }
            | ErrorKind::Tg { .. }
            | ErrorKind::Db { .. }
            | ErrorKind::Payment { .. }
            | ErrorKind::Fatal { .. } => false,
        }
    }

    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.imp.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error (id: {}): {}", self.imp.id, self.imp.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.imp.kind.source()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)?;
        fmt::Display::fmt(&self.imp.spantrace, f)
    }
}

impl<T: Into<ErrorKind>> From<T> for Error {
    #[track_caller]
    fn from(kind: T) -> Self {
        let imp = ErrorImp {
            kind: kind.into(),
            id: nanoid::nanoid!(6),
            spantrace: SpanTrace::capture(),
        };

        let err = Self { imp: Arc::new(imp) };

        trace!(err = tracing_err(&err), "Created an error");

        err
    }
}
