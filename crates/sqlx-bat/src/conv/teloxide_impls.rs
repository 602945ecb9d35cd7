use crate::{DbRepresentable, IntoDb, TryFromDbImp, TryIntoDbImp};
use std::convert::Infallible;
use std::num::TryFromIntError;
use teloxide::types::{ChatId, MessageId, UserId};

impl DbRepresentable for ChatId {
    type DbRepr = i64;
}

impl IntoDb for ChatId {
    fn into_db(self) -> i64 {
        self.0
    }
}

impl TryFromDbImp for ChatId {
    type Err = Infallible;

    fn try_from_db_imp(db_val: i64) -> Result<Self, Infallible> {
        Ok(ChatId(db_val))
    }
}

// Telegram user ids are positive and fit into 52 bits, but the API type is `u64`
impl DbRepresentable for UserId {
    type DbRepr = i64;
}

impl TryIntoDbImp for UserId {
    type Err = TryFromIntError;

    fn try_into_db_imp(self) -> Result<i64, TryFromIntError> {
        self.0.try_into()
    }
}

impl TryFromDbImp for UserId {
    type Err = TryFromIntError;

    fn try_from_db_imp(db_val: i64) -> Result<Self, TryFromIntError> {
        db_val.try_into().map(UserId)
    }
}

impl DbRepresentable for MessageId {
    type DbRepr = i32;
}

impl IntoDb for MessageId {
    fn into_db(self) -> i32 {
        self.0
    }
}

impl TryFromDbImp for MessageId {
    type Err = Infallible;

    fn try_from_db_imp(db_val: i32) -> Result<Self, Infallible> {
        Ok(MessageId(db_val))
    }
}
