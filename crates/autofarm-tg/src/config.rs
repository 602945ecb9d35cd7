use crate::{db, payments, posting, scheduler, tg, workers};
use serde::de::DeserializeOwned;

/// Configuration of the whole application. It is loaded once at the start
/// of the process from the environment variables.
pub struct Config {
    pub(crate) tg: tg::Config,
    pub(crate) db: db::Config,
    pub(crate) workers: workers::Config,
    pub(crate) posting: posting::Config,
    pub(crate) scheduler: scheduler::Config,
    pub(crate) payments: payments::Config,
}

impl Config {
    pub fn load_or_panic() -> Config {
        Self {
            tg: from_env_or_panic("TG_"),
            db: from_env_or_panic("DATABASE_"),
            workers: from_env_or_panic("WORKERS_"),
            posting: from_env_or_panic("POSTING_"),
            scheduler: from_env_or_panic("SCHEDULER_"),
            payments: from_env_or_panic("PAYMENTS_"),
        }
    }
}

pub(crate) fn from_env_or_panic<T: DeserializeOwned>(prefix: &str) -> T {
    envy::prefixed(prefix).from_env().unwrap_or_else(|err| {
        panic!(
            "BUG: Couldn't load config from environment for {}: {:#?}",
            std::any::type_name::<T>(),
            err
        );
    })
}
