use serde::Deserialize;

#[derive(Deserialize)]
pub(crate) struct Config {
    pub(crate) url: url::Url,

    #[serde(default = "default_database_pool_size")]
    pub(crate) pool_size: u32,
}

fn default_database_pool_size() -> u32 {
    // The bot, the scheduler and the payment watcher share the pool.
    // A couple of connections are left for ad-hoc administration.
    20
}
