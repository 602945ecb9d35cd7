use super::{Crypto, PaymentError};
use crate::error::err;
use crate::prelude::*;
use crate::{http, Result};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub(crate) trait PriceFeed: Send + Sync {
    /// Price of a single coin in USD
    async fn usd_price(&self, crypto: Crypto) -> Result<f64>;
}

pub(crate) struct CoinGecko {
    http: http::Client,
    api_url: url::Url,
}

impl CoinGecko {
    pub(crate) fn new(http: http::Client, api_url: url::Url) -> Self {
        Self { http, api_url }
    }
}

#[async_trait]
impl PriceFeed for CoinGecko {
    #[instrument(skip(self))]
    async fn usd_price(&self, crypto: Crypto) -> Result<f64> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|()| err!(PaymentError::InvalidApiUrl { url: self.api_url.to_string() }))?
            .pop_if_empty()
            .extend(["simple", "price"]);

        let id = crypto.coingecko_id();

        let prices: HashMap<String, HashMap<String, f64>> = self
            .http
            .get(url)
            .query(&[("ids", id), ("vs_currencies", "usd")])
            .read_json()
            .await?;

        let price = prices
            .get(id)
            .and_then(|prices| prices.get("usd"))
            .copied()
            .ok_or_else(|| err!(PaymentError::MissingPrice { crypto }))?;

        if !price.is_finite() || price <= 0.0 {
            return Err(err!(PaymentError::InvalidPrice { crypto, price }));
        }

        Ok(price)
    }
}

/// Price feed wrapper that remembers the prices for the configured TTL.
/// If the feed fails, the last known price is used regardless of its age.
pub(crate) struct PriceCache {
    feed: Box<dyn PriceFeed>,
    ttl: Duration,
    prices: SyncMutex<HashMap<Crypto, CachedPrice>>,
}

#[derive(Clone, Copy)]
struct CachedPrice {
    usd: f64,
    fetched_at: Instant,
}

impl PriceCache {
    pub(crate) fn new(feed: Box<dyn PriceFeed>, ttl: Duration) -> Self {
        Self {
            feed,
            ttl,
            prices: Default::default(),
        }
    }

    pub(crate) async fn usd_price(&self, crypto: Crypto) -> Result<f64> {
        let cached = self.prices.lock().get(&crypto).copied();

        if let Some(cached) = cached {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.usd);
            }
        }

        let err = match self.feed.usd_price(crypto).await {
            Ok(usd) => {
                let fresh = CachedPrice {
                    usd,
                    fetched_at: Instant::now(),
                };
                self.prices.lock().insert(crypto, fresh);
                return Ok(usd);
            }
            Err(err) => err,
        };

        let Some(stale) = cached else {
            return Err(err);
        };

        warn!(
            %crypto,
            price = stale.usd,
            age = tracing_duration(stale.fetched_at.elapsed()),
            err = tracing_err(&err),
            "Price feed failed, using the stale price"
        );

        Ok(stale.usd)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::fatal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Feed that returns the configured price or fails if it is `None`
    #[derive(Default)]
    pub(crate) struct FakeFeed {
        pub(crate) price: SyncMutex<Option<f64>>,
        pub(crate) calls: AtomicU32,
    }

    impl FakeFeed {
        pub(crate) fn with_price(price: f64) -> Arc<Self> {
            Arc::new(Self {
                price: SyncMutex::new(Some(price)),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl PriceFeed for Arc<FakeFeed> {
        async fn usd_price(&self, _crypto: Crypto) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let price = *self.price.lock();
            price.ok_or_else(|| fatal!("price feed is down"))
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn caches_price_for_ttl() {
        let feed = FakeFeed::with_price(5.0);
        let cache = PriceCache::new(Box::new(feed.clone()), Duration::from_secs(300));

        assert_eq!(cache.usd_price(Crypto::Ton).await.unwrap(), 5.0);

        *feed.price.lock() = Some(6.0);
        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.usd_price(Crypto::Ton).await.unwrap(), 5.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.usd_price(Crypto::Ton).await.unwrap(), 6.0);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn falls_back_to_stale_price() {
        let feed = FakeFeed::with_price(5.0);
        let cache = PriceCache::new(Box::new(feed.clone()), Duration::from_secs(300));

        assert_eq!(cache.usd_price(Crypto::Ton).await.unwrap(), 5.0);

        *feed.price.lock() = None;
        tokio::time::advance(Duration::from_secs(3600)).await;

        assert_eq!(cache.usd_price(Crypto::Ton).await.unwrap(), 5.0);
        assert!(cache.usd_price(Crypto::Btc).await.is_err());
    }
}
