//! Subscriptions paid with cryptocurrency. The payments are verified by
//! polling the public block explorers for the incoming transactions.

mod explorer;
mod matching;
mod price;
mod tier;

use crate::error::{err, UserError};
use crate::observability::metrics;
use crate::prelude::*;
use crate::{http, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use itertools::Itertools;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use teloxide::types::UserId;

pub(crate) use explorer::*;
pub(crate) use matching::*;
pub(crate) use price::*;
pub(crate) use tier::*;

/// Characters of the payment ids. They are typed by humans into the
/// transaction comments, so the ambiguous ones are excluded.
const PAYMENT_ID_ALPHABET: [char; 32] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'J', 'K', 'L', 'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z', '2', '3', '4', '5', '6', '7', '8', '9',
];

#[serde_as]
#[derive(Deserialize)]
pub(crate) struct Config {
    pub(crate) ton_address: String,

    #[serde(default)]
    pub(crate) btc_address: Option<String>,

    #[serde(default)]
    pub(crate) ltc_address: Option<String>,

    /// For how long the payment request waits for the transaction
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_payment_ttl")]
    pub(crate) payment_ttl: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_price_cache_ttl")]
    pub(crate) price_cache_ttl: Duration,

    #[serde(default = "default_subscription_days")]
    pub(crate) subscription_days: i64,

    #[serde(default = "default_coingecko_url")]
    pub(crate) coingecko_url: url::Url,

    #[serde(default = "default_toncenter_url")]
    pub(crate) toncenter_url: url::Url,

    #[serde(default)]
    pub(crate) toncenter_api_key: Option<String>,

    #[serde(default = "default_btc_esplora_url")]
    pub(crate) btc_esplora_url: url::Url,

    #[serde(default = "default_ltc_esplora_url")]
    pub(crate) ltc_esplora_url: url::Url,

    /// Number of the most recent transactions to inspect
    #[serde(default = "default_explorer_tx_limit")]
    pub(crate) explorer_tx_limit: u32,
}

fn default_payment_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_price_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_subscription_days() -> i64 {
    30
}

fn default_explorer_tx_limit() -> u32 {
    50
}

fn parse_default_url(url: &str) -> url::Url {
    url.parse()
        .unwrap_or_else(|err| panic!("BUG: invalid default url `{url}`: {err}"))
}

fn default_coingecko_url() -> url::Url {
    parse_default_url("https://api.coingecko.com/api/v3/")
}

fn default_toncenter_url() -> url::Url {
    parse_default_url("https://toncenter.com/api/v2/")
}

fn default_btc_esplora_url() -> url::Url {
    parse_default_url("https://blockstream.info/api/")
}

fn default_ltc_esplora_url() -> url::Url {
    parse_default_url("https://litecoinspace.org/api/")
}

impl Config {
    pub(crate) fn address_for(&self, crypto: Crypto) -> Option<&str> {
        match crypto {
            Crypto::Ton => Some(&self.ton_address),
            Crypto::Btc => self.btc_address.as_deref(),
            Crypto::Ltc => self.ltc_address.as_deref(),
        }
    }

    pub(crate) fn supported_cryptos(&self) -> Vec<Crypto> {
        Crypto::iter()
            .filter(|&crypto| self.address_for(crypto).is_some())
            .collect()
    }

    pub(crate) fn subscription_length(&self) -> chrono::Duration {
        chrono::Duration::days(self.subscription_days)
    }

    fn explorer_config(&self) -> ExplorerConfig {
        ExplorerConfig {
            toncenter_url: self.toncenter_url.clone(),
            toncenter_api_key: self.toncenter_api_key.clone(),
            btc_esplora_url: self.btc_esplora_url.clone(),
            ltc_esplora_url: self.ltc_esplora_url.clone(),
            tx_limit: self.explorer_tx_limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub(crate) struct PaymentId(pub(crate) String);

sqlx_bat::impl_into_db_via_newtype!(PaymentId(String));

impl PaymentId {
    fn generate() -> Self {
        Self(nanoid::nanoid!(10, &PAYMENT_ID_ALPHABET))
    }

    /// Normalizes the id typed by the user
    pub(crate) fn parse(input: &str) -> Self {
        Self(input.trim().to_uppercase())
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize, strum::IntoStaticStr,
)]
#[repr(i16)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum PaymentStatus {
    Pending = 0,
    Completed = 1,
    Expired = 2,
}

sqlx_bat::impl_try_into_from_db_via_std!(PaymentStatus, i16);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Payment {
    /// Also serves as the memo the user puts into the transaction comment
    pub(crate) id: PaymentId,
    pub(crate) user_id: UserId,
    pub(crate) tier: Tier,
    pub(crate) crypto: Crypto,
    pub(crate) amount_crypto: f64,
    pub(crate) amount_usd: f64,
    pub(crate) pay_to_address: String,
    pub(crate) status: PaymentStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) tx_hash: Option<String>,
}

impl Payment {
    fn expectation(&self) -> Expectation<'_> {
        Expectation {
            amount: self.amount_crypto,
            memo: &self.id.0,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Everything needed to complete the payment and activate the subscription
/// in a single transaction
#[derive(Debug)]
pub(crate) struct Completion<'a> {
    pub(crate) payment: &'a Payment,
    pub(crate) tx_hash: Option<&'a str>,
    pub(crate) completed_at: DateTime<Utc>,
    pub(crate) subscription_length: chrono::Duration,
}

/// New expiry of the subscription. The purchased period is added on top of
/// the remaining time of the unexpired subscription.
pub(crate) fn stacked_expiry(
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    length: chrono::Duration,
) -> DateTime<Utc> {
    current.filter(|&current| current > now).unwrap_or(now) + length
}

#[async_trait]
pub(crate) trait PaymentStore: Send + Sync {
    async fn insert_payment(&self, payment: &Payment) -> Result;

    async fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>>;

    async fn pending_payments(&self) -> Result<Vec<Payment>>;

    /// Returns the subset of the given hashes that already completed some payment
    async fn claimed_tx_hashes(&self, hashes: &[String]) -> Result<HashSet<String>>;

    /// Moves the payment from pending to expired. Returns `false` if it
    /// wasn't pending.
    async fn expire_payment(&self, id: &PaymentId) -> Result<bool>;

    /// Expires all pending payments whose time is up
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Moves the payment from pending to completed and activates the
    /// subscription with its ad slots atomically. Returns the new expiry of the
    /// subscription or `None` if the payment wasn't pending or the transaction
    /// was already claimed.
    async fn complete_payment(&self, completion: &Completion<'_>) -> Result<Option<DateTime<Utc>>>;
}

/// Receives the news about the activated subscriptions
#[async_trait]
pub(crate) trait SubscriptionListener: Send + Sync {
    async fn on_subscription_activated(&self, payment: &Payment, expires_at: DateTime<Utc>);
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct PendingReport {
    pub(crate) checked: u32,
    pub(crate) completed: u32,
    pub(crate) expired: u64,
    pub(crate) errors: u32,
}

/// Errors of the payment processing that are not caused by the users
#[derive(Debug, thiserror::Error)]
pub(crate) enum PaymentError {
    #[error("Price feed didn't return the price of {crypto}")]
    MissingPrice { crypto: Crypto },

    #[error("Price feed returned an invalid price of {crypto}: {price}")]
    InvalidPrice { crypto: Crypto, price: f64 },

    #[error("Price of {crypto} is too high, the payment amount rounds to zero: ${usd_per_coin}")]
    AmountRoundsToZero { crypto: Crypto, usd_per_coin: f64 },

    #[error("Block explorer returned an error: {message}")]
    Explorer { message: String },

    #[error("API url `{url}` can't be a base url")]
    InvalidApiUrl { url: String },
}

pub(crate) struct PaymentProcessor {
    store: Arc<dyn PaymentStore>,
    prices: PriceCache,
    explorer: Arc<dyn Explorer>,
    listener: Option<Arc<dyn SubscriptionListener>>,
    cfg: Config,
}

impl PaymentProcessor {
    pub(crate) fn new(
        store: Arc<dyn PaymentStore>,
        prices: PriceCache,
        explorer: Arc<dyn Explorer>,
        cfg: Config,
    ) -> Self {
        Self {
            store,
            prices,
            explorer,
            listener: None,
            cfg,
        }
    }

    /// Processor that uses the public price feed and block explorers
    pub(crate) fn from_config(store: Arc<dyn PaymentStore>, http: http::Client, cfg: Config) -> Self {
        let feed = CoinGecko::new(http.clone(), cfg.coingecko_url.clone());
        let prices = PriceCache::new(Box::new(feed), cfg.price_cache_ttl);
        let explorer = BlockExplorers::new(http, cfg.explorer_config());
        Self::new(store, prices, Arc::new(explorer), cfg)
    }

    pub(crate) fn with_listener(mut self, listener: Arc<dyn SubscriptionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// Creates a pending payment for the tier with the price converted
    /// to the chosen currency at the current rate
    #[instrument(skip(self))]
    pub(crate) async fn create_payment(&self, user: UserId, tier: Tier, crypto: Crypto) -> Result<Payment> {
        let address = self.cfg.address_for(crypto).ok_or_else(|| {
            err!(UserError::UnknownCrypto {
                input: crypto.to_string(),
                supported: self.cfg.supported_cryptos().iter().join(", "),
            })
        })?;

        let usd_per_coin = self.prices.usd_price(crypto).await?;

        let amount_usd = tier.price_usd();
        let amount_crypto = crypto.amount_for_usd(amount_usd, usd_per_coin);

        if amount_crypto <= 0.0 {
            return Err(err!(PaymentError::AmountRoundsToZero { crypto, usd_per_coin }));
        }

        let now = Utc::now();

        let payment = Payment {
            id: PaymentId::generate(),
            user_id: user,
            tier,
            crypto,
            amount_crypto,
            amount_usd,
            pay_to_address: address.to_owned(),
            status: PaymentStatus::Pending,
            created_at: now,
            expires_at: now + crate::workers::to_chrono(self.cfg.payment_ttl),
            completed_at: None,
            tx_hash: None,
        };

        self.store.insert_payment(&payment).await?;

        metrics::payments_total("created").increment(1);

        info!(
            payment = %payment.id,
            amount = payment.amount_crypto,
            usd_per_coin,
            "Created payment"
        );

        Ok(payment)
    }

    pub(crate) async fn get_payment(&self, id: &PaymentId) -> Result<Payment> {
        self.store
            .get_payment(id)
            .await?
            .ok_or_else(|| err!(UserError::PaymentNotFound { payment_id: id.to_string() }))
    }

    /// Checks if the payment was received. Returns `true` if the payment is
    /// completed.
    #[instrument(skip(self), fields(payment = %id))]
    pub(crate) async fn verify_payment(&self, id: &PaymentId) -> Result<bool> {
        let payment = self.get_payment(id).await?;

        match payment.status {
            PaymentStatus::Completed => return Ok(true),
            PaymentStatus::Expired => return Ok(false),
            PaymentStatus::Pending => {}
        }

        if Utc::now() > payment.expires_at {
            if self.store.expire_payment(id).await? {
                metrics::payments_total("expired").increment(1);
                info!("Payment expired");
            }
            return Ok(false);
        }

        let txs = self
            .explorer
            .incoming_transactions(payment.crypto, &payment.pay_to_address)
            .await?;

        let hashes: Vec<_> = txs.iter().map(|tx| tx.hash.clone()).collect();
        let claimed = self.store.claimed_tx_hashes(&hashes).await?;

        let Some((tx, kind)) = payment.expectation().find_match(&txs, &claimed) else {
            debug!(txs = txs.len(), "No matching transaction yet");
            return Ok(false);
        };

        info!(
            tx = %tx.hash,
            ?kind,
            received = tx.amount,
            expected = payment.amount_crypto,
            "Found the transaction for the payment"
        );

        if self.process_successful_payment(id, Some(&tx.hash)).await? {
            return Ok(true);
        }

        // Someone else may have completed it in the meantime
        let payment = self.get_payment(id).await?;
        Ok(payment.status == PaymentStatus::Completed)
    }

    /// Completes the payment and activates the subscription. Returns `false`
    /// if the payment was already completed or can't be completed, so that
    /// calling it several times activates the subscription only once.
    #[instrument(skip(self), fields(payment = %id))]
    pub(crate) async fn process_successful_payment(&self, id: &PaymentId, tx_hash: Option<&str>) -> Result<bool> {
        let payment = self.get_payment(id).await?;

        if payment.status == PaymentStatus::Completed {
            info!("Payment is already completed");
            return Ok(false);
        }

        let completion = Completion {
            payment: &payment,
            tx_hash,
            completed_at: Utc::now(),
            subscription_length: self.cfg.subscription_length(),
        };

        let Some(expires_at) = self.store.complete_payment(&completion).await? else {
            info!(status = ?payment.status, "Payment was not completed, it is not pending anymore or the transaction was already claimed");
            return Ok(false);
        };

        metrics::payments_total("completed").increment(1);

        info!(
            user = payment.user_id.0,
            tier = %payment.tier,
            %expires_at,
            "Subscription activated"
        );

        if let Some(listener) = &self.listener {
            listener.on_subscription_activated(&payment, expires_at).await;
        }

        Ok(true)
    }

    /// Expires the pending payments whose time is up
    pub(crate) async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = self.store.expire_overdue(now).await?;
        if expired > 0 {
            metrics::payments_total("expired").increment(expired);
            info!(expired, "Expired overdue payments");
        }
        Ok(expired)
    }

    /// Verifies all pending payments
    #[instrument(skip(self))]
    pub(crate) async fn verify_pending(&self) -> Result<PendingReport> {
        let mut report = PendingReport {
            expired: self.expire_overdue(Utc::now()).await?,
            ..Default::default()
        };

        for payment in self.store.pending_payments().await? {
            report.checked += 1;
            match self.verify_payment(&payment.id).await {
                Ok(true) => report.completed += 1,
                Ok(false) => {}
                Err(err) => {
                    report.errors += 1;
                    warn!(
                        payment = %payment.id,
                        err = tracing_err(&err),
                        "Failed to verify the payment"
                    );
                }
            }
        }

        if report.checked > 0 {
            debug!(?report, "Verified pending payments");
        }

        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::price::tests::FakeFeed;
    use super::*;
    use crate::error::ErrorKind;
    use assert_matches::assert_matches;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub(crate) struct InMemoryPaymentStore {
        pub(crate) payments: SyncMutex<HashMap<PaymentId, Payment>>,
        subscriptions: SyncMutex<HashMap<UserId, (Tier, DateTime<Utc>)>>,
        activations: SyncMutex<u32>,
    }

    #[async_trait]
    impl PaymentStore for InMemoryPaymentStore {
        async fn insert_payment(&self, payment: &Payment) -> Result {
            self.payments
                .lock()
                .insert(payment.id.clone(), payment.clone());
            Ok(())
        }

        async fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>> {
            Ok(self.payments.lock().get(id).cloned())
        }

        async fn pending_payments(&self) -> Result<Vec<Payment>> {
            Ok(self
                .payments
                .lock()
                .values()
                .filter(|payment| payment.status == PaymentStatus::Pending)
                .cloned()
                .collect())
        }

        async fn claimed_tx_hashes(&self, hashes: &[String]) -> Result<HashSet<String>> {
            Ok(self
                .payments
                .lock()
                .values()
                .filter_map(|payment| payment.tx_hash.clone())
                .filter(|hash| hashes.contains(hash))
                .collect())
        }

        async fn expire_payment(&self, id: &PaymentId) -> Result<bool> {
            let mut payments = self.payments.lock();
            let Some(payment) = payments.get_mut(id) else {
                return Ok(false);
            };
            if payment.status != PaymentStatus::Pending {
                return Ok(false);
            }
            payment.status = PaymentStatus::Expired;
            Ok(true)
        }

        async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
            let mut expired = 0;
            for payment in self.payments.lock().values_mut() {
                if payment.status == PaymentStatus::Pending && payment.expires_at < now {
                    payment.status = PaymentStatus::Expired;
                    expired += 1;
                }
            }
            Ok(expired)
        }

        async fn complete_payment(&self, completion: &Completion<'_>) -> Result<Option<DateTime<Utc>>> {
            let mut payments = self.payments.lock();

            if let Some(tx_hash) = completion.tx_hash {
                if payments
                    .values()
                    .any(|payment| payment.tx_hash.as_deref() == Some(tx_hash))
                {
                    return Ok(None);
                }
            }

            let Some(payment) = payments.get_mut(&completion.payment.id) else {
                return Ok(None);
            };
            if payment.status != PaymentStatus::Pending {
                return Ok(None);
            }

            payment.status = PaymentStatus::Completed;
            payment.completed_at = Some(completion.completed_at);
            payment.tx_hash = completion.tx_hash.map(ToOwned::to_owned);

            let mut subscriptions = self.subscriptions.lock();
            let current = subscriptions.get(&payment.user_id).map(|(_, until)| *until);
            let expires_at = stacked_expiry(
                current,
                completion.completed_at,
                completion.subscription_length,
            );
            subscriptions.insert(payment.user_id, (payment.tier, expires_at));
            *self.activations.lock() += 1;

            Ok(Some(expires_at))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeExplorer {
        txs: SyncMutex<Vec<IncomingTx>>,
    }

    #[async_trait]
    impl Explorer for FakeExplorer {
        async fn incoming_transactions(&self, _crypto: Crypto, _address: &str) -> Result<Vec<IncomingTx>> {
            Ok(self.txs.lock().clone())
        }
    }

    pub(crate) struct Fixture {
        pub(crate) store: Arc<InMemoryPaymentStore>,
        pub(crate) explorer: Arc<FakeExplorer>,
        pub(crate) processor: PaymentProcessor,
    }

    fn cfg() -> Config {
        Config {
            ton_address: "EQours".to_owned(),
            btc_address: None,
            ltc_address: None,
            payment_ttl: Duration::from_secs(30 * 60),
            price_cache_ttl: Duration::from_secs(5 * 60),
            subscription_days: 30,
            coingecko_url: default_coingecko_url(),
            toncenter_url: default_toncenter_url(),
            toncenter_api_key: None,
            btc_esplora_url: default_btc_esplora_url(),
            ltc_esplora_url: default_ltc_esplora_url(),
            explorer_tx_limit: 50,
        }
    }

    pub(crate) fn fixture() -> Fixture {
        let store = Arc::new(InMemoryPaymentStore::default());
        let explorer = Arc::new(FakeExplorer::default());
        let prices = PriceCache::new(
            Box::new(FakeFeed::with_price(5.0)),
            Duration::from_secs(300),
        );
        let processor = PaymentProcessor::new(store.clone(), prices, explorer.clone(), cfg());
        Fixture {
            store,
            explorer,
            processor,
        }
    }

    fn incoming(hash: &str, amount: f64, memo: Option<&PaymentId>) -> IncomingTx {
        IncomingTx {
            hash: hash.to_owned(),
            amount,
            memo: memo.map(|id| id.0.clone()),
            timestamp: Utc::now(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn creates_payment_in_crypto() {
        let Fixture { processor, store, .. } = fixture();

        let payment = processor
            .create_payment(UserId(7), Tier::Basic, Crypto::Ton)
            .await
            .unwrap();

        assert_eq!(payment.amount_crypto, 3.0);
        assert_eq!(payment.amount_usd, 15.0);
        assert_eq!(payment.pay_to_address, "EQours");
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.expires_at - payment.created_at, chrono::Duration::minutes(30));
        assert_eq!(payment.id.0.len(), 10);
        assert!(store.payments.lock().contains_key(&payment.id));
    }

    #[test_log::test(tokio::test)]
    async fn refuses_payment_that_rounds_to_zero() {
        let store = Arc::new(InMemoryPaymentStore::default());
        let prices = PriceCache::new(Box::new(FakeFeed::with_price(1e9)), Duration::from_secs(300));
        let processor = PaymentProcessor::new(
            store.clone(),
            prices,
            Arc::new(FakeExplorer::default()),
            cfg(),
        );

        let err = processor
            .create_payment(UserId(7), Tier::Basic, Crypto::Ton)
            .await
            .unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::Payment {
                source: PaymentError::AmountRoundsToZero { .. }
            }
        );
        assert!(store.payments.lock().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn rejects_unconfigured_crypto() {
        let Fixture { processor, .. } = fixture();

        let err = processor
            .create_payment(UserId(7), Tier::Basic, Crypto::Btc)
            .await
            .unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::User {
                source: UserError::UnknownCrypto { .. }
            }
        );
        assert_eq!(processor.cfg().supported_cryptos(), [Crypto::Ton]);
    }

    #[test_log::test(tokio::test)]
    async fn completes_payment_with_exact_amount() {
        let Fixture {
            processor,
            store,
            explorer,
        } = fixture();

        let payment = processor
            .create_payment(UserId(7), Tier::Pro, Crypto::Ton)
            .await
            .unwrap();

        assert!(!processor.verify_payment(&payment.id).await.unwrap());

        explorer
            .txs
            .lock()
            .push(incoming("tx-1", payment.amount_crypto, None));

        assert!(processor.verify_payment(&payment.id).await.unwrap());
        assert!(processor.verify_payment(&payment.id).await.unwrap());

        let saved = store.payments.lock()[&payment.id].clone();
        assert_eq!(saved.status, PaymentStatus::Completed);
        assert_eq!(saved.tx_hash.as_deref(), Some("tx-1"));
        assert_eq!(*store.activations.lock(), 1);
        assert_eq!(store.subscriptions.lock()[&UserId(7)].0, Tier::Pro);
    }

    #[test_log::test(tokio::test)]
    async fn processing_twice_activates_once() {
        let Fixture { processor, store, .. } = fixture();

        let payment = processor
            .create_payment(UserId(7), Tier::Basic, Crypto::Ton)
            .await
            .unwrap();

        assert!(processor
            .process_successful_payment(&payment.id, Some("tx-1"))
            .await
            .unwrap());
        assert!(!processor
            .process_successful_payment(&payment.id, Some("tx-1"))
            .await
            .unwrap());

        assert_eq!(*store.activations.lock(), 1);

        let (_, expires_at) = store.subscriptions.lock()[&UserId(7)];
        let remaining = expires_at - Utc::now();
        assert!(remaining <= chrono::Duration::days(30), "{remaining}");
        assert!(remaining > chrono::Duration::days(29), "{remaining}");
    }

    #[test_log::test(tokio::test)]
    async fn loose_match_without_memo_is_rejected() {
        let Fixture {
            processor,
            explorer,
            ..
        } = fixture();

        let payment = processor
            .create_payment(UserId(7), Tier::Basic, Crypto::Ton)
            .await
            .unwrap();

        // 7% more than expected
        explorer.txs.lock().push(incoming("tx-1", 3.21, None));
        assert!(!processor.verify_payment(&payment.id).await.unwrap());

        explorer
            .txs
            .lock()
            .push(incoming("tx-2", 3.21, Some(&payment.id)));
        assert!(processor.verify_payment(&payment.id).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn transaction_pays_for_one_payment_only() {
        let Fixture {
            processor,
            explorer,
            ..
        } = fixture();

        let first = processor
            .create_payment(UserId(7), Tier::Basic, Crypto::Ton)
            .await
            .unwrap();
        let second = processor
            .create_payment(UserId(8), Tier::Basic, Crypto::Ton)
            .await
            .unwrap();

        explorer.txs.lock().push(incoming("tx-1", 3.0, None));

        assert!(processor.verify_payment(&first.id).await.unwrap());
        assert!(!processor.verify_payment(&second.id).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn overdue_payment_expires() {
        let Fixture {
            processor,
            store,
            explorer,
        } = fixture();

        let mut payment = processor
            .create_payment(UserId(7), Tier::Basic, Crypto::Ton)
            .await
            .unwrap();

        payment.created_at -= chrono::Duration::hours(1);
        payment.expires_at -= chrono::Duration::hours(1);
        store.insert_payment(&payment).await.unwrap();

        explorer.txs.lock().push(incoming("tx-1", 3.0, None));

        assert!(!processor.verify_payment(&payment.id).await.unwrap());
        assert_eq!(
            store.payments.lock()[&payment.id].status,
            PaymentStatus::Expired
        );
        assert!(!processor.verify_payment(&payment.id).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn verify_pending_reports_progress() {
        let Fixture {
            processor,
            store,
            explorer,
        } = fixture();

        let paid = processor
            .create_payment(UserId(7), Tier::Basic, Crypto::Ton)
            .await
            .unwrap();
        processor
            .create_payment(UserId(8), Tier::Enterprise, Crypto::Ton)
            .await
            .unwrap();

        let mut overdue = processor
            .create_payment(UserId(9), Tier::Basic, Crypto::Ton)
            .await
            .unwrap();
        overdue.expires_at -= chrono::Duration::hours(1);
        store.insert_payment(&overdue).await.unwrap();

        explorer.txs.lock().push(incoming("tx-1", 3.0, Some(&paid.id)));

        let report = processor.verify_pending().await.unwrap();

        assert_eq!(
            report,
            PendingReport {
                checked: 2,
                completed: 1,
                expired: 1,
                errors: 0,
            }
        );
    }

    #[test]
    fn subscription_is_stacked_on_unexpired_one() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let month = chrono::Duration::days(30);

        assert_eq!(stacked_expiry(None, now, month), now + month);
        assert_eq!(
            stacked_expiry(Some(now - chrono::Duration::days(1)), now, month),
            now + month
        );
        assert_eq!(
            stacked_expiry(Some(now + chrono::Duration::days(10)), now, month),
            now + chrono::Duration::days(40)
        );
    }

    #[test]
    fn payment_id_is_normalized() {
        assert_eq!(PaymentId::parse(" abc23 ").0, "ABC23");
    }
}
