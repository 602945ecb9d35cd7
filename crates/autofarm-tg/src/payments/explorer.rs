use super::{Crypto, PaymentError};
use crate::error::err;
use crate::prelude::*;
use crate::{http, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};

/// Transaction that transferred coins to our address
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IncomingTx {
    pub(crate) hash: String,

    /// Amount in coins, not in the base units
    pub(crate) amount: f64,

    /// Comment attached to the transaction, if the blockchain supports them
    pub(crate) memo: Option<String>,

    pub(crate) timestamp: DateTime<Utc>,
}

#[async_trait]
pub(crate) trait Explorer: Send + Sync {
    /// Recent incoming transactions of the address, newest first
    async fn incoming_transactions(&self, crypto: Crypto, address: &str) -> Result<Vec<IncomingTx>>;
}

pub(crate) struct ExplorerConfig {
    pub(crate) toncenter_url: url::Url,
    pub(crate) toncenter_api_key: Option<String>,
    pub(crate) btc_esplora_url: url::Url,
    pub(crate) ltc_esplora_url: url::Url,
    pub(crate) tx_limit: u32,
}

/// Block explorers with public HTTP APIs: toncenter for TON and Esplora
/// instances for the UTXO chains
pub(crate) struct BlockExplorers {
    http: http::Client,
    cfg: ExplorerConfig,
}

impl BlockExplorers {
    pub(crate) fn new(http: http::Client, cfg: ExplorerConfig) -> Self {
        Self { http, cfg }
    }

    async fn toncenter_transactions(&self, address: &str) -> Result<Vec<IncomingTx>> {
        let url = join_url(&self.cfg.toncenter_url, &["getTransactions"])?;

        let limit = self.cfg.tx_limit.to_string();
        let mut request = self
            .http
            .get(url)
            .query(&[("address", address), ("limit", limit.as_str()), ("archival", "true")]);

        if let Some(api_key) = &self.cfg.toncenter_api_key {
            request = request.header("X-API-Key", api_key);
        }

        let response: toncenter::Response = request.read_json().await?;

        if !response.ok {
            return Err(err!(PaymentError::Explorer {
                message: response
                    .error
                    .unwrap_or_else(|| "toncenter returned ok: false".to_owned())
            }));
        }

        Ok(response
            .result
            .into_iter()
            .filter_map(toncenter::Transaction::into_incoming)
            .collect())
    }

    async fn esplora_transactions(
        &self,
        base_url: &url::Url,
        crypto: Crypto,
        address: &str,
    ) -> Result<Vec<IncomingTx>> {
        let url = join_url(base_url, &["address", address, "txs"])?;

        let txs: Vec<esplora::Transaction> = self.http.get(url).read_json().await?;

        Ok(txs
            .into_iter()
            .take(self.cfg.tx_limit as usize)
            .filter_map(|tx| tx.into_incoming(crypto, address))
            .collect())
    }
}

#[async_trait]
impl Explorer for BlockExplorers {
    #[instrument(skip(self))]
    async fn incoming_transactions(&self, crypto: Crypto, address: &str) -> Result<Vec<IncomingTx>> {
        match crypto {
            Crypto::Ton => self.toncenter_transactions(address).await,
            Crypto::Btc => {
                self.esplora_transactions(&self.cfg.btc_esplora_url, crypto, address)
                    .await
            }
            Crypto::Ltc => {
                self.esplora_transactions(&self.cfg.ltc_esplora_url, crypto, address)
                    .await
            }
        }
    }
}

fn join_url(base: &url::Url, segments: &[&str]) -> Result<url::Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| err!(PaymentError::InvalidApiUrl { url: base.to_string() }))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

mod toncenter {
    use super::*;

    #[derive(Deserialize)]
    pub(super) struct Response {
        pub(super) ok: bool,

        #[serde(default)]
        pub(super) result: Vec<Transaction>,

        #[serde(default)]
        pub(super) error: Option<String>,
    }

    #[derive(Deserialize)]
    pub(super) struct Transaction {
        utime: i64,
        transaction_id: TransactionId,
        in_msg: Option<Message>,
    }

    #[derive(Deserialize)]
    struct TransactionId {
        hash: String,
    }

    #[serde_as]
    #[derive(Deserialize)]
    struct Message {
        /// Empty for the external messages, that don't transfer coins
        #[serde(default)]
        source: String,

        /// Amount in nanotons
        #[serde_as(as = "DisplayFromStr")]
        value: u64,

        #[serde(default)]
        message: Option<String>,
    }

    impl Transaction {
        pub(super) fn into_incoming(self) -> Option<IncomingTx> {
            let msg = self.in_msg?;
            if msg.source.is_empty() || msg.value == 0 {
                return None;
            }

            let memo = msg
                .message
                .map(|memo| memo.trim().to_owned())
                .filter(|memo| !memo.is_empty());

            Some(IncomingTx {
                hash: self.transaction_id.hash,
                amount: msg.value as f64 / Crypto::Ton.base_units_per_coin(),
                memo,
                timestamp: from_unix(self.utime)?,
            })
        }
    }
}

mod esplora {
    use super::*;

    #[derive(Deserialize)]
    pub(super) struct Transaction {
        txid: String,
        status: Status,
        vout: Vec<Output>,
    }

    #[derive(Deserialize)]
    struct Status {
        confirmed: bool,
        #[serde(default)]
        block_time: Option<i64>,
    }

    #[derive(Deserialize)]
    struct Output {
        #[serde(default)]
        scriptpubkey_address: Option<String>,

        /// Amount in satoshis
        value: u64,
    }

    impl Transaction {
        pub(super) fn into_incoming(self, crypto: Crypto, address: &str) -> Option<IncomingTx> {
            if !self.status.confirmed {
                return None;
            }

            let received: u64 = self
                .vout
                .iter()
                .filter(|out| out.scriptpubkey_address.as_deref() == Some(address))
                .map(|out| out.value)
                .sum();

            if received == 0 {
                return None;
            }

            Some(IncomingTx {
                hash: self.txid,
                amount: received as f64 / crypto.base_units_per_coin(),
                memo: None,
                timestamp: from_unix(self.status.block_time?)?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toncenter_transactions() {
        let json = r#"{
            "ok": true,
            "result": [
                {
                    "utime": 1709294400,
                    "transaction_id": { "lt": "1", "hash": "tx-in" },
                    "in_msg": {
                        "source": "EQsender",
                        "destination": "EQours",
                        "value": "3000000000",
                        "message": " PAY123 "
                    },
                    "out_msgs": []
                },
                {
                    "utime": 1709294500,
                    "transaction_id": { "lt": "2", "hash": "tx-external" },
                    "in_msg": {
                        "source": "",
                        "destination": "EQours",
                        "value": "0",
                        "message": ""
                    },
                    "out_msgs": []
                }
            ]
        }"#;

        let response: toncenter::Response = serde_json::from_str(json).unwrap();
        let txs: Vec<_> = response
            .result
            .into_iter()
            .filter_map(toncenter::Transaction::into_incoming)
            .collect();

        assert_eq!(
            txs,
            [IncomingTx {
                hash: "tx-in".to_owned(),
                amount: 3.0,
                memo: Some("PAY123".to_owned()),
                timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            }]
        );
    }

    #[test]
    fn parses_esplora_transactions() {
        let json = r#"[
            {
                "txid": "confirmed",
                "status": { "confirmed": true, "block_time": 1709294400 },
                "vout": [
                    { "scriptpubkey_address": "bc1ours", "value": 115385 },
                    { "scriptpubkey_address": "bc1change", "value": 5000 }
                ]
            },
            {
                "txid": "mempool",
                "status": { "confirmed": false },
                "vout": [{ "scriptpubkey_address": "bc1ours", "value": 115385 }]
            }
        ]"#;

        let txs: Vec<esplora::Transaction> = serde_json::from_str(json).unwrap();
        let txs: Vec<_> = txs
            .into_iter()
            .filter_map(|tx| tx.into_incoming(Crypto::Btc, "bc1ours"))
            .collect();

        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].hash, "confirmed");
        assert_eq!(txs[0].amount, 0.00115385);
        assert_eq!(txs[0].memo, None);
    }
}
