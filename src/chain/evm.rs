//! EVM chain adapter
//!
//! Reads bridge logs and head height through an alloy HTTP provider,
//! submits `mint` / `release` with the configured operator key, and checks
//! receipts over raw JSON-RPC.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, FixedBytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    ActionError, ActionRequest, ChainHandle, ChainReader, ChainWriter, Completion, RawLog,
    TxStatus,
};
use crate::config::ChainConfig;
use crate::contracts::BridgeVault;
use crate::hash::{bytes32_to_hex, bytes32_to_symbol, symbol_to_bytes32};
use crate::retry::{classify_error, ErrorClass};
use crate::types::{ActionKind, BridgeEventKind, IdempotencyKey};

/// How far back `find_completion` scans for a `Relayed` log
const COMPLETION_LOOKBACK_BLOCKS: u64 = 50_000;

#[derive(Debug, Deserialize)]
struct TransactionReceipt {
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

fn parse_hex_u64(value: &str) -> Result<u64> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16)
        .wrap_err_with(|| format!("Invalid hex quantity: {}", value))
}

/// One EVM chain running the bridge vault contract
pub struct EvmChain {
    key: String,
    rpc_url: String,
    bridge_address: Address,
    provider: RootProvider<Http<Client>>,
    signer: Option<PrivateKeySigner>,
    client: reqwest::Client,
    rpc_timeout: Duration,
    inclusion_timeout: Duration,
}

impl EvmChain {
    pub fn new(
        config: &ChainConfig,
        rpc_timeout: Duration,
        inclusion_timeout: Duration,
    ) -> Result<Self> {
        let url = config
            .rpc_url
            .parse()
            .wrap_err_with(|| format!("Failed to parse RPC URL for {}", config.key))?;
        let provider = ProviderBuilder::new().on_http(url);

        let bridge_address = Address::from_str(&config.bridge_address)
            .wrap_err_with(|| format!("Invalid bridge address for {}", config.key))?;

        let signer = config
            .private_key
            .as_deref()
            .map(|key| {
                key.parse::<PrivateKeySigner>()
                    .wrap_err_with(|| format!("Invalid private key for {}", config.key))
            })
            .transpose()?;

        let client = reqwest::Client::builder().timeout(rpc_timeout).build()?;

        if let Some(signer) = &signer {
            info!(chain = %config.key, operator = %signer.address(), "EVM writer configured");
        } else {
            warn!(chain = %config.key, "No private key configured; actions on this chain will fail");
        }

        Ok(Self {
            key: config.key.clone(),
            rpc_url: config.rpc_url.clone(),
            bridge_address,
            provider,
            signer,
            client,
            rpc_timeout,
            inclusion_timeout,
        })
    }

    /// Wrap this chain as both reader and writer
    pub fn into_handle(self, confirmation_depth: u64) -> ChainHandle {
        let key = self.key.clone();
        let chain = Arc::new(self);
        ChainHandle {
            key,
            confirmation_depth,
            reader: chain.clone(),
            writer: chain,
        }
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.rpc_timeout, fut)
            .await
            .map_err(|_| eyre!("{} timeout after {:?} on {}", what, self.rpc_timeout, self.key))?
    }

    async fn rpc<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .wrap_err_with(|| format!("{} request failed", method))?
            .json::<RpcResponse<T>>()
            .await
            .wrap_err_with(|| format!("{} returned an unreadable response", method))?;

        if let Some(error) = response.error {
            return Err(eyre!("RPC error: {} - {}", error.code, error.message));
        }
        Ok(response.result)
    }

    async fn is_processed(&self, relay_key: B256) -> Result<bool> {
        let contract = BridgeVault::new(self.bridge_address, &self.provider);
        let processed = self
            .bounded("processedKeys", async {
                contract
                    .processedKeys(relay_key)
                    .call()
                    .await
                    .map_err(|e| eyre!("processedKeys call failed: {}", e))
            })
            .await?;
        Ok(processed._0)
    }

    async fn submit(
        &self,
        action: ActionKind,
        request: &ActionRequest,
    ) -> Result<String, ActionError> {
        let signer = self
            .signer
            .clone()
            .ok_or_else(|| ActionError::Permanent(format!("no signing key for {}", self.key)))?;
        let asset = symbol_to_bytes32(&request.asset)
            .map(FixedBytes::from)
            .ok_or_else(|| ActionError::Permanent(format!("unsupported asset {}", request.asset)))?;
        let recipient: Address = request.recipient.parse().map_err(|_| {
            ActionError::Permanent(format!("invalid recipient address {}", request.recipient))
        })?;
        let relay_key = FixedBytes::from(request.idempotency_key.digest());

        // The vault dedupes on relayKey; skip the write when it already ran.
        match self.is_processed(relay_key).await {
            Ok(true) => {
                return Err(ActionError::Rejected {
                    already_processed: true,
                    reason: format!("relay key {} already processed", request.idempotency_key),
                })
            }
            Ok(false) => {}
            Err(e) => return Err(ActionError::Transient(e.to_string())),
        }

        let wallet = EthereumWallet::from(signer);
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| ActionError::Permanent(format!("invalid RPC URL: {}", e)))?;
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(url);
        let contract = BridgeVault::new(self.bridge_address, &provider);
        let amount = request.amount.as_u256();

        debug!(
            chain = %self.key,
            key = %request.idempotency_key,
            action = %action,
            asset = %request.asset,
            recipient = %recipient,
            amount = %amount,
            "Submitting bridge action"
        );

        let sent = match action {
            ActionKind::Mint => contract.mint(asset, recipient, amount, relay_key).send().await,
            ActionKind::Release => {
                contract
                    .release(asset, recipient, amount, relay_key)
                    .send()
                    .await
            }
        };
        let pending_tx = sent.map_err(|e| action_error(&e.to_string()))?;

        let tx_hash = format!("0x{:x}", pending_tx.tx_hash());
        info!(chain = %self.key, tx_hash = %tx_hash, "Transaction sent, waiting for inclusion");

        match tokio::time::timeout(self.inclusion_timeout, pending_tx.get_receipt()).await {
            Ok(Ok(receipt)) if receipt.status() => Ok(tx_hash),
            Ok(Ok(_)) => {
                // A concurrent relayer may have won the race on relayKey
                if let Ok(true) = self.is_processed(relay_key).await {
                    Err(ActionError::Rejected {
                        already_processed: true,
                        reason: format!("tx {} reverted: relay key already processed", tx_hash),
                    })
                } else {
                    Err(ActionError::Transient(format!("transaction {} reverted", tx_hash)))
                }
            }
            Ok(Err(e)) => {
                warn!(chain = %self.key, tx_hash = %tx_hash, error = %e, "Receipt lookup failed; finality tracker will follow up");
                Ok(tx_hash)
            }
            Err(_) => {
                warn!(chain = %self.key, tx_hash = %tx_hash, "Not included within {:?}; finality tracker will follow up", self.inclusion_timeout);
                Ok(tx_hash)
            }
        }
    }
}

/// Turn a vault log into a `RawLog`.
///
/// Returns `None` only for logs without a bridge event signature. A bridge
/// log whose payload fails to decode is still returned, with `decode_error`
/// set, so the observer records it as skipped.
pub fn decode_bridge_log(log: &Log) -> Option<RawLog> {
    let topic0 = log.topics().first().copied()?;
    let kind = if topic0 == BridgeVault::Locked::SIGNATURE_HASH {
        BridgeEventKind::Locked
    } else if topic0 == BridgeVault::Burned::SIGNATURE_HASH {
        BridgeEventKind::Burned
    } else {
        return None;
    };

    let mut raw = RawLog {
        block_number: log.block_number.unwrap_or_default(),
        tx_hash: log.transaction_hash.map(|h| format!("{:?}", h)),
        log_index: log.log_index,
        kind,
        asset: String::new(),
        amount: String::new(),
        sender: String::new(),
        recipient: String::new(),
        decode_error: None,
    };

    let fields = match kind {
        BridgeEventKind::Locked => log.log_decode::<BridgeVault::Locked>().map(|l| {
            let d = l.inner.data;
            (d.asset, d.sender, d.recipient, d.amount)
        }),
        BridgeEventKind::Burned => log.log_decode::<BridgeVault::Burned>().map(|l| {
            let d = l.inner.data;
            (d.asset, d.sender, d.recipient, d.amount)
        }),
    };

    match fields {
        Ok((asset, sender, recipient, amount)) => {
            let asset_bytes: [u8; 32] = asset.0;
            raw.asset =
                bytes32_to_symbol(&asset_bytes).unwrap_or_else(|| bytes32_to_hex(&asset_bytes));
            raw.amount = amount.to_string();
            raw.sender = format!("{:?}", sender);
            raw.recipient = recipient;
        }
        Err(e) => raw.decode_error = Some(e.to_string()),
    }
    Some(raw)
}

/// Map an adapter error message onto the executor taxonomy
pub fn action_error(message: &str) -> ActionError {
    match classify_error(message) {
        ErrorClass::Permanent => ActionError::Permanent(message.to_string()),
        ErrorClass::AlreadyProcessed => ActionError::Rejected {
            already_processed: true,
            reason: message.to_string(),
        },
        ErrorClass::Transient | ErrorClass::Unknown => ActionError::Transient(message.to_string()),
    }
}

#[async_trait]
impl ChainReader for EvmChain {
    async fn head_block(&self) -> Result<u64> {
        self.bounded("eth_blockNumber", async {
            self.provider
                .get_block_number()
                .await
                .wrap_err("Failed to get block number")
        })
        .await
    }

    async fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<RawLog>> {
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(vec![
                BridgeVault::Locked::SIGNATURE_HASH,
                BridgeVault::Burned::SIGNATURE_HASH,
            ])
            .from_block(from)
            .to_block(to);

        let logs = self
            .bounded("eth_getLogs", async {
                self.provider
                    .get_logs(&filter)
                    .await
                    .wrap_err("Failed to get logs")
            })
            .await?;

        let mut decoded = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|l| !l.removed) {
            match decode_bridge_log(log) {
                Some(raw) => {
                    if let Some(error) = &raw.decode_error {
                        warn!(
                            chain = %self.key,
                            tx_hash = ?log.transaction_hash,
                            log_index = ?log.log_index,
                            error = %error,
                            "Undecodable bridge log"
                        );
                    }
                    decoded.push(raw);
                }
                None => debug!(
                    chain = %self.key,
                    tx_hash = ?log.transaction_hash,
                    "Ignoring log without a bridge event signature"
                ),
            }
        }
        Ok(decoded)
    }

    async fn transaction_status(&self, tx_hash: &str) -> Result<TxStatus> {
        let receipt: Option<TransactionReceipt> = self
            .rpc("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
            .await?;

        if let Some(receipt) = receipt {
            if let Some(block) = receipt.block_number.as_deref() {
                return Ok(TxStatus::Included {
                    block_number: parse_hex_u64(block)?,
                    success: receipt.status.as_deref() != Some("0x0"),
                });
            }
            return Ok(TxStatus::Pending);
        }

        let tx: Option<serde_json::Value> = self
            .rpc("eth_getTransactionByHash", serde_json::json!([tx_hash]))
            .await?;
        Ok(if tx.is_some() {
            TxStatus::Pending
        } else {
            TxStatus::NotFound
        })
    }

    async fn find_completion(&self, key: &IdempotencyKey) -> Result<Option<Completion>> {
        let relay_key = B256::from(key.digest());
        if !self.is_processed(relay_key).await? {
            return Ok(None);
        }

        let head = self.head_block().await?;
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(BridgeVault::Relayed::SIGNATURE_HASH)
            .topic1(relay_key)
            .from_block(head.saturating_sub(COMPLETION_LOOKBACK_BLOCKS))
            .to_block(head);

        // The processed flag is the evidence; the tx hash is best effort.
        let dest_tx_hash = match self
            .bounded("eth_getLogs", async {
                self.provider
                    .get_logs(&filter)
                    .await
                    .wrap_err("Failed to get relay logs")
            })
            .await
        {
            Ok(logs) => logs
                .last()
                .and_then(|l| l.transaction_hash)
                .map(|h| format!("{:?}", h)),
            Err(e) => {
                warn!(chain = %self.key, key = %key, error = %e, "Relay key processed but log lookup failed");
                None
            }
        };

        Ok(Some(Completion { dest_tx_hash }))
    }
}

#[async_trait]
impl ChainWriter for EvmChain {
    async fn submit_mint(&self, request: &ActionRequest) -> Result<String, ActionError> {
        self.submit(ActionKind::Mint, request).await
    }

    async fn submit_release(&self, request: &ActionRequest) -> Result<String, ActionError> {
        self.submit(ActionKind::Release, request).await
    }
}
