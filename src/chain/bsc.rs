//! BSC-USD (USDT on BNB Smart Chain) transfer verification.
//!
//! Fetches the transaction receipt and scans its logs for a `Transfer`
//! event emitted by the canonical token contract, paying the expected
//! amount to the destination exactly. No tolerance, no summation of
//! multiple transfers.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ChainVerifier, Verification};
use crate::domain::Amount;
use crate::infra::{PaymentError, Result};

/// Canonical BSC-USD token contract.
pub const BSC_USD_ADDRESS: &str = "0x55d398326f99059fF775485246999027B3197955";

fn transfer_topic() -> B256 {
    keccak256(b"Transfer(address,address,uint256)")
}

pub struct BscUsdtVerifier {
    rpc_url: String,
    token: Address,
    /// Caps concurrent receipt fetches so a public RPC is not flooded.
    rpc_permits: Arc<Semaphore>,
    rpc_timeout: Duration,
}

impl BscUsdtVerifier {
    pub fn new(rpc_url: &str, max_concurrent: usize) -> Self {
        Self {
            rpc_url: rpc_url.to_string(),
            token: BSC_USD_ADDRESS.parse().expect("canonical token address"),
            rpc_permits: Arc::new(Semaphore::new(max_concurrent)),
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl ChainVerifier for BscUsdtVerifier {
    async fn verify(
        &self,
        tx_hash: &str,
        destination: &str,
        expected: Amount,
    ) -> Result<Verification> {
        let _permit = self
            .rpc_permits
            .acquire()
            .await
            .map_err(|e| PaymentError::Internal(format!("rpc semaphore closed: {e}")))?;

        let Ok(hash) = tx_hash.parse::<B256>() else {
            // A malformed hash can never be found on chain.
            return Ok(Verification::NotFound);
        };
        let destination: Address = destination
            .parse()
            .map_err(|e| PaymentError::Internal(format!("invalid destination address: {e}")))?;

        let url = self
            .rpc_url
            .parse()
            .map_err(|e| PaymentError::Rpc(format!("invalid rpc url: {e}")))?;
        let provider = ProviderBuilder::new().on_http(url);

        let receipt = timeout(self.rpc_timeout, provider.get_transaction_receipt(hash))
            .await
            .map_err(|_| PaymentError::Rpc("transaction receipt deadline exceeded".to_string()))?
            .map_err(|e| PaymentError::Rpc(e.to_string()))?;

        let Some(receipt) = receipt else {
            debug!(tx_hash = %tx_hash, "no receipt on chain");
            return Ok(Verification::NotFound);
        };

        let expected = expected.value();
        for log in receipt.inner.logs() {
            let Some(amount) = transfer_amount_to(
                self.token,
                destination,
                log.inner.address,
                log.inner.data.topics(),
                log.inner.data.data.as_ref(),
            ) else {
                continue;
            };
            if amount == expected {
                return Ok(Verification::Verified {
                    block_number: receipt.block_number,
                });
            }
            warn!(
                tx_hash = %tx_hash,
                found = %amount,
                expected = %expected,
                "transfer to destination found with wrong amount"
            );
        }

        Ok(Verification::Mismatch)
    }
}

/// Amount of a `Transfer(address,address,uint256)` log from `token` to
/// `dest`, or `None` when the log is not such a transfer.
fn transfer_amount_to(
    token: Address,
    dest: Address,
    log_address: Address,
    topics: &[B256],
    data: &[u8],
) -> Option<U256> {
    if log_address != token || topics.len() != 3 || topics[0] != transfer_topic() {
        return None;
    }
    if Address::from_word(topics[2]) != dest {
        return None;
    }
    // The data field of a plain ERC-20 transfer is a single 32-byte word.
    if data.len() > 32 {
        return None;
    }
    Some(U256::from_be_slice(data))
}
