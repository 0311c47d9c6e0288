//! On-chain transfer verification.
//!
//! A [`ChainVerifier`] answers one question: did transaction `tx_hash`
//! transfer exactly `expected` minor units of the verifier's token to
//! `destination`? Implementations are selected per `(asset, chain)` pair
//! through the [`VerifierRegistry`].

mod bsc;

pub use bsc::BscUsdtVerifier;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::domain::Amount;
use crate::infra::Result;

/// Outcome of checking a transaction against an expected transfer.
///
/// Transient RPC-layer failures (network, node, deadline) surface as `Err`
/// instead; callers drop the job and rely on client resubmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// A matching transfer log was found.
    Verified { block_number: Option<u64> },
    /// The node has no receipt for this transaction.
    NotFound,
    /// A receipt exists but no log matches token, destination and exact
    /// amount.
    Mismatch,
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

#[async_trait]
pub trait ChainVerifier: Send + Sync {
    async fn verify(
        &self,
        tx_hash: &str,
        destination: &str,
        expected: Amount,
    ) -> Result<Verification>;
}

/// Maps `(asset, chain)` pairs to verifier implementations.
///
/// Pairs are matched case-insensitively. Unknown pairs resolve to `None`
/// unless a fallback is installed; the only fallback this crate ships is
/// the development-mode [`AutoApproveVerifier`], wired up explicitly by
/// configuration at startup.
#[derive(Default)]
pub struct VerifierRegistry {
    verifiers: HashMap<(String, String), Arc<dyn ChainVerifier>>,
    fallback: Option<Arc<dyn ChainVerifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        asset: &str,
        chain: &str,
        verifier: Arc<dyn ChainVerifier>,
    ) {
        self.verifiers
            .insert((asset.to_uppercase(), chain.to_uppercase()), verifier);
    }

    /// Install a fallback used for every unregistered pair.
    pub fn set_fallback(&mut self, verifier: Arc<dyn ChainVerifier>) {
        self.fallback = Some(verifier);
    }

    pub fn resolve(&self, asset: &str, chain: &str) -> Option<Arc<dyn ChainVerifier>> {
        self.verifiers
            .get(&(asset.to_uppercase(), chain.to_uppercase()))
            .or(self.fallback.as_ref())
            .cloned()
    }
}

/// Development-only verifier that approves everything without touching a
/// chain. Never registered unless `DEV_AUTO_APPROVE` is set.
pub struct AutoApproveVerifier;

#[async_trait]
impl ChainVerifier for AutoApproveVerifier {
    async fn verify(
        &self,
        tx_hash: &str,
        _destination: &str,
        _expected: Amount,
    ) -> Result<Verification> {
        warn!(tx_hash = %tx_hash, "auto-approving transfer without on-chain verification");
        Ok(Verification::Verified { block_number: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_matches_case_insensitively() {
        let mut registry = VerifierRegistry::new();
        registry.register("usdt", "bsc", Arc::new(AutoApproveVerifier));

        assert!(registry.resolve("USDT", "BSC").is_some());
        assert!(registry.resolve("Usdt", "Bsc").is_some());
        assert!(registry.resolve("USDC", "BSC").is_none());
        assert!(registry.resolve("USDT", "POLYGON").is_none());
    }

    #[tokio::test]
    async fn fallback_covers_unknown_pairs_only_when_installed() {
        let mut registry = VerifierRegistry::new();
        assert!(registry.resolve("USDC", "POLYGON").is_none());

        registry.set_fallback(Arc::new(AutoApproveVerifier));
        let verifier = registry.resolve("USDC", "POLYGON").unwrap();
        let amount = Amount::from_decimal("1").unwrap();
        let outcome = verifier.verify("0xTX", "0xDEST", amount).await.unwrap();
        assert!(outcome.is_verified());
    }
}
