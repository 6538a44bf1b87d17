use async_trait::async_trait;
use solana_sdk::{hash::Hash, pubkey::Pubkey, signature::Signature, transaction::Transaction};

use crate::error::{AppResult, ExecutionError};

/// Outcome of waiting on a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub ok: bool,
    /// Fee reported by the confirmed transaction's metadata, when available
    pub fee: Option<u64>,
    pub error: Option<String>,
}

/// Blockhash plus the last block height at which it is still accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentBlockhash {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
}

/// Thin chain access used by the guard, executor and reimbursement engine
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_balance(&self, address: &Pubkey) -> AppResult<u64>;

    async fn get_latest_blockhash(&self) -> Result<RecentBlockhash, ExecutionError>;

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, ExecutionError>;

    /// Waits for the signature with a bounded timeout. A timeout or an
    /// expired blockhash is returned as an error, an on-chain failure as
    /// `Confirmation { ok: false, .. }`.
    async fn confirm_transaction(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
    ) -> Result<Confirmation, ExecutionError>;

    /// One status lookup that includes history. `None` while the cluster has
    /// not confirmed the signature.
    async fn signature_status(&self, signature: &Signature) -> Result<Option<Confirmation>, ExecutionError>;

    async fn get_block_height(&self) -> Result<u64, ExecutionError>;
}
