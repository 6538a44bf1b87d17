use async_trait::async_trait;
use solana_client::{
    nonblocking::rpc_client::RpcClient,
    rpc_config::{CommitmentConfig, UiTransactionEncoding},
};
use solana_sdk::{pubkey::Pubkey, signature::Signature, transaction::Transaction};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    error::{AppError, AppResult, ExecutionError},
    execution::client::{ChainClient, Confirmation, RecentBlockhash},
};

/// Bounded wait applied to every confirmation
#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Chain client backed by a Solana JSON-RPC node
pub struct SolanaRpcClient {
    client: RpcClient,
    confirmation: ConfirmationConfig,
}

impl SolanaRpcClient {
    pub fn new(rpc_url: String, confirmation: ConfirmationConfig) -> Self {
        let client = RpcClient::new_with_commitment(rpc_url, CommitmentConfig::confirmed());
        Self { client, confirmation }
    }

    async fn fetch_fee(&self, signature: &Signature) -> Option<u64> {
        match self
            .client
            .get_transaction(signature, UiTransactionEncoding::Json)
            .await
        {
            Ok(confirmed_tx) => confirmed_tx.transaction.meta.map(|meta| meta.fee),
            Err(e) => {
                warn!("Could not fetch fee for {}: {}", signature, e);
                None
            }
        }
    }
}

#[async_trait]
impl ChainClient for SolanaRpcClient {
    async fn get_balance(&self, address: &Pubkey) -> AppResult<u64> {
        self.client
            .get_balance(address)
            .await
            .map_err(|e| AppError::Chain(format!("Failed to read balance of {}: {}", address, e)))
    }

    async fn get_latest_blockhash(&self) -> Result<RecentBlockhash, ExecutionError> {
        let (blockhash, last_valid_block_height) = self
            .client
            .get_latest_blockhash_with_commitment(self.client.commitment())
            .await
            .map_err(|e| ExecutionError::Rpc(format!("Failed to get blockhash: {}", e)))?;

        Ok(RecentBlockhash {
            blockhash,
            last_valid_block_height,
        })
    }

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, ExecutionError> {
        self.client
            .send_transaction(transaction)
            .await
            .map_err(|e| ExecutionError::Rejected(format!("Send failed: {}", e)))
    }

    async fn confirm_transaction(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
    ) -> Result<Confirmation, ExecutionError> {
        let deadline = Instant::now() + self.confirmation.timeout;
        let commitment = self.client.commitment();

        loop {
            match self.client.get_signature_statuses(&[*signature]).await {
                Ok(response) => {
                    if let Some(Some(status)) = response.value.into_iter().next() {
                        if let Some(err) = status.err {
                            return Ok(Confirmation {
                                ok: false,
                                fee: self.fetch_fee(signature).await,
                                error: Some(format!("{:?}", err)),
                            });
                        }
                        if status.satisfies_commitment(commitment) {
                            return Ok(Confirmation {
                                ok: true,
                                fee: self.fetch_fee(signature).await,
                                error: None,
                            });
                        }
                    }
                }
                Err(e) => debug!("Status poll for {} failed: {}", signature, e),
            }

            match self.client.get_block_height().await {
                Ok(height) if height > last_valid_block_height => {
                    return Err(ExecutionError::BlockhashExpired(signature.to_string()));
                }
                Ok(_) => {}
                Err(e) => debug!("Block height poll failed: {}", e),
            }

            if Instant::now() >= deadline {
                return Err(ExecutionError::Timeout(signature.to_string()));
            }

            tokio::time::sleep(self.confirmation.poll_interval).await;
        }
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Option<Confirmation>, ExecutionError> {
        let response = self
            .client
            .get_signature_statuses_with_history(&[*signature])
            .await
            .map_err(|e| ExecutionError::Rpc(format!("Status lookup for {} failed: {}", signature, e)))?;

        let Some(status) = response.value.into_iter().next().flatten() else {
            return Ok(None);
        };

        if let Some(err) = status.err {
            return Ok(Some(Confirmation {
                ok: false,
                fee: self.fetch_fee(signature).await,
                error: Some(format!("{:?}", err)),
            }));
        }
        if !status.satisfies_commitment(self.client.commitment()) {
            return Ok(None);
        }

        Ok(Some(Confirmation {
            ok: true,
            fee: self.fetch_fee(signature).await,
            error: None,
        }))
    }

    async fn get_block_height(&self) -> Result<u64, ExecutionError> {
        self.client
            .get_block_height()
            .await
            .map_err(|e| ExecutionError::Rpc(format!("Failed to read block height: {}", e)))
    }
}
