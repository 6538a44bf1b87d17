use solana_sdk::{
    message::Message,
    pubkey::Pubkey,
    signature::{Keypair, Signer},
    transaction::Transaction,
};
use std::{str::FromStr, sync::Arc};
use tracing::{info, instrument, warn};

use crate::{
    error::ExecutionError,
    execution::{client::ChainClient, instructions},
    ledger::models::Permit,
};

/// Base fee charged per signature when the chain reports nothing better
pub const LAMPORTS_PER_SIGNATURE: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReceipt {
    pub transaction_signature: String,
    pub gas_cost: u64,
}

/// Submits a permit's instructions with the relayer as sole fee payer.
pub struct GaslessExecutor {
    chain: Arc<dyn ChainClient>,
    relayer: Arc<Keypair>,
}

impl GaslessExecutor {
    pub fn new(chain: Arc<dyn ChainClient>, relayer: Arc<Keypair>) -> Self {
        Self { chain, relayer }
    }

    pub fn relayer_pubkey(&self) -> Pubkey {
        self.relayer.pubkey()
    }

    pub fn relayer_keypair(&self) -> Arc<Keypair> {
        self.relayer.clone()
    }

    #[instrument(skip_all, fields(permit_id = %permit.permit_id, relayer = %self.relayer.pubkey()))]
    pub async fn execute(&self, permit: &Permit) -> Result<ExecutionReceipt, ExecutionError> {
        let relayer = self.relayer.pubkey();
        let target = Pubkey::from_str(&permit.target_program)
            .map_err(|_| ExecutionError::InvalidInstructionData)?;

        let ixs = instructions::decode_instructions(&permit.instruction_payload)
            .and_then(|ixs| instructions::check_policy(&ixs, &target, &relayer).map(|_| ixs))
            .map_err(|e| {
                warn!("Permit {} carries an unusable payload: {}", permit.permit_id, e);
                ExecutionError::InvalidInstructionData
            })?;

        let message = Message::new(&ixs, Some(&relayer));
        let signature_fee =
            u64::from(message.header.num_required_signatures).saturating_mul(LAMPORTS_PER_SIGNATURE);
        if signature_fee > permit.max_fee {
            return Err(ExecutionError::FeeCapExceeded {
                estimated: signature_fee,
                max_fee: permit.max_fee,
            });
        }

        let balance_before = self.read_balance(&relayer).await;
        let recent = self.chain.get_latest_blockhash().await?;

        let mut transaction = Transaction::new_unsigned(message);
        transaction
            .try_sign(&[&*self.relayer], recent.blockhash)
            .map_err(|e| ExecutionError::Signing(e.to_string()))?;

        let signature = self.chain.submit_transaction(&transaction).await?;
        info!("Gasless transaction sent: {}", signature);

        let confirmation = self
            .chain
            .confirm_transaction(&signature, recent.last_valid_block_height)
            .await?;

        if !confirmation.ok {
            return Err(ExecutionError::OnChain(format!(
                "{} failed: {}",
                signature,
                confirmation.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        let balance_after = self.read_balance(&relayer).await;
        let gas_cost = resolve_gas_cost(confirmation.fee, balance_before, balance_after)
            .unwrap_or_else(|| {
                let fallback = transaction.signatures.len() as u64 * LAMPORTS_PER_SIGNATURE;
                warn!("No fee data for {}, assuming {} lamports", signature, fallback);
                fallback
            });

        info!("✅ Permit {} executed in {} for {} lamports", permit.permit_id, signature, gas_cost);

        Ok(ExecutionReceipt {
            transaction_signature: signature.to_string(),
            gas_cost,
        })
    }

    async fn read_balance(&self, address: &Pubkey) -> Option<u64> {
        match self.chain.get_balance(address).await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!("Balance read for {} failed: {}", address, e);
                None
            }
        }
    }
}

/// The receipt fee is authoritative. The balance delta is a fallback and
/// is ignored when it disagrees, since other activity can move the balance.
pub fn resolve_gas_cost(
    receipt_fee: Option<u64>,
    balance_before: Option<u64>,
    balance_after: Option<u64>,
) -> Option<u64> {
    let delta = match (balance_before, balance_after) {
        (Some(before), Some(after)) => before.checked_sub(after),
        _ => None,
    };

    match (receipt_fee, delta) {
        (Some(fee), Some(delta)) if fee != delta => {
            warn!("Receipt fee {} disagrees with balance delta {}, using receipt", fee, delta);
            Some(fee)
        }
        (Some(fee), _) => Some(fee),
        (None, delta) => delta,
    }
}
