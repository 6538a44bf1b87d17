use chrono::Utc;
use sha2::{Digest, Sha256};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    message::Message,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::Transaction,
};
use std::{str::FromStr, sync::Arc};
use tracing::{error, info, instrument, warn};

use crate::{
    error::{ExecutionError, ReimbursementError},
    execution::client::ChainClient,
    ledger::{
        models::{ReimbursementClaim, ReimbursementRecord},
        store::{FeeConfigStore, ReimbursementStore},
    },
    settlement::fees::{compute_fee_split, FeeSplit},
};

pub const PROTOCOL_SEED: &[u8] = b"gasless_protocol";
pub const SERVICE_SEED: &[u8] = b"service";
pub const FEE_VAULT_SEED: &[u8] = b"fee_vault";

/// The native system program is the all-zero address
pub const SYSTEM_PROGRAM_ID: Pubkey = Pubkey::new_from_array([0; 32]);

/// Longest seed the runtime accepts
const MAX_SEED_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReimbursementOutcome {
    Reimbursed(ReimbursementRecord),
    NotReimbursed { reason: String },
}

impl ReimbursementOutcome {
    pub fn is_reimbursed(&self) -> bool {
        matches!(self, ReimbursementOutcome::Reimbursed(_))
    }
}

/// Anchor instruction discriminator for `reimburse_relayer`
pub fn reimburse_discriminator() -> [u8; 8] {
    let digest = Sha256::digest(b"global:reimburse_relayer");
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

fn pda(seeds: &[&[u8]], program_id: &Pubkey) -> Result<Pubkey, ReimbursementError> {
    Pubkey::try_find_program_address(seeds, program_id)
        .map(|(address, _bump)| address)
        .ok_or_else(|| ReimbursementError::InvalidFeeConfig("No valid PDA for seeds".to_string()))
}

/// Builds the single `reimburse_relayer(gas_cost, service_fee, protocol_fee)` call
pub fn reimburse_instruction(
    program_id: &Pubkey,
    service_id: &str,
    master_treasury: &Pubkey,
    relayer: &Pubkey,
    gas_cost: u64,
    split: FeeSplit,
) -> Result<Instruction, ReimbursementError> {
    if service_id.is_empty() || service_id.len() > MAX_SEED_LEN {
        return Err(ReimbursementError::InvalidFeeConfig(format!(
            "service id must be 1..={} bytes",
            MAX_SEED_LEN
        )));
    }

    let protocol = pda(&[PROTOCOL_SEED], program_id)?;
    let service = pda(&[SERVICE_SEED, service_id.as_bytes()], program_id)?;
    let fee_vault = pda(&[FEE_VAULT_SEED, service.as_ref()], program_id)?;

    let mut data = reimburse_discriminator().to_vec();
    let args = borsh::to_vec(&(gas_cost, split.service_fee, split.protocol_fee))
        .map_err(|e| ReimbursementError::Transaction(format!("Failed to encode arguments: {}", e)))?;
    data.extend_from_slice(&args);

    Ok(Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(protocol, false),
            AccountMeta::new(service, false),
            AccountMeta::new(fee_vault, false),
            AccountMeta::new(*master_treasury, true),
            AccountMeta::new(*relayer, true),
            AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
        ],
        data,
    })
}

/// Recovers an execution's fee from the master treasury, exactly once per
/// original transaction signature. A claim holding the signed transfer is
/// stored before submission, so a concurrent or later call settles that
/// transfer by its status and never sends a second one.
pub struct ReimbursementEngine {
    chain: Arc<dyn ChainClient>,
    master_treasury: Arc<Keypair>,
    program_id: Pubkey,
    fee_config: Arc<dyn FeeConfigStore>,
    records: Arc<dyn ReimbursementStore>,
}

impl ReimbursementEngine {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        master_treasury: Arc<Keypair>,
        program_id: Pubkey,
        fee_config: Arc<dyn FeeConfigStore>,
        records: Arc<dyn ReimbursementStore>,
    ) -> Self {
        Self {
            chain,
            master_treasury,
            program_id,
            fee_config,
            records,
        }
    }

    pub fn master_treasury_pubkey(&self) -> Pubkey {
        self.master_treasury.pubkey()
    }

    /// Never fails the caller. A failure is reported as `NotReimbursed` with
    /// the reason and leaves the permit alone.
    #[instrument(skip_all, fields(service_id = %service_id, original = %original_signature))]
    pub async fn reimburse(
        &self,
        relayer: &Keypair,
        service_id: &str,
        gas_cost: u64,
        original_signature: &str,
    ) -> ReimbursementOutcome {
        match self.try_reimburse(relayer, service_id, gas_cost, original_signature).await {
            Ok(record) => ReimbursementOutcome::Reimbursed(record),
            Err(reason) => {
                error!("❌ Reimbursement for {} failed: {}", original_signature, reason);
                ReimbursementOutcome::NotReimbursed { reason }
            }
        }
    }

    async fn try_reimburse(
        &self,
        relayer: &Keypair,
        service_id: &str,
        gas_cost: u64,
        original_signature: &str,
    ) -> Result<ReimbursementRecord, String> {
        if let Some(existing) = self
            .records
            .get_reimbursement(original_signature)
            .await
            .map_err(|e| e.to_string())?
        {
            info!("Reimbursement for {} already recorded", original_signature);
            return Ok(existing);
        }

        if let Some(claim) = self
            .records
            .get_reimbursement_claim(original_signature)
            .await
            .map_err(|e| e.to_string())?
        {
            let pending = claim.reimbursement_transaction_signature.clone();
            match self.resolve_claim(claim).await? {
                ClaimResolution::Landed(record) => return Ok(record),
                ClaimResolution::InFlight => return Err(in_flight(original_signature, &pending)),
                ClaimResolution::Released => {}
            }
        }

        let config = self
            .fee_config
            .get_service_fee_config(service_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| ReimbursementError::UnknownService(service_id.to_string()).to_string())?;

        if !config.is_active {
            return Err(ReimbursementError::InactiveService(service_id.to_string()).to_string());
        }

        let split = compute_fee_split(gas_cost, config.protocol_fee_bps, config.service_fee_bps)
            .map_err(|e| e.to_string())?;

        let treasury = self.master_treasury.pubkey();
        let instruction = reimburse_instruction(
            &self.program_id,
            service_id,
            &treasury,
            &relayer.pubkey(),
            gas_cost,
            split,
        )
        .map_err(|e| e.to_string())?;

        let recent = self.chain.get_latest_blockhash().await.map_err(|e| e.to_string())?;

        // Treasury pays the fee so the relayer ends up exactly whole
        let mut transaction = Transaction::new_unsigned(Message::new(&[instruction], Some(&treasury)));
        transaction
            .try_sign(&[&*self.master_treasury, relayer], recent.blockhash)
            .map_err(|e| ReimbursementError::Transaction(format!("Signing failed: {}", e)).to_string())?;
        let signature = transaction
            .signatures
            .first()
            .copied()
            .ok_or_else(|| ReimbursementError::Transaction("Unsigned transaction".to_string()).to_string())?;

        // The claim must be durable before anything reaches the chain
        let claim = ReimbursementClaim {
            original_transaction_signature: original_signature.to_string(),
            reimbursement_transaction_signature: signature.to_string(),
            service_id: service_id.to_string(),
            gas_cost,
            service_fee: split.service_fee,
            protocol_fee: split.protocol_fee,
            relayer_address: relayer.pubkey().to_string(),
            last_valid_block_height: recent.last_valid_block_height,
            claimed_at: Utc::now(),
        };
        let held = self
            .records
            .claim_reimbursement(&claim)
            .await
            .map_err(|e| e.to_string())?;
        if held.reimbursement_transaction_signature != claim.reimbursement_transaction_signature {
            return Err(in_flight(original_signature, &held.reimbursement_transaction_signature));
        }

        if let Err(e) = self.chain.submit_transaction(&transaction).await {
            // It may still land. The claim stays until its blockhash expires.
            warn!("Submitting reimbursement {} returned {}", signature, e);
            return Err(ReimbursementError::Transaction(e.to_string()).to_string());
        }

        match self
            .chain
            .confirm_transaction(&signature, recent.last_valid_block_height)
            .await
        {
            Ok(confirmation) if confirmation.ok => self.finalize(claim).await,
            Ok(confirmation) => {
                self.release(&claim).await?;
                Err(ReimbursementError::Transaction(format!(
                    "{} failed on-chain: {}",
                    signature,
                    confirmation.error.unwrap_or_else(|| "unknown error".to_string())
                ))
                .to_string())
            }
            Err(ExecutionError::BlockhashExpired(_)) => {
                self.release(&claim).await?;
                Err(ReimbursementError::Transaction(format!("{} expired before landing", signature)).to_string())
            }
            Err(e) => {
                warn!("Reimbursement {} unconfirmed, keeping its claim: {}", signature, e);
                Err(ReimbursementError::Transaction(e.to_string()).to_string())
            }
        }
    }

    /// Settles a claim left by an earlier attempt from its on-chain status.
    /// The block height is read before the status so a transaction landing
    /// between the two reads is never mistaken for a dropped one.
    async fn resolve_claim(&self, claim: ReimbursementClaim) -> Result<ClaimResolution, String> {
        let signature = Signature::from_str(&claim.reimbursement_transaction_signature)
            .map_err(|e| format!("Stored reimbursement signature is invalid: {}", e))?;

        let height = self.chain.get_block_height().await.map_err(|e| e.to_string())?;
        let status = self
            .chain
            .signature_status(&signature)
            .await
            .map_err(|e| e.to_string())?;

        match status {
            Some(confirmation) if confirmation.ok => {
                info!("Reimbursement {} landed earlier, recording it", signature);
                self.finalize(claim).await.map(ClaimResolution::Landed)
            }
            Some(confirmation) => {
                warn!(
                    "Reimbursement {} failed on-chain ({}), releasing its claim",
                    signature,
                    confirmation.error.as_deref().unwrap_or("unknown error")
                );
                self.release(&claim).await?;
                Ok(ClaimResolution::Released)
            }
            None if height > claim.last_valid_block_height => {
                warn!("Reimbursement {} can no longer land, releasing its claim", signature);
                self.release(&claim).await?;
                Ok(ClaimResolution::Released)
            }
            None => Ok(ClaimResolution::InFlight),
        }
    }

    async fn finalize(&self, claim: ReimbursementClaim) -> Result<ReimbursementRecord, String> {
        let signature = claim.reimbursement_transaction_signature.clone();
        let stored = self
            .records
            .insert_reimbursement(&claim.into_record(Utc::now()))
            .await
            .map_err(|e| format!("Reimbursed in {} but recording failed: {}", signature, e))?;

        info!(
            "💸 Relayer {} reimbursed {} lamports in {} (protocol fee {}, service fee {})",
            stored.relayer_address, stored.gas_cost, stored.reimbursement_transaction_signature,
            stored.protocol_fee, stored.service_fee
        );

        Ok(stored)
    }

    async fn release(&self, claim: &ReimbursementClaim) -> Result<(), String> {
        self.records
            .release_reimbursement_claim(
                &claim.original_transaction_signature,
                &claim.reimbursement_transaction_signature,
            )
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

enum ClaimResolution {
    Landed(ReimbursementRecord),
    InFlight,
    /// Provably not landed, a new transaction may be sent
    Released,
}

fn in_flight(original_signature: &str, reimbursement_signature: &str) -> String {
    format!(
        "Reimbursement for {} already in flight as {}",
        original_signature, reimbursement_signature
    )
}
