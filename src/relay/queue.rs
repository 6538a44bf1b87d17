use chrono::Utc;
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;
use std::{str::FromStr, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult, PermitError},
    execution::instructions,
    ledger::{
        models::{NewPermit, Permit, PermitStatus},
        store::{FeeConfigStore, PermitStore},
    },
};

/// Intake side of the durable permit queue
pub struct PermitQueue {
    permits: Arc<dyn PermitStore>,
    fee_config: Arc<dyn FeeConfigStore>,
    relayers: Vec<Pubkey>,
    estimated_fee: u64,
}

impl PermitQueue {
    pub fn new(
        permits: Arc<dyn PermitStore>,
        fee_config: Arc<dyn FeeConfigStore>,
        relayers: Vec<Pubkey>,
        estimated_fee: u64,
    ) -> Self {
        Self {
            permits,
            fee_config,
            relayers,
            estimated_fee,
        }
    }

    /// Every permit of a `(user, service)` pair lands on the same relayer,
    /// so one sequential processor sees the whole nonce sequence.
    pub fn relayer_for(&self, user_address: &str, service_id: &str) -> AppResult<Pubkey> {
        if self.relayers.is_empty() {
            return Err(AppError::Config("No relayer configured".to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(user_address.as_bytes());
        hasher.update([0u8]);
        hasher.update(service_id.as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(prefix) % self.relayers.len() as u64) as usize;
        Ok(self.relayers[index])
    }

    /// Moves unfinished permits whose relayer is no longer configured onto
    /// the relayer the current set shards them to. Must run before any
    /// processor starts, otherwise their nonce sequences stay blocked.
    pub async fn reassign_orphaned(&self) -> AppResult<usize> {
        let configured: Vec<String> = self.relayers.iter().map(|r| r.to_string()).collect();
        let mut moved = 0;

        for permit in self.permits.list_orphaned(&configured).await? {
            let relayer = self.relayer_for(&permit.user_address, &permit.service_id)?;
            if self.permits.reassign(permit.permit_id, &relayer.to_string()).await? {
                info!(
                    "🔀 Permit {} moved from retired relayer {} to {}",
                    permit.permit_id, permit.relayer_address, relayer
                );
                moved += 1;
            }
        }

        if moved > 0 {
            warn!("Reassigned {} permit(s) from relayers no longer configured", moved);
        }
        Ok(moved)
    }

    /// Validates and stores a permit as `pending`. Nothing is stored on rejection.
    pub async fn enqueue(&self, new: NewPermit) -> AppResult<Permit> {
        let now = Utc::now();

        if new.max_fee == 0 {
            return Err(PermitError::ZeroMaxFee.into());
        }
        if new.expiry <= now {
            return Err(PermitError::Expired.into());
        }
        if new.instruction_payload.is_empty() {
            return Err(PermitError::EmptyPayload.into());
        }
        if new.max_fee < self.estimated_fee {
            return Err(PermitError::MaxFeeTooLow {
                max_fee: new.max_fee,
                estimated: self.estimated_fee,
            }
            .into());
        }

        Pubkey::from_str(&new.user_address)
            .map_err(|_| AppError::InvalidAddress(format!("Invalid user address: {}", new.user_address)))?;
        let target = Pubkey::from_str(&new.target_program)
            .map_err(|_| AppError::InvalidAddress(format!("Invalid target program: {}", new.target_program)))?;

        let service = self
            .fee_config
            .get_service_fee_config(&new.service_id)
            .await?
            .ok_or_else(|| PermitError::UnknownService(new.service_id.clone()))?;
        if !service.is_active {
            return Err(PermitError::InactiveService(new.service_id.clone()).into());
        }
        if !service.allows_program(&new.target_program) {
            return Err(PermitError::ProgramNotAllowed {
                program: new.target_program.clone(),
                service_id: new.service_id.clone(),
            }
            .into());
        }

        let relayer = self.relayer_for(&new.user_address, &new.service_id)?;
        instructions::decode_instructions(&new.instruction_payload)
            .and_then(|ixs| instructions::check_policy(&ixs, &target, &relayer))
            .map_err(|e| PermitError::MalformedPayload(e.to_string()))?;

        if self.permits.signature_exists(&new.signature).await? {
            return Err(PermitError::SignatureReplayed.into());
        }
        if let Some(last) = self.permits.last_nonce(&new.user_address, &new.service_id).await? {
            if new.nonce <= last {
                return Err(PermitError::NonceReused { nonce: new.nonce, last }.into());
            }
        }

        let permit = Permit {
            permit_id: Uuid::new_v4(),
            user_address: new.user_address,
            service_id: new.service_id,
            nonce: new.nonce,
            instruction_payload: new.instruction_payload,
            target_program: new.target_program,
            expiry: new.expiry,
            max_fee: new.max_fee,
            status: PermitStatus::Pending,
            retry_count: 0,
            transaction_signature: None,
            created_at: now,
            executed_at: None,
            relayer_address: relayer.to_string(),
            signature: new.signature,
            gas_cost: None,
            last_error: None,
            next_attempt_at: now,
            updated_at: now,
        };

        self.permits.insert_permit(&permit).await?;

        info!(
            "📥 Permit {} queued for {} (service {}, nonce {}) on relayer {}",
            permit.permit_id, permit.user_address, permit.service_id, permit.nonce, permit.relayer_address
        );

        Ok(permit)
    }

    pub async fn get_status(&self, permit_id: Uuid) -> AppResult<Permit> {
        self.permits
            .get_permit(permit_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Permit {} not found", permit_id)))
    }

    pub async fn list_user_permits(
        &self,
        user_address: &str,
        service_id: Option<&str>,
        status: Option<PermitStatus>,
    ) -> AppResult<Vec<Permit>> {
        self.permits.list_by_user(user_address, service_id, status).await
    }
}
