use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Durable permit queue storage
#[async_trait]
pub trait PermitStore: Send + Sync {
    /// Inserts a new `pending` permit. Nonce and signature uniqueness are
    /// enforced here as well, so a racing intake surfaces as `PermitError`.
    async fn insert_permit(&self, permit: &Permit) -> AppResult<()>;

    async fn get_permit(&self, permit_id: Uuid) -> AppResult<Option<Permit>>;

    /// Highest nonce stored for the pair, whatever the status.
    async fn last_nonce(&self, user_address: &str, service_id: &str) -> AppResult<Option<u64>>;

    async fn signature_exists(&self, signature: &[u8]) -> AppResult<bool>;

    /// Oldest `pending` permit of this relayer that is due and not blocked
    /// by a lower-nonce, non-terminal permit of the same pair.
    async fn next_eligible(
        &self,
        relayer_address: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Permit>>;

    /// Compare-and-set transition. Fails with `InvalidTransition` when the
    /// stored status is not `from` or the edge is not allowed.
    async fn transition(
        &self,
        permit_id: Uuid,
        from: PermitStatus,
        update: PermitUpdate,
    ) -> AppResult<Permit>;

    /// Non-terminal permits of this relayer whose expiry has passed.
    async fn list_expired(&self, relayer_address: &str, now: DateTime<Utc>) -> AppResult<Vec<Permit>>;

    async fn list_by_status(&self, relayer_address: &str, status: PermitStatus) -> AppResult<Vec<Permit>>;

    async fn list_by_user(
        &self,
        user_address: &str,
        service_id: Option<&str>,
        status: Option<PermitStatus>,
    ) -> AppResult<Vec<Permit>>;

    /// Executed permits of this relayer with a gas cost but no reimbursement record.
    async fn list_unreimbursed(&self, relayer_address: &str, limit: usize) -> AppResult<Vec<Permit>>;

    /// Non-terminal permits sharded to a relayer that is not in `relayers`.
    async fn list_orphaned(&self, relayers: &[String]) -> AppResult<Vec<Permit>>;

    /// Moves a non-terminal permit to another relayer's queue. Returns false
    /// when the permit reached a terminal state first.
    async fn reassign(&self, permit_id: Uuid, relayer_address: &str) -> AppResult<bool>;
}

/// Append-only reimbursement ledger
#[async_trait]
pub trait ReimbursementStore: Send + Sync {
    async fn get_reimbursement(
        &self,
        original_signature: &str,
    ) -> AppResult<Option<ReimbursementRecord>>;

    /// Returns the stored record. When a record for the same original
    /// signature already exists, that one is returned and nothing is written.
    /// Any claim on the original signature is cleared.
    async fn insert_reimbursement(
        &self,
        record: &ReimbursementRecord,
    ) -> AppResult<ReimbursementRecord>;

    async fn get_reimbursement_claim(
        &self,
        original_signature: &str,
    ) -> AppResult<Option<ReimbursementClaim>>;

    /// Stores `claim` unless the original signature is already claimed.
    /// Returns whichever claim holds it afterwards.
    async fn claim_reimbursement(&self, claim: &ReimbursementClaim) -> AppResult<ReimbursementClaim>;

    /// Drops the claim only while it still names `reimbursement_signature`.
    async fn release_reimbursement_claim(
        &self,
        original_signature: &str,
        reimbursement_signature: &str,
    ) -> AppResult<bool>;
}

/// Fee and service configuration
#[async_trait]
pub trait FeeConfigStore: Send + Sync {
    async fn get_service_fee_config(&self, service_id: &str) -> AppResult<Option<ServiceFeeConfig>>;
}
