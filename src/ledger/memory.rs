use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::store::{FeeConfigStore, PermitStore, ReimbursementStore};
use crate::error::{AppError, AppResult, PermitError};

/// Process-local ledger used when no database is configured, and by tests.
pub struct InMemoryLedger {
    permits: RwLock<HashMap<Uuid, Permit>>,
    reimbursements: RwLock<HashMap<String, ReimbursementRecord>>,
    claims: RwLock<HashMap<String, ReimbursementClaim>>,
    services: RwLock<HashMap<String, ServiceFeeConfig>>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            permits: RwLock::new(HashMap::new()),
            reimbursements: RwLock::new(HashMap::new()),
            claims: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
        }
    }

    pub async fn upsert_service(&self, config: ServiceFeeConfig) {
        let mut services = self.services.write().await;
        services.insert(config.service_id.clone(), config);
    }

    pub async fn reimbursement_count(&self) -> usize {
        self.reimbursements.read().await.len()
    }
}

#[async_trait]
impl PermitStore for InMemoryLedger {
    async fn insert_permit(&self, permit: &Permit) -> AppResult<()> {
        let mut permits = self.permits.write().await;

        let last = permits
            .values()
            .filter(|p| p.user_address == permit.user_address && p.service_id == permit.service_id)
            .map(|p| p.nonce)
            .max();
        if let Some(last) = last {
            if permit.nonce <= last {
                return Err(PermitError::NonceReused { nonce: permit.nonce, last }.into());
            }
        }
        if permits.values().any(|p| p.signature == permit.signature) {
            return Err(PermitError::SignatureReplayed.into());
        }

        permits.insert(permit.permit_id, permit.clone());
        Ok(())
    }

    async fn get_permit(&self, permit_id: Uuid) -> AppResult<Option<Permit>> {
        Ok(self.permits.read().await.get(&permit_id).cloned())
    }

    async fn last_nonce(&self, user_address: &str, service_id: &str) -> AppResult<Option<u64>> {
        let permits = self.permits.read().await;
        Ok(permits
            .values()
            .filter(|p| p.user_address == user_address && p.service_id == service_id)
            .map(|p| p.nonce)
            .max())
    }

    async fn signature_exists(&self, signature: &[u8]) -> AppResult<bool> {
        let permits = self.permits.read().await;
        Ok(permits.values().any(|p| p.signature == signature))
    }

    async fn next_eligible(
        &self,
        relayer_address: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Permit>> {
        let permits = self.permits.read().await;

        let blocked = |candidate: &Permit| {
            permits.values().any(|p| {
                p.user_address == candidate.user_address
                    && p.service_id == candidate.service_id
                    && p.nonce < candidate.nonce
                    && !p.status.is_terminal()
            })
        };

        Ok(permits
            .values()
            .filter(|p| {
                p.relayer_address == relayer_address
                    && p.status == PermitStatus::Pending
                    && p.next_attempt_at <= now
            })
            .filter(|p| !blocked(p))
            .min_by_key(|p| (p.created_at, p.nonce))
            .cloned())
    }

    async fn transition(
        &self,
        permit_id: Uuid,
        from: PermitStatus,
        update: PermitUpdate,
    ) -> AppResult<Permit> {
        let mut permits = self.permits.write().await;
        let permit = permits
            .get_mut(&permit_id)
            .ok_or_else(|| AppError::NotFound(format!("Permit {} not found", permit_id)))?;

        if permit.status != from || !from.can_transition_to(update.status) {
            return Err(AppError::InvalidTransition {
                from: permit.status,
                to: update.status,
            });
        }

        update.apply(permit, Utc::now());
        Ok(permit.clone())
    }

    async fn list_expired(&self, relayer_address: &str, now: DateTime<Utc>) -> AppResult<Vec<Permit>> {
        let permits = self.permits.read().await;
        Ok(permits
            .values()
            .filter(|p| {
                p.relayer_address == relayer_address && !p.status.is_terminal() && p.is_expired_at(now)
            })
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, relayer_address: &str, status: PermitStatus) -> AppResult<Vec<Permit>> {
        let permits = self.permits.read().await;
        Ok(permits
            .values()
            .filter(|p| p.relayer_address == relayer_address && p.status == status)
            .cloned()
            .collect())
    }

    async fn list_by_user(
        &self,
        user_address: &str,
        service_id: Option<&str>,
        status: Option<PermitStatus>,
    ) -> AppResult<Vec<Permit>> {
        let permits = self.permits.read().await;
        let mut matching: Vec<Permit> = permits
            .values()
            .filter(|p| p.user_address == user_address)
            .filter(|p| service_id.map_or(true, |s| p.service_id == s))
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        matching.sort_by_key(|p| std::cmp::Reverse(p.created_at));
        Ok(matching)
    }

    async fn list_unreimbursed(&self, relayer_address: &str, limit: usize) -> AppResult<Vec<Permit>> {
        let permits = self.permits.read().await;
        let reimbursements = self.reimbursements.read().await;
        Ok(permits
            .values()
            .filter(|p| p.relayer_address == relayer_address)
            .filter(|p| p.status == PermitStatus::Executed && p.gas_cost.is_some())
            .filter(|p| {
                p.transaction_signature
                    .as_ref()
                    .map_or(false, |sig| !reimbursements.contains_key(sig))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_orphaned(&self, relayers: &[String]) -> AppResult<Vec<Permit>> {
        let permits = self.permits.read().await;
        Ok(permits
            .values()
            .filter(|p| !p.status.is_terminal() && !relayers.contains(&p.relayer_address))
            .cloned()
            .collect())
    }

    async fn reassign(&self, permit_id: Uuid, relayer_address: &str) -> AppResult<bool> {
        let mut permits = self.permits.write().await;
        let permit = permits
            .get_mut(&permit_id)
            .ok_or_else(|| AppError::NotFound(format!("Permit {} not found", permit_id)))?;

        if permit.status.is_terminal() {
            return Ok(false);
        }
        permit.relayer_address = relayer_address.to_string();
        permit.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl ReimbursementStore for InMemoryLedger {
    async fn get_reimbursement(
        &self,
        original_signature: &str,
    ) -> AppResult<Option<ReimbursementRecord>> {
        Ok(self.reimbursements.read().await.get(original_signature).cloned())
    }

    async fn insert_reimbursement(
        &self,
        record: &ReimbursementRecord,
    ) -> AppResult<ReimbursementRecord> {
        let mut reimbursements = self.reimbursements.write().await;
        let mut claims = self.claims.write().await;
        let stored = reimbursements
            .entry(record.original_transaction_signature.clone())
            .or_insert_with(|| record.clone());
        claims.remove(&record.original_transaction_signature);
        Ok(stored.clone())
    }

    async fn get_reimbursement_claim(
        &self,
        original_signature: &str,
    ) -> AppResult<Option<ReimbursementClaim>> {
        Ok(self.claims.read().await.get(original_signature).cloned())
    }

    async fn claim_reimbursement(&self, claim: &ReimbursementClaim) -> AppResult<ReimbursementClaim> {
        let mut claims = self.claims.write().await;
        let held = claims
            .entry(claim.original_transaction_signature.clone())
            .or_insert_with(|| claim.clone());
        Ok(held.clone())
    }

    async fn release_reimbursement_claim(
        &self,
        original_signature: &str,
        reimbursement_signature: &str,
    ) -> AppResult<bool> {
        let mut claims = self.claims.write().await;
        match claims.get(original_signature) {
            Some(held) if held.reimbursement_transaction_signature == reimbursement_signature => {
                claims.remove(original_signature);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl FeeConfigStore for InMemoryLedger {
    async fn get_service_fee_config(&self, service_id: &str) -> AppResult<Option<ServiceFeeConfig>> {
        Ok(self.services.read().await.get(service_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::permit_fixture;

    #[tokio::test]
    async fn test_rejects_reused_nonce() {
        let ledger = InMemoryLedger::new();
        let first = permit_fixture("relayer", 1);
        ledger.insert_permit(&first).await.unwrap();

        let mut replay = permit_fixture("relayer", 1);
        replay.signature = vec![9; 64];
        let err = ledger.insert_permit(&replay).await.unwrap_err();
        assert!(matches!(err, AppError::Permit(PermitError::NonceReused { .. })));
    }

    #[tokio::test]
    async fn test_next_eligible_respects_nonce_order() {
        let ledger = InMemoryLedger::new();
        let low = permit_fixture("relayer", 1);
        let mut high = permit_fixture("relayer", 2);
        high.created_at = low.created_at - chrono::Duration::seconds(10);
        ledger.insert_permit(&low).await.unwrap();
        ledger.insert_permit(&high).await.unwrap();

        // Low nonce is backing off, high nonce must still wait
        ledger
            .transition(
                low.permit_id,
                PermitStatus::Pending,
                PermitUpdate::to(PermitStatus::Executing),
            )
            .await
            .unwrap();
        ledger
            .transition(
                low.permit_id,
                PermitStatus::Executing,
                PermitUpdate::to(PermitStatus::Pending)
                    .next_attempt_at(Utc::now() + chrono::Duration::seconds(60)),
            )
            .await
            .unwrap();

        let next = ledger.next_eligible("relayer", Utc::now()).await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let ledger = InMemoryLedger::new();
        let permit = permit_fixture("relayer", 1);
        ledger.insert_permit(&permit).await.unwrap();

        let err = ledger
            .transition(
                permit.permit_id,
                PermitStatus::Executing,
                PermitUpdate::to(PermitStatus::Executed),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    fn claim(reimbursement_signature: &str) -> ReimbursementClaim {
        ReimbursementClaim {
            original_transaction_signature: "orig".to_string(),
            reimbursement_transaction_signature: reimbursement_signature.to_string(),
            service_id: "svc".to_string(),
            gas_cost: 5_000,
            service_fee: 50,
            protocol_fee: 125,
            relayer_address: "relayer".to_string(),
            last_valid_block_height: 150,
            claimed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_first_claim_holds_original_signature() {
        let ledger = InMemoryLedger::new();

        let held = ledger.claim_reimbursement(&claim("first")).await.unwrap();
        assert_eq!(held.reimbursement_transaction_signature, "first");

        let held = ledger.claim_reimbursement(&claim("second")).await.unwrap();
        assert_eq!(held.reimbursement_transaction_signature, "first");

        // Only the holder can release it
        assert!(!ledger.release_reimbursement_claim("orig", "second").await.unwrap());
        assert!(ledger.release_reimbursement_claim("orig", "first").await.unwrap());
        assert!(ledger.get_reimbursement_claim("orig").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recording_clears_claim() {
        let ledger = InMemoryLedger::new();
        let held = ledger.claim_reimbursement(&claim("first")).await.unwrap();

        ledger.insert_reimbursement(&held.into_record(Utc::now())).await.unwrap();

        assert!(ledger.get_reimbursement_claim("orig").await.unwrap().is_none());
        assert_eq!(ledger.reimbursement_count().await, 1);
    }

    #[tokio::test]
    async fn test_orphaned_permits_are_listed_and_reassigned() {
        let ledger = InMemoryLedger::new();
        let live = permit_fixture("live", 1);
        let orphan = permit_fixture("retired", 2);
        let mut finished = permit_fixture("retired", 3);
        finished.status = PermitStatus::Failed;
        for permit in [&live, &orphan, &finished] {
            ledger.insert_permit(permit).await.unwrap();
        }

        let orphaned = ledger.list_orphaned(&["live".to_string()]).await.unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].permit_id, orphan.permit_id);

        assert!(ledger.reassign(orphan.permit_id, "live").await.unwrap());
        assert!(!ledger.reassign(finished.permit_id, "live").await.unwrap());
        assert!(ledger.list_orphaned(&["live".to_string()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_reimbursement_returns_first() {
        let ledger = InMemoryLedger::new();
        let record = ReimbursementRecord {
            original_transaction_signature: "orig".to_string(),
            reimbursement_transaction_signature: "first".to_string(),
            service_id: "svc".to_string(),
            gas_cost: 5_000,
            service_fee: 50,
            protocol_fee: 125,
            relayer_address: "relayer".to_string(),
            timestamp: Utc::now(),
        };
        ledger.insert_reimbursement(&record).await.unwrap();

        let mut second = record.clone();
        second.reimbursement_transaction_signature = "second".to_string();
        let stored = ledger.insert_reimbursement(&second).await.unwrap();

        assert_eq!(stored.reimbursement_transaction_signature, "first");
        assert_eq!(ledger.reimbursement_count().await, 1);
    }
}
