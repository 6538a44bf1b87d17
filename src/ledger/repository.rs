use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{prelude::FromRow, PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use super::models::*;
use super::store::{FeeConfigStore, PermitStore, ReimbursementStore};
use crate::error::{AppError, AppResult, PermitError};

const PERMIT_COLUMNS: &str = r#"
    permit_id, user_address, service_id, nonce, instruction_payload, target_program,
    expiry, max_fee, status, retry_count, transaction_signature, created_at, executed_at,
    relayer_address, signature, gas_cost, last_error, next_attempt_at, updated_at
"#;

/// Ledger repository - THE source of truth for permit and reimbursement state
pub struct LedgerRepository {
    pub pool: PgPool,
}

#[derive(Debug, FromRow)]
struct PermitRow {
    permit_id: Uuid,
    user_address: String,
    service_id: String,
    nonce: i64,
    instruction_payload: Vec<u8>,
    target_program: String,
    expiry: DateTime<Utc>,
    max_fee: i64,
    status: PermitStatus,
    retry_count: i32,
    transaction_signature: Option<String>,
    created_at: DateTime<Utc>,
    executed_at: Option<DateTime<Utc>>,
    relayer_address: String,
    signature: Vec<u8>,
    gas_cost: Option<i64>,
    last_error: Option<String>,
    next_attempt_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PermitRow> for Permit {
    fn from(row: PermitRow) -> Self {
        Permit {
            permit_id: row.permit_id,
            user_address: row.user_address,
            service_id: row.service_id,
            nonce: row.nonce as u64,
            instruction_payload: row.instruction_payload,
            target_program: row.target_program,
            expiry: row.expiry,
            max_fee: row.max_fee as u64,
            status: row.status,
            retry_count: row.retry_count.max(0) as u32,
            transaction_signature: row.transaction_signature,
            created_at: row.created_at,
            executed_at: row.executed_at,
            relayer_address: row.relayer_address,
            signature: row.signature,
            gas_cost: row.gas_cost.map(|g| g as u64),
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ReimbursementRow {
    original_transaction_signature: String,
    reimbursement_transaction_signature: String,
    service_id: String,
    gas_cost: i64,
    service_fee: i64,
    protocol_fee: i64,
    relayer_address: String,
    created_at: DateTime<Utc>,
}

impl From<ReimbursementRow> for ReimbursementRecord {
    fn from(row: ReimbursementRow) -> Self {
        ReimbursementRecord {
            original_transaction_signature: row.original_transaction_signature,
            reimbursement_transaction_signature: row.reimbursement_transaction_signature,
            service_id: row.service_id,
            gas_cost: row.gas_cost as u64,
            service_fee: row.service_fee as u64,
            protocol_fee: row.protocol_fee as u64,
            relayer_address: row.relayer_address,
            timestamp: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ClaimRow {
    original_transaction_signature: String,
    reimbursement_transaction_signature: String,
    service_id: String,
    gas_cost: i64,
    service_fee: i64,
    protocol_fee: i64,
    relayer_address: String,
    last_valid_block_height: i64,
    claimed_at: DateTime<Utc>,
}

impl From<ClaimRow> for ReimbursementClaim {
    fn from(row: ClaimRow) -> Self {
        ReimbursementClaim {
            original_transaction_signature: row.original_transaction_signature,
            reimbursement_transaction_signature: row.reimbursement_transaction_signature,
            service_id: row.service_id,
            gas_cost: row.gas_cost as u64,
            service_fee: row.service_fee as u64,
            protocol_fee: row.protocol_fee as u64,
            relayer_address: row.relayer_address,
            last_valid_block_height: row.last_valid_block_height as u64,
            claimed_at: row.claimed_at,
        }
    }
}

const CLAIM_COLUMNS: &str = r#"
    original_transaction_signature, reimbursement_transaction_signature, service_id,
    gas_cost, service_fee, protocol_fee, relayer_address, last_valid_block_height, claimed_at
"#;

#[derive(Debug, FromRow)]
struct ServiceRow {
    service_id: String,
    service_fee_bps: i32,
    protocol_fee_bps: i32,
    is_active: bool,
    allowed_programs: Vec<String>,
}

fn to_i64(value: u64, field: &str) -> AppResult<i64> {
    i64::try_from(value).map_err(|_| AppError::InvalidInput(format!("{} out of range: {}", field, value)))
}

fn to_bps(value: i32) -> AppResult<u16> {
    u16::try_from(value).map_err(|_| AppError::Internal(format!("Stored fee bps out of range: {}", value)))
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Upserts a tenant's fee configuration
    pub async fn upsert_service(&self, config: &ServiceFeeConfig) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO services (service_id, service_fee_bps, is_active, allowed_programs)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (service_id) DO UPDATE
            SET service_fee_bps = EXCLUDED.service_fee_bps,
                is_active = EXCLUDED.is_active,
                allowed_programs = EXCLUDED.allowed_programs,
                updated_at = NOW()
            "#,
        )
        .bind(&config.service_id)
        .bind(config.service_fee_bps as i32)
        .bind(config.is_active)
        .bind(&config.allowed_programs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Seeds the protocol fee row unless an operator already set one
    pub async fn ensure_protocol_fee(&self, protocol_fee_bps: u16) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO protocol_config (id, protocol_fee_bps)
            VALUES (TRUE, $1)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(protocol_fee_bps as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn log_audit_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_type: AuditEventType,
        permit_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (event_type, permit_id, details)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(event_type)
        .bind(permit_id)
        .bind(details)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

fn map_unique_violation(err: sqlx::Error, nonce: u64) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.constraint() {
            Some("permits_pair_nonce_key") => {
                return PermitError::NonceReused { nonce, last: nonce }.into();
            }
            Some("permits_signature_key") => return PermitError::SignatureReplayed.into(),
            _ => {}
        }
    }
    AppError::Database(err)
}

#[async_trait]
impl PermitStore for LedgerRepository {
    async fn insert_permit(&self, permit: &Permit) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        // Serialize intake per pair so the monotonic check and insert are atomic
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || $2))")
            .bind(&permit.user_address)
            .bind(&permit.service_id)
            .execute(&mut *tx)
            .await?;

        let last: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(nonce) FROM permits WHERE user_address = $1 AND service_id = $2",
        )
        .bind(&permit.user_address)
        .bind(&permit.service_id)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(last) = last {
            if permit.nonce <= last as u64 {
                return Err(PermitError::NonceReused { nonce: permit.nonce, last: last as u64 }.into());
            }
        }

        sqlx::query(
            r#"
            INSERT INTO permits (
                permit_id, user_address, service_id, nonce, instruction_payload, target_program,
                expiry, max_fee, status, retry_count, relayer_address, signature,
                next_attempt_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10, $11, $12, $13, $13)
            "#,
        )
        .bind(permit.permit_id)
        .bind(&permit.user_address)
        .bind(&permit.service_id)
        .bind(to_i64(permit.nonce, "nonce")?)
        .bind(&permit.instruction_payload)
        .bind(&permit.target_program)
        .bind(permit.expiry)
        .bind(to_i64(permit.max_fee, "max_fee")?)
        .bind(PermitStatus::Pending)
        .bind(&permit.relayer_address)
        .bind(&permit.signature)
        .bind(permit.next_attempt_at)
        .bind(permit.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique_violation(e, permit.nonce))?;

        self.log_audit_event(
            &mut tx,
            AuditEventType::PermitAccepted,
            Some(permit.permit_id),
            serde_json::json!({
                "user": permit.user_address,
                "service_id": permit.service_id,
                "nonce": permit.nonce,
                "relayer": permit.relayer_address,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_permit(&self, permit_id: Uuid) -> AppResult<Option<Permit>> {
        let row = sqlx::query_as::<_, PermitRow>(&format!(
            "SELECT {} FROM permits WHERE permit_id = $1",
            PERMIT_COLUMNS
        ))
        .bind(permit_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Permit::from))
    }

    async fn last_nonce(&self, user_address: &str, service_id: &str) -> AppResult<Option<u64>> {
        let last: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(nonce) FROM permits WHERE user_address = $1 AND service_id = $2",
        )
        .bind(user_address)
        .bind(service_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(last.map(|n| n as u64))
    }

    async fn signature_exists(&self, signature: &[u8]) -> AppResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM permits WHERE signature = $1)")
                .bind(signature)
                .fetch_one(&self.pool)
                .await?;

        Ok(exists)
    }

    async fn next_eligible(
        &self,
        relayer_address: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Permit>> {
        let row = sqlx::query_as::<_, PermitRow>(&format!(
            r#"
            SELECT {} FROM permits p
            WHERE p.relayer_address = $1
              AND p.status = 'pending'
              AND p.next_attempt_at <= $2
              AND NOT EXISTS (
                  SELECT 1 FROM permits earlier
                  WHERE earlier.user_address = p.user_address
                    AND earlier.service_id = p.service_id
                    AND earlier.nonce < p.nonce
                    AND earlier.status IN ('pending', 'executing')
              )
            ORDER BY p.created_at ASC, p.nonce ASC
            LIMIT 1
            "#,
            PERMIT_COLUMNS
        ))
        .bind(relayer_address)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Permit::from))
    }

    async fn transition(
        &self,
        permit_id: Uuid,
        from: PermitStatus,
        update: PermitUpdate,
    ) -> AppResult<Permit> {
        if !from.can_transition_to(update.status) {
            return Err(AppError::InvalidTransition { from, to: update.status });
        }

        let gas_cost = update.gas_cost.map(|g| to_i64(g, "gas_cost")).transpose()?;
        let mut tx = self.begin_tx().await?;

        let row = sqlx::query_as::<_, PermitRow>(&format!(
            r#"
            UPDATE permits
            SET status = $3,
                retry_count = COALESCE($4, retry_count),
                transaction_signature = COALESCE($5, transaction_signature),
                gas_cost = COALESCE($6, gas_cost),
                executed_at = COALESCE($7, executed_at),
                last_error = COALESCE($8, last_error),
                next_attempt_at = COALESCE($9, next_attempt_at),
                updated_at = NOW()
            WHERE permit_id = $1 AND status = $2
            RETURNING {}
            "#,
            PERMIT_COLUMNS
        ))
        .bind(permit_id)
        .bind(from)
        .bind(update.status)
        .bind(update.retry_count.map(|n| n as i32))
        .bind(&update.transaction_signature)
        .bind(gas_cost)
        .bind(update.executed_at)
        .bind(&update.last_error)
        .bind(update.next_attempt_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            let current = self
                .get_permit(permit_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Permit {} not found", permit_id)))?;
            return Err(AppError::InvalidTransition { from: current.status, to: update.status });
        };

        self.log_audit_event(
            &mut tx,
            AuditEventType::PermitTransition,
            Some(permit_id),
            serde_json::json!({
                "from": from,
                "to": update.status,
                "retry_count": row.retry_count,
                "reason": update.last_error,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(Permit::from(row))
    }

    async fn list_expired(&self, relayer_address: &str, now: DateTime<Utc>) -> AppResult<Vec<Permit>> {
        let rows = sqlx::query_as::<_, PermitRow>(&format!(
            r#"
            SELECT {} FROM permits
            WHERE relayer_address = $1
              AND status IN ('pending', 'executing')
              AND expiry <= $2
            "#,
            PERMIT_COLUMNS
        ))
        .bind(relayer_address)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Permit::from).collect())
    }

    async fn list_by_status(&self, relayer_address: &str, status: PermitStatus) -> AppResult<Vec<Permit>> {
        let rows = sqlx::query_as::<_, PermitRow>(&format!(
            "SELECT {} FROM permits WHERE relayer_address = $1 AND status = $2",
            PERMIT_COLUMNS
        ))
        .bind(relayer_address)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Permit::from).collect())
    }

    async fn list_by_user(
        &self,
        user_address: &str,
        service_id: Option<&str>,
        status: Option<PermitStatus>,
    ) -> AppResult<Vec<Permit>> {
        let rows = sqlx::query_as::<_, PermitRow>(&format!(
            r#"
            SELECT {} FROM permits
            WHERE user_address = $1
              AND ($2::TEXT IS NULL OR service_id = $2)
              AND ($3::permit_status IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT 200
            "#,
            PERMIT_COLUMNS
        ))
        .bind(user_address)
        .bind(service_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Permit::from).collect())
    }

    async fn list_unreimbursed(&self, relayer_address: &str, limit: usize) -> AppResult<Vec<Permit>> {
        let rows = sqlx::query_as::<_, PermitRow>(&format!(
            r#"
            SELECT {} FROM permits p
            WHERE p.relayer_address = $1
              AND p.status = 'executed'
              AND p.gas_cost IS NOT NULL
              AND p.transaction_signature IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM reimbursements r
                  WHERE r.original_transaction_signature = p.transaction_signature
              )
            ORDER BY p.executed_at ASC
            LIMIT $2
            "#,
            PERMIT_COLUMNS
        ))
        .bind(relayer_address)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Permit::from).collect())
    }

    async fn list_orphaned(&self, relayers: &[String]) -> AppResult<Vec<Permit>> {
        let rows = sqlx::query_as::<_, PermitRow>(&format!(
            r#"
            SELECT {} FROM permits
            WHERE status IN ('pending', 'executing')
              AND NOT (relayer_address = ANY($1))
            ORDER BY created_at ASC
            "#,
            PERMIT_COLUMNS
        ))
        .bind(relayers)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Permit::from).collect())
    }

    async fn reassign(&self, permit_id: Uuid, relayer_address: &str) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        let previous: Option<String> = sqlx::query_scalar(
            r#"
            SELECT relayer_address FROM permits
            WHERE permit_id = $1 AND status IN ('pending', 'executing')
            FOR UPDATE
            "#,
        )
        .bind(permit_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(previous) = previous else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query("UPDATE permits SET relayer_address = $2, updated_at = NOW() WHERE permit_id = $1")
            .bind(permit_id)
            .bind(relayer_address)
            .execute(&mut *tx)
            .await?;

        self.log_audit_event(
            &mut tx,
            AuditEventType::PermitReassigned,
            Some(permit_id),
            serde_json::json!({ "from": previous, "to": relayer_address }),
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl ReimbursementStore for LedgerRepository {
    async fn get_reimbursement(
        &self,
        original_signature: &str,
    ) -> AppResult<Option<ReimbursementRecord>> {
        let row = sqlx::query_as::<_, ReimbursementRow>(
            r#"
            SELECT original_transaction_signature, reimbursement_transaction_signature,
                   service_id, gas_cost, service_fee, protocol_fee, relayer_address, created_at
            FROM reimbursements
            WHERE original_transaction_signature = $1
            "#,
        )
        .bind(original_signature)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ReimbursementRecord::from))
    }

    async fn insert_reimbursement(
        &self,
        record: &ReimbursementRecord,
    ) -> AppResult<ReimbursementRecord> {
        let mut tx = self.begin_tx().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO reimbursements (
                original_transaction_signature, reimbursement_transaction_signature,
                service_id, gas_cost, service_fee, protocol_fee, relayer_address, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (original_transaction_signature) DO NOTHING
            "#,
        )
        .bind(&record.original_transaction_signature)
        .bind(&record.reimbursement_transaction_signature)
        .bind(&record.service_id)
        .bind(to_i64(record.gas_cost, "gas_cost")?)
        .bind(to_i64(record.service_fee, "service_fee")?)
        .bind(to_i64(record.protocol_fee, "protocol_fee")?)
        .bind(&record.relayer_address)
        .bind(record.timestamp)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            info!(
                "Reimbursement for {} already recorded, keeping existing row",
                record.original_transaction_signature
            );
            return self
                .get_reimbursement(&record.original_transaction_signature)
                .await?
                .ok_or_else(|| AppError::Internal("Reimbursement conflict without a row".to_string()));
        }

        sqlx::query("DELETE FROM reimbursement_claims WHERE original_transaction_signature = $1")
            .bind(&record.original_transaction_signature)
            .execute(&mut *tx)
            .await?;

        self.log_audit_event(
            &mut tx,
            AuditEventType::ReimbursementRecorded,
            None,
            serde_json::json!({
                "original_signature": record.original_transaction_signature,
                "reimbursement_signature": record.reimbursement_transaction_signature,
                "gas_cost": record.gas_cost,
                "service_fee": record.service_fee,
                "protocol_fee": record.protocol_fee,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(record.clone())
    }

    async fn get_reimbursement_claim(
        &self,
        original_signature: &str,
    ) -> AppResult<Option<ReimbursementClaim>> {
        let row = sqlx::query_as::<_, ClaimRow>(&format!(
            "SELECT {} FROM reimbursement_claims WHERE original_transaction_signature = $1",
            CLAIM_COLUMNS
        ))
        .bind(original_signature)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ReimbursementClaim::from))
    }

    async fn claim_reimbursement(&self, claim: &ReimbursementClaim) -> AppResult<ReimbursementClaim> {
        let mut tx = self.begin_tx().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO reimbursement_claims (
                original_transaction_signature, reimbursement_transaction_signature, service_id,
                gas_cost, service_fee, protocol_fee, relayer_address, last_valid_block_height, claimed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (original_transaction_signature) DO NOTHING
            "#,
        )
        .bind(&claim.original_transaction_signature)
        .bind(&claim.reimbursement_transaction_signature)
        .bind(&claim.service_id)
        .bind(to_i64(claim.gas_cost, "gas_cost")?)
        .bind(to_i64(claim.service_fee, "service_fee")?)
        .bind(to_i64(claim.protocol_fee, "protocol_fee")?)
        .bind(&claim.relayer_address)
        .bind(to_i64(claim.last_valid_block_height, "last_valid_block_height")?)
        .bind(claim.claimed_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return self
                .get_reimbursement_claim(&claim.original_transaction_signature)
                .await?
                .ok_or_else(|| AppError::Internal("Claim conflict without a row".to_string()));
        }

        self.log_audit_event(
            &mut tx,
            AuditEventType::ReimbursementClaimed,
            None,
            serde_json::json!({
                "original_signature": claim.original_transaction_signature,
                "reimbursement_signature": claim.reimbursement_transaction_signature,
                "gas_cost": claim.gas_cost,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(claim.clone())
    }

    async fn release_reimbursement_claim(
        &self,
        original_signature: &str,
        reimbursement_signature: &str,
    ) -> AppResult<bool> {
        let mut tx = self.begin_tx().await?;

        let released = sqlx::query(
            r#"
            DELETE FROM reimbursement_claims
            WHERE original_transaction_signature = $1
              AND reimbursement_transaction_signature = $2
            "#,
        )
        .bind(original_signature)
        .bind(reimbursement_signature)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if released == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        self.log_audit_event(
            &mut tx,
            AuditEventType::ReimbursementReleased,
            None,
            serde_json::json!({
                "original_signature": original_signature,
                "reimbursement_signature": reimbursement_signature,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl FeeConfigStore for LedgerRepository {
    async fn get_service_fee_config(&self, service_id: &str) -> AppResult<Option<ServiceFeeConfig>> {
        let row = sqlx::query_as::<_, ServiceRow>(
            r#"
            SELECT s.service_id, s.service_fee_bps,
                   COALESCE((SELECT protocol_fee_bps FROM protocol_config WHERE id), 0) AS protocol_fee_bps,
                   s.is_active, s.allowed_programs
            FROM services s
            WHERE s.service_id = $1
            "#,
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ServiceFeeConfig {
                service_id: row.service_id,
                protocol_fee_bps: to_bps(row.protocol_fee_bps)?,
                service_fee_bps: to_bps(row.service_fee_bps)?,
                is_active: row.is_active,
                allowed_programs: row.allowed_programs,
            })
        })
        .transpose()
    }
}
