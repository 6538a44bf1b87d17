use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a permit. `Executed`, `Failed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "permit_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PermitStatus {
    Pending,
    Executing,
    Executed,
    Failed,
    Expired,
}

impl fmt::Display for PermitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PermitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermitStatus::Pending => "pending",
            PermitStatus::Executing => "executing",
            PermitStatus::Executed => "executed",
            PermitStatus::Failed => "failed",
            PermitStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PermitStatus::Executed | PermitStatus::Failed | PermitStatus::Expired
        )
    }

    /// `Executing -> Pending` is the requeue edge after a retryable failure.
    /// `Pending -> Failed` covers crash recovery hitting the retry ceiling.
    /// `Pending -> Pending` reschedules a deferred permit.
    pub fn can_transition_to(&self, next: PermitStatus) -> bool {
        use PermitStatus::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Pending)
                | (Pending, Expired)
                | (Pending, Failed)
                | (Executing, Executed)
                | (Executing, Failed)
                | (Executing, Expired)
                | (Executing, Pending)
        )
    }
}

impl std::str::FromStr for PermitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(PermitStatus::Pending),
            "executing" => Ok(PermitStatus::Executing),
            "executed" => Ok(PermitStatus::Executed),
            "failed" => Ok(PermitStatus::Failed),
            "expired" => Ok(PermitStatus::Expired),
            other => Err(format!("unknown permit status: {}", other)),
        }
    }
}

/// A queued, fee-sponsored user request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permit {
    pub permit_id: Uuid,
    pub user_address: String,
    pub service_id: String,
    pub nonce: u64,
    pub instruction_payload: Vec<u8>,
    pub target_program: String,
    pub expiry: DateTime<Utc>,
    pub max_fee: u64,
    pub status: PermitStatus,
    pub retry_count: u32,
    pub transaction_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,

    /// Relayer queue this permit is sharded to
    pub relayer_address: String,
    /// User's off-chain ed25519 signature over the permit fields
    pub signature: Vec<u8>,
    pub gas_cost: Option<u64>,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Permit {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

/// Validated intake data, before a permit id and relayer are assigned
#[derive(Debug, Clone)]
pub struct NewPermit {
    pub user_address: String,
    pub service_id: String,
    pub nonce: u64,
    pub instruction_payload: Vec<u8>,
    pub target_program: String,
    pub expiry: DateTime<Utc>,
    pub max_fee: u64,
    pub signature: Vec<u8>,
}

/// Compare-and-set update applied by the processor
#[derive(Debug, Clone)]
pub struct PermitUpdate {
    pub status: PermitStatus,
    pub retry_count: Option<u32>,
    pub transaction_signature: Option<String>,
    pub gas_cost: Option<u64>,
    pub executed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl PermitUpdate {
    pub fn to(status: PermitStatus) -> Self {
        Self {
            status,
            retry_count: None,
            transaction_signature: None,
            gas_cost: None,
            executed_at: None,
            last_error: None,
            next_attempt_at: None,
        }
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn error(mut self, reason: impl Into<String>) -> Self {
        self.last_error = Some(reason.into());
        self
    }

    pub fn next_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    pub fn executed(mut self, signature: String, gas_cost: u64, at: DateTime<Utc>) -> Self {
        self.transaction_signature = Some(signature);
        self.gas_cost = Some(gas_cost);
        self.executed_at = Some(at);
        self
    }

    /// Applies the update to an in-memory copy. Fields left `None` are kept.
    pub fn apply(&self, permit: &mut Permit, now: DateTime<Utc>) {
        permit.status = self.status;
        if let Some(retry_count) = self.retry_count {
            permit.retry_count = retry_count;
        }
        if let Some(signature) = &self.transaction_signature {
            permit.transaction_signature = Some(signature.clone());
        }
        if let Some(gas_cost) = self.gas_cost {
            permit.gas_cost = Some(gas_cost);
        }
        if let Some(executed_at) = self.executed_at {
            permit.executed_at = Some(executed_at);
        }
        if let Some(reason) = &self.last_error {
            permit.last_error = Some(reason.clone());
        }
        if let Some(at) = self.next_attempt_at {
            permit.next_attempt_at = at;
        }
        permit.updated_at = now;
    }
}

/// Evidence that a relayer was made whole for one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReimbursementRecord {
    pub original_transaction_signature: String,
    pub reimbursement_transaction_signature: String,
    pub service_id: String,
    pub gas_cost: u64,
    pub service_fee: u64,
    pub protocol_fee: u64,
    pub relayer_address: String,
    pub timestamp: DateTime<Utc>,
}

/// A signed reimbursement persisted before it is submitted. At most one
/// exists per original signature, so any other caller resolves this one by
/// its signature instead of sending a second transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReimbursementClaim {
    pub original_transaction_signature: String,
    pub reimbursement_transaction_signature: String,
    pub service_id: String,
    pub gas_cost: u64,
    pub service_fee: u64,
    pub protocol_fee: u64,
    pub relayer_address: String,
    /// Past this block height the signed transaction can no longer land
    pub last_valid_block_height: u64,
    pub claimed_at: DateTime<Utc>,
}

impl ReimbursementClaim {
    pub fn into_record(self, timestamp: DateTime<Utc>) -> ReimbursementRecord {
        ReimbursementRecord {
            original_transaction_signature: self.original_transaction_signature,
            reimbursement_transaction_signature: self.reimbursement_transaction_signature,
            service_id: self.service_id,
            gas_cost: self.gas_cost,
            service_fee: self.service_fee,
            protocol_fee: self.protocol_fee,
            relayer_address: self.relayer_address,
            timestamp,
        }
    }
}

/// Per-tenant fee configuration and program whitelist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceFeeConfig {
    pub service_id: String,
    pub protocol_fee_bps: u16,
    pub service_fee_bps: u16,
    pub is_active: bool,
    /// Empty means any program
    pub allowed_programs: Vec<String>,
}

impl ServiceFeeConfig {
    pub fn allows_program(&self, program: &str) -> bool {
        self.allowed_programs.is_empty() || self.allowed_programs.iter().any(|p| p == program)
    }
}

/// Relayer and treasury balances read right before an admission check. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub relayer_balance: u64,
    pub treasury_balance: u64,
    pub taken_at: DateTime<Utc>,
}

/// Audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "audit_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    PermitAccepted,
    PermitTransition,
    PermitReassigned,
    ReimbursementClaimed,
    ReimbursementReleased,
    ReimbursementRecorded,
}
