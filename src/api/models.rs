use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::ledger::models::{Permit, PermitStatus, ReimbursementRecord};

const LAMPORTS_PER_SOL: i64 = 1_000_000_000;

// ========== REQUEST MODELS ==========

/// Signed permit submitted by a wallet
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePermitRequest {
    #[validate(length(min = 32, max = 44, message = "must be a base58 public key"))]
    pub user_public_key: String,

    #[validate(length(min = 1, max = 32, message = "must be 1 to 32 bytes"))]
    pub service_id: String,

    /// Base64 encoded instruction list
    #[validate(length(min = 1, message = "must not be empty"))]
    pub instruction_data: String,

    #[validate(length(min = 32, max = 44, message = "must be a base58 program id"))]
    pub target_program: String,

    /// Unix seconds
    #[validate(range(min = 1, message = "must be a unix timestamp"))]
    pub expiry: i64,

    #[validate(range(min = 1, message = "must be positive"))]
    pub max_fee: u64,

    pub nonce: u64,

    /// Base58 ed25519 signature over the permit message
    #[validate(length(min = 64, max = 90, message = "must be a base58 signature"))]
    pub signature: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListPermitsQuery {
    pub service_id: Option<String>,
    pub status: Option<String>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePermitResponse {
    pub permit_id: Uuid,
    pub nonce: u64,
    pub status: PermitStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateSignatureResponse {
    pub is_valid: bool,
    pub user_public_key: String,
    pub service_id: String,
    pub nonce: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitResponse {
    pub permit_id: Uuid,
    pub user_address: String,
    pub service_id: String,
    pub nonce: u64,
    pub target_program: String,
    pub status: PermitStatus,
    pub max_fee: u64,
    pub expiry: DateTime<Utc>,
    pub retry_count: u32,
    pub relayer_address: String,
    pub transaction_signature: Option<String>,
    pub gas_cost: Option<u64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl From<Permit> for PermitResponse {
    fn from(permit: Permit) -> Self {
        Self {
            permit_id: permit.permit_id,
            user_address: permit.user_address,
            service_id: permit.service_id,
            nonce: permit.nonce,
            target_program: permit.target_program,
            status: permit.status,
            max_fee: permit.max_fee,
            expiry: permit.expiry,
            retry_count: permit.retry_count,
            relayer_address: permit.relayer_address,
            transaction_signature: permit.transaction_signature,
            gas_cost: permit.gas_cost,
            last_error: permit.last_error,
            created_at: permit.created_at,
            executed_at: permit.executed_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReimbursementResponse {
    pub original_transaction_signature: String,
    pub reimbursement_transaction_signature: String,
    pub service_id: String,
    pub gas_cost: u64,
    pub service_fee: u64,
    pub protocol_fee: u64,
    pub relayer_address: String,
    pub timestamp: DateTime<Utc>,
}

impl From<ReimbursementRecord> for ReimbursementResponse {
    fn from(record: ReimbursementRecord) -> Self {
        Self {
            original_transaction_signature: record.original_transaction_signature,
            reimbursement_transaction_signature: record.reimbursement_transaction_signature,
            service_id: record.service_id,
            gas_cost: record.gas_cost,
            service_fee: record.service_fee,
            protocol_fee: record.protocol_fee,
            relayer_address: record.relayer_address,
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub address: String,
    pub lamports: u64,
    /// Display only
    pub sol: Decimal,
}

impl AccountBalance {
    pub fn new(address: String, lamports: u64) -> Self {
        Self {
            address,
            lamports,
            sol: lamports_to_sol(lamports),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesResponse {
    pub master_treasury: AccountBalance,
    pub relayers: Vec<AccountBalance>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub storage: String,
    pub relayers: usize,
}

pub fn lamports_to_sol(lamports: u64) -> Decimal {
    Decimal::from(lamports) / Decimal::from(LAMPORTS_PER_SOL)
}
