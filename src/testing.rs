//! Scripted collaborators for unit tests.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use solana_sdk::{hash::Hash, pubkey::Pubkey, signature::Signature, transaction::Transaction};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult, ExecutionError},
    execution::{
        client::{ChainClient, Confirmation, RecentBlockhash},
        gasless::LAMPORTS_PER_SIGNATURE,
    },
    ledger::models::{Permit, PermitStatus},
    notifications::{Alert, AlertSink, AlertType},
    settlement::reimbursement::reimburse_discriminator,
};

#[derive(Debug, Clone)]
enum Scripted {
    Confirm { fee: Option<u64>, report_fee: bool },
    OnChainError(String),
    ConfirmError(ExecutionError),
    SubmitError(ExecutionError),
    /// Lands on chain, but the confirmation wait times out
    LandsUnconfirmed,
}

/// In-memory chain. Each submission consumes the next scripted outcome, or
/// succeeds with the base signature fee when the script is empty.
#[derive(Default)]
pub struct MockChainClient {
    balances: Mutex<HashMap<Pubkey, u64>>,
    script: Mutex<VecDeque<Scripted>>,
    in_flight: Mutex<HashMap<Signature, (Transaction, Scripted)>>,
    submitted: Mutex<Vec<Transaction>>,
    landed: Mutex<HashMap<Signature, Confirmation>>,
    fail_balance_reads: AtomicBool,
    blockhash_counter: AtomicU64,
    block_height: AtomicU64,
    confirm_delay: Mutex<std::time::Duration>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, address: Pubkey, lamports: u64) {
        self.balances.lock().insert(address, lamports);
    }

    pub fn balance(&self, address: &Pubkey) -> u64 {
        self.balances.lock().get(address).copied().unwrap_or(0)
    }

    pub fn submitted(&self) -> Vec<Transaction> {
        self.submitted.lock().clone()
    }

    pub fn fail_balance_reads(&self, fail: bool) {
        self.fail_balance_reads.store(fail, Ordering::SeqCst);
    }

    /// Next transaction confirms and reports `fee`
    pub fn push_fee(&self, fee: u64) {
        self.script.lock().push_back(Scripted::Confirm { fee: Some(fee), report_fee: true });
    }

    /// Next transaction confirms, charges `fee`, but the receipt carries no fee
    pub fn push_unreported_fee(&self, fee: u64) {
        self.script.lock().push_back(Scripted::Confirm { fee: Some(fee), report_fee: false });
    }

    pub fn push_on_chain_error(&self, error: &str) {
        self.script.lock().push_back(Scripted::OnChainError(error.to_string()));
    }

    pub fn push_confirm_error(&self, error: ExecutionError) {
        self.script.lock().push_back(Scripted::ConfirmError(error));
    }

    pub fn push_submit_error(&self, error: ExecutionError) {
        self.script.lock().push_back(Scripted::SubmitError(error));
    }

    pub fn push_lands_unconfirmed(&self) {
        self.script.lock().push_back(Scripted::LandsUnconfirmed);
    }

    pub fn set_block_height(&self, height: u64) {
        self.block_height.store(height, Ordering::SeqCst);
    }

    /// Every confirmation wait sleeps this long before resolving
    pub fn set_confirm_delay(&self, delay: std::time::Duration) {
        *self.confirm_delay.lock() = delay;
    }

    fn land(&self, signature: Signature, confirmation: Confirmation) -> Confirmation {
        self.landed.lock().insert(signature, confirmation.clone());
        confirmation
    }

    fn debit(&self, address: &Pubkey, lamports: u64) {
        let mut balances = self.balances.lock();
        let entry = balances.entry(*address).or_insert(0);
        *entry = entry.saturating_sub(lamports);
    }

    fn credit(&self, address: &Pubkey, lamports: u64) {
        let mut balances = self.balances.lock();
        *balances.entry(*address).or_insert(0) += lamports;
    }

    /// Moves `gas_cost` from treasury to relayer for reimbursement calls
    fn apply_effects(&self, transaction: &Transaction) {
        let keys = &transaction.message.account_keys;
        let discriminator = reimburse_discriminator();
        for ix in &transaction.message.instructions {
            if ix.data.len() >= 16 && ix.data[..8] == discriminator && ix.accounts.len() >= 5 {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&ix.data[8..16]);
                let gas_cost = u64::from_le_bytes(raw);
                let treasury = keys[ix.accounts[3] as usize];
                let relayer = keys[ix.accounts[4] as usize];
                self.debit(&treasury, gas_cost);
                self.credit(&relayer, gas_cost);
            }
        }
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn get_balance(&self, address: &Pubkey) -> AppResult<u64> {
        if self.fail_balance_reads.load(Ordering::SeqCst) {
            return Err(AppError::Chain("balance read refused".to_string()));
        }
        Ok(self.balance(address))
    }

    async fn get_latest_blockhash(&self) -> Result<RecentBlockhash, ExecutionError> {
        let n = self.blockhash_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        Ok(RecentBlockhash {
            blockhash: Hash::new_from_array(bytes),
            last_valid_block_height: 150,
        })
    }

    async fn submit_transaction(&self, transaction: &Transaction) -> Result<Signature, ExecutionError> {
        let outcome = self.script.lock().pop_front().unwrap_or(Scripted::Confirm {
            fee: None,
            report_fee: true,
        });
        if let Scripted::SubmitError(err) = outcome {
            return Err(err);
        }

        let signature = transaction.signatures[0];
        self.submitted.lock().push(transaction.clone());
        self.in_flight
            .lock()
            .insert(signature, (transaction.clone(), outcome));
        Ok(signature)
    }

    async fn confirm_transaction(
        &self,
        signature: &Signature,
        _last_valid_block_height: u64,
    ) -> Result<Confirmation, ExecutionError> {
        let delay = *self.confirm_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (transaction, outcome) = self
            .in_flight
            .lock()
            .remove(signature)
            .ok_or_else(|| ExecutionError::Timeout(signature.to_string()))?;

        let payer = transaction.message.account_keys[0];
        let base_fee = transaction.signatures.len() as u64 * LAMPORTS_PER_SIGNATURE;

        match outcome {
            Scripted::Confirm { fee, report_fee } => {
                let fee = fee.unwrap_or(base_fee);
                self.debit(&payer, fee);
                self.apply_effects(&transaction);
                Ok(self.land(
                    *signature,
                    Confirmation {
                        ok: true,
                        fee: report_fee.then_some(fee),
                        error: None,
                    },
                ))
            }
            Scripted::OnChainError(error) => {
                self.debit(&payer, base_fee);
                Ok(self.land(
                    *signature,
                    Confirmation {
                        ok: false,
                        fee: Some(base_fee),
                        error: Some(error),
                    },
                ))
            }
            Scripted::LandsUnconfirmed => {
                self.debit(&payer, base_fee);
                self.apply_effects(&transaction);
                self.land(
                    *signature,
                    Confirmation {
                        ok: true,
                        fee: Some(base_fee),
                        error: None,
                    },
                );
                Err(ExecutionError::Timeout(signature.to_string()))
            }
            Scripted::ConfirmError(err) => Err(err),
            Scripted::SubmitError(err) => Err(err),
        }
    }

    async fn signature_status(&self, signature: &Signature) -> Result<Option<Confirmation>, ExecutionError> {
        Ok(self.landed.lock().get(signature).cloned())
    }

    async fn get_block_height(&self) -> Result<u64, ExecutionError> {
        Ok(self.block_height.load(Ordering::SeqCst))
    }
}

/// Keeps every alert it receives
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self, alert_type: AlertType) -> usize {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.alert_type == alert_type)
            .count()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

/// A pending permit one hour from expiry
pub fn permit_fixture(relayer: &str, nonce: u64) -> Permit {
    let now = Utc::now();
    Permit {
        permit_id: Uuid::new_v4(),
        user_address: "4Nd1mYwJqW3oGvFqKxXhBz7cU5tRkPe2sL9aD6fH8jQm".to_string(),
        service_id: "svc-1".to_string(),
        nonce,
        instruction_payload: vec![0; 4],
        target_program: Pubkey::new_unique().to_string(),
        expiry: now + Duration::hours(1),
        max_fee: 10_000_000,
        status: PermitStatus::Pending,
        retry_count: 0,
        transaction_signature: None,
        created_at: now,
        executed_at: None,
        relayer_address: relayer.to_string(),
        signature: nonce.to_le_bytes().repeat(8),
        gas_cost: None,
        last_error: None,
        next_attempt_at: now,
        updated_at: now,
    }
}
