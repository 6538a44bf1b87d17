use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult, ExecutionError},
    execution::gasless::{ExecutionReceipt, GaslessExecutor},
    ledger::{
        models::{Permit, PermitStatus, PermitUpdate},
        store::PermitStore,
    },
    notifications::{Alert, AlertType, Alerter, Severity},
    risk::controls::{Admission, DeferReason, TreasuryBalanceGuard},
    settlement::{
        reimbursement::{ReimbursementEngine, ReimbursementOutcome},
        ReconcileSummary, SettlementReconciler,
    },
};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_retries: u32,
    /// Lamports assumed per execution when sizing the balance guard
    pub estimated_fee: u64,
    pub poll_interval: Duration,
    pub expiry_sweep_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub defer_delay: Duration,
    pub reconcile_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            estimated_fee: 5_000,
            poll_interval: Duration::from_secs(1),
            expiry_sweep_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            defer_delay: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

impl ProcessorConfig {
    /// `min(base * 2^(attempt - 1), max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Expired {
        permit_id: Uuid,
    },
    /// Guard said no. The permit stays pending and keeps its retry count.
    Deferred {
        permit_id: Uuid,
        reason: String,
    },
    Executed {
        permit_id: Uuid,
        receipt: ExecutionReceipt,
        reimbursement: ReimbursementOutcome,
    },
    Retrying {
        permit_id: Uuid,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        permit_id: Uuid,
        reason: String,
    },
}

/// Drains one relayer's share of the queue, one permit at a time, and
/// retries that relayer's missing reimbursements between permits.
pub struct PermitProcessor {
    config: ProcessorConfig,
    permits: Arc<dyn PermitStore>,
    guard: TreasuryBalanceGuard,
    executor: GaslessExecutor,
    reimbursement: Arc<ReimbursementEngine>,
    reconciler: SettlementReconciler,
    alerter: Arc<Alerter>,
    relayer_address: String,
}

impl PermitProcessor {
    pub fn new(
        config: ProcessorConfig,
        permits: Arc<dyn PermitStore>,
        guard: TreasuryBalanceGuard,
        executor: GaslessExecutor,
        reimbursement: Arc<ReimbursementEngine>,
        alerter: Arc<Alerter>,
    ) -> Self {
        let relayer_address = executor.relayer_pubkey().to_string();
        let reconciler = SettlementReconciler::new(permits.clone(), reimbursement.clone());
        Self {
            config,
            permits,
            guard,
            executor,
            reimbursement,
            reconciler,
            alerter,
            relayer_address,
        }
    }

    pub fn relayer_address(&self) -> &str {
        &self.relayer_address
    }

    /// Runs one attempt on the next eligible permit. `None` means nothing is due.
    #[instrument(skip_all, fields(relayer = %self.relayer_address))]
    pub async fn process_next(&self) -> AppResult<Option<ProcessOutcome>> {
        let now = Utc::now();
        let Some(permit) = self.permits.next_eligible(&self.relayer_address, now).await? else {
            return Ok(None);
        };

        if permit.is_expired_at(now) {
            self.permits
                .transition(
                    permit.permit_id,
                    PermitStatus::Pending,
                    PermitUpdate::to(PermitStatus::Expired).error("expired before execution"),
                )
                .await?;
            info!("⌛ Permit {} expired before execution", permit.permit_id);
            return Ok(Some(ProcessOutcome::Expired {
                permit_id: permit.permit_id,
            }));
        }

        match self.guard.check_admission(self.config.estimated_fee).await {
            Ok(Admission::Admit(_)) => {}
            Ok(Admission::Defer(reason)) => {
                self.alert_defer(&reason).await;
                return self.defer(&permit, reason.to_string()).await.map(Some);
            }
            Err(e) => {
                warn!("Balance check failed, deferring permit {}: {}", permit.permit_id, e);
                return self
                    .defer(&permit, format!("balance check failed: {}", e))
                    .await
                    .map(Some);
            }
        }

        let executing = self
            .permits
            .transition(
                permit.permit_id,
                PermitStatus::Pending,
                PermitUpdate::to(PermitStatus::Executing),
            )
            .await?;

        match self.executor.execute(&executing).await {
            Ok(receipt) => self.complete(&executing, receipt).await.map(Some),
            Err(e) => self.handle_failure(&executing, e).await.map(Some),
        }
    }

    async fn defer(&self, permit: &Permit, reason: String) -> AppResult<ProcessOutcome> {
        let next_attempt_at = after(Utc::now(), self.config.defer_delay);
        self.permits
            .transition(
                permit.permit_id,
                PermitStatus::Pending,
                PermitUpdate::to(PermitStatus::Pending)
                    .error(reason.clone())
                    .next_attempt_at(next_attempt_at),
            )
            .await?;

        debug!("Permit {} deferred until {}", permit.permit_id, next_attempt_at);
        Ok(ProcessOutcome::Deferred {
            permit_id: permit.permit_id,
            reason,
        })
    }

    async fn alert_defer(&self, reason: &DeferReason) {
        let alert_type = reason.alert_type();
        let severity = match reason {
            DeferReason::TreasuryBalanceLow { .. } => Severity::Critical,
            DeferReason::RelayerBalanceLow { .. } => Severity::High,
        };
        let cause = format!("{:?}:{}", alert_type, self.relayer_address);
        self.alerter
            .send_throttled(
                &cause,
                Alert::new(
                    alert_type,
                    severity,
                    format!("Relayer {}: {}", self.relayer_address, reason),
                ),
            )
            .await;
    }

    async fn complete(&self, permit: &Permit, receipt: ExecutionReceipt) -> AppResult<ProcessOutcome> {
        let mut update = PermitUpdate::to(PermitStatus::Executed).executed(
            receipt.transaction_signature.clone(),
            receipt.gas_cost,
            Utc::now(),
        );
        // Already on chain, so an overrun is recorded rather than undone
        if receipt.gas_cost > permit.max_fee {
            warn!(
                "Permit {} cost {} lamports, above its max fee {}",
                permit.permit_id, receipt.gas_cost, permit.max_fee
            );
            update = update.error(format!(
                "gas cost {} exceeded max fee {}",
                receipt.gas_cost, permit.max_fee
            ));
        }

        self.permits
            .transition(permit.permit_id, PermitStatus::Executing, update)
            .await?;

        let relayer = self.executor.relayer_keypair();
        let reimbursement = self
            .reimbursement
            .reimburse(
                &relayer,
                &permit.service_id,
                receipt.gas_cost,
                &receipt.transaction_signature,
            )
            .await;

        if let ReimbursementOutcome::NotReimbursed { reason } = &reimbursement {
            self.alerter
                .send(Alert::new(
                    AlertType::ReimbursementFailed,
                    Severity::High,
                    format!(
                        "Reimbursement of {} lamports for {} (permit {}) failed: {}",
                        receipt.gas_cost, receipt.transaction_signature, permit.permit_id, reason
                    ),
                ))
                .await;
        }

        Ok(ProcessOutcome::Executed {
            permit_id: permit.permit_id,
            receipt,
            reimbursement,
        })
    }

    async fn handle_failure(&self, permit: &Permit, err: ExecutionError) -> AppResult<ProcessOutcome> {
        let retry_count = permit.retry_count.saturating_add(1);
        let reason = err.to_string();

        if !err.is_retryable() || retry_count > self.config.max_retries {
            self.permits
                .transition(
                    permit.permit_id,
                    PermitStatus::Executing,
                    PermitUpdate::to(PermitStatus::Failed)
                        .retry_count(retry_count)
                        .error(reason.clone()),
                )
                .await?;

            error!(
                "❌ Permit {} failed after {} attempt(s): {}",
                permit.permit_id, retry_count, reason
            );
            self.alerter
                .send(Alert::new(
                    AlertType::PermitFailed,
                    Severity::Medium,
                    format!("Permit {} for {} failed: {}", permit.permit_id, permit.user_address, reason),
                ))
                .await;

            return Ok(ProcessOutcome::Failed {
                permit_id: permit.permit_id,
                reason,
            });
        }

        let next_attempt_at = after(Utc::now(), self.config.backoff(retry_count));
        self.permits
            .transition(
                permit.permit_id,
                PermitStatus::Executing,
                PermitUpdate::to(PermitStatus::Pending)
                    .retry_count(retry_count)
                    .error(reason.clone())
                    .next_attempt_at(next_attempt_at),
            )
            .await?;

        warn!(
            "🔄 Permit {} attempt {} failed, retrying at {}: {}",
            permit.permit_id, retry_count, next_attempt_at, reason
        );

        Ok(ProcessOutcome::Retrying {
            permit_id: permit.permit_id,
            retry_count,
            next_attempt_at,
        })
    }

    /// Expires every overdue non-terminal permit of this relayer.
    pub async fn sweep_expired(&self) -> AppResult<usize> {
        let now = Utc::now();
        let mut expired = 0;

        for permit in self.permits.list_expired(&self.relayer_address, now).await? {
            match self
                .permits
                .transition(
                    permit.permit_id,
                    permit.status,
                    PermitUpdate::to(PermitStatus::Expired).error("expired before execution"),
                )
                .await
            {
                Ok(_) => expired += 1,
                Err(AppError::InvalidTransition { from, .. }) => {
                    debug!("Permit {} moved to {} before it could expire", permit.permit_id, from);
                }
                Err(e) => return Err(e),
            }
        }

        if expired > 0 {
            info!("⌛ Expired {} permit(s)", expired);
        }
        Ok(expired)
    }

    /// Retries reimbursement for this relayer's executed permits that have none.
    pub async fn reconcile(&self) -> AppResult<ReconcileSummary> {
        let relayer = self.executor.relayer_keypair();
        self.reconciler.reconcile_relayer(&relayer).await
    }

    /// Permits left `executing` by a previous run count as a failed attempt.
    pub async fn recover_interrupted(&self) -> AppResult<usize> {
        let interrupted = self
            .permits
            .list_by_status(&self.relayer_address, PermitStatus::Executing)
            .await?;

        for permit in &interrupted {
            let retry_count = permit.retry_count.saturating_add(1);
            let update = if retry_count > self.config.max_retries {
                PermitUpdate::to(PermitStatus::Failed)
            } else {
                PermitUpdate::to(PermitStatus::Pending).next_attempt_at(Utc::now())
            };

            self.permits
                .transition(
                    permit.permit_id,
                    PermitStatus::Executing,
                    update
                        .retry_count(retry_count)
                        .error("interrupted during execution"),
                )
                .await?;
        }

        if !interrupted.is_empty() {
            warn!("Recovered {} interrupted permit(s)", interrupted.len());
        }
        Ok(interrupted.len())
    }

    /// Processing loop. Returns once `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("🚀 Permit processor started for relayer {}", self.relayer_address);

        if let Err(e) = self.recover_interrupted().await {
            error!("Failed to recover interrupted permits: {:?}", e);
        }

        let mut last_sweep: Option<std::time::Instant> = None;
        let mut last_reconcile: Option<std::time::Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_sweep.map_or(true, |at| at.elapsed() >= self.config.expiry_sweep_interval) {
                if let Err(e) = self.sweep_expired().await {
                    error!("Expiry sweep failed: {:?}", e);
                }
                last_sweep = Some(std::time::Instant::now());
            }

            if last_reconcile.map_or(true, |at| at.elapsed() >= self.config.reconcile_interval) {
                if let Err(e) = self.reconcile().await {
                    error!("Reconciliation failed: {:?}", e);
                }
                last_reconcile = Some(std::time::Instant::now());
            }

            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!("Processing step failed: {:?}", e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!("✓ Permit processor for {} stopped", self.relayer_address);
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        execution::instructions::encode_instructions,
        ledger::{models::ServiceFeeConfig, store::ReimbursementStore, InMemoryLedger},
        risk::controls::GuardConfig,
        testing::{permit_fixture, MockChainClient, RecordingAlertSink},
    };
    use solana_sdk::{
        instruction::{AccountMeta, Instruction},
        pubkey::Pubkey,
        signature::{Keypair, Signer},
    };

    struct Harness {
        chain: Arc<MockChainClient>,
        ledger: Arc<InMemoryLedger>,
        alerts: Arc<RecordingAlertSink>,
        processor: PermitProcessor,
        relayer: Pubkey,
        treasury: Pubkey,
    }

    async fn harness(config: ProcessorConfig, service_active: bool) -> Harness {
        let chain = Arc::new(MockChainClient::new());
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .upsert_service(ServiceFeeConfig {
                service_id: "svc-1".to_string(),
                protocol_fee_bps: 250,
                service_fee_bps: 100,
                is_active: service_active,
                allowed_programs: vec![],
            })
            .await;

        let relayer_keypair = Arc::new(Keypair::new());
        let treasury_keypair = Arc::new(Keypair::new());
        let relayer = relayer_keypair.pubkey();
        let treasury = treasury_keypair.pubkey();
        chain.set_balance(relayer, 50_000_000);
        chain.set_balance(treasury, 1_000_000_000);

        let alerts = Arc::new(RecordingAlertSink::default());
        let alerter = Arc::new(Alerter::new(alerts.clone(), Duration::from_secs(300)));

        let engine = Arc::new(ReimbursementEngine::new(
            chain.clone(),
            treasury_keypair,
            Pubkey::new_unique(),
            ledger.clone(),
            ledger.clone(),
        ));
        let guard = TreasuryBalanceGuard::new(GuardConfig::default(), chain.clone(), relayer, treasury);
        let executor = GaslessExecutor::new(chain.clone(), relayer_keypair);

        let processor = PermitProcessor::new(config, ledger.clone(), guard, executor, engine, alerter);

        Harness {
            chain,
            ledger,
            alerts,
            processor,
            relayer,
            treasury,
        }
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            defer_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            ..ProcessorConfig::default()
        }
    }

    impl Harness {
        async fn enqueue(&self, nonce: u64) -> Permit {
            let program = Pubkey::new_unique();
            let mut permit = permit_fixture(&self.relayer.to_string(), nonce);
            permit.target_program = program.to_string();
            permit.instruction_payload = encode_instructions(&[Instruction {
                program_id: program,
                accounts: vec![AccountMeta::new(self.relayer, true)],
                data: vec![1, 2, 3],
            }]);
            self.ledger.insert_permit(&permit).await.unwrap();
            permit
        }

        async fn stored(&self, permit: &Permit) -> Permit {
            self.ledger.get_permit(permit.permit_id).await.unwrap().unwrap()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ProcessorConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(10), Duration::from_secs(60));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_end_to_end_execution_is_reimbursed() {
        let h = harness(fast_config(), true).await;
        let permit = h.enqueue(1).await;
        h.chain.push_fee(4_200_000);

        let outcome = h.processor.process_next().await.unwrap().unwrap();

        let ProcessOutcome::Executed { receipt, reimbursement, .. } = outcome else {
            panic!("expected execution, got {:?}", outcome);
        };
        assert_eq!(receipt.gas_cost, 4_200_000);
        let ReimbursementOutcome::Reimbursed(record) = reimbursement else {
            panic!("expected reimbursement");
        };
        assert_eq!(record.gas_cost, 4_200_000);
        assert_eq!(record.service_fee, 42_000);
        assert_eq!(record.protocol_fee, 105_000);

        // Relayer spent nothing net, treasury paid the gas plus its own tx fee
        assert_eq!(h.chain.balance(&h.relayer), 50_000_000);
        assert_eq!(h.chain.balance(&h.treasury), 1_000_000_000 - 4_200_000 - 10_000);

        let stored = h.stored(&permit).await;
        assert_eq!(stored.status, PermitStatus::Executed);
        assert_eq!(stored.gas_cost, Some(4_200_000));
        assert_eq!(stored.transaction_signature, Some(receipt.transaction_signature));
        assert!(h.processor.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deferrals_do_not_consume_retries() {
        let h = harness(fast_config(), true).await;
        let permit = h.enqueue(1).await;
        h.chain.set_balance(h.treasury, 1_000);

        for _ in 0..5 {
            let outcome = h.processor.process_next().await.unwrap().unwrap();
            assert!(matches!(outcome, ProcessOutcome::Deferred { .. }));
        }

        let stored = h.stored(&permit).await;
        assert_eq!(stored.status, PermitStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert!(h.chain.submitted().is_empty());
        assert_eq!(h.alerts.count(AlertType::LowMasterTreasuryBalance), 1);

        h.chain.set_balance(h.treasury, 1_000_000_000);
        let outcome = h.processor.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Executed { .. }));

        let stored = h.stored(&permit).await;
        assert_eq!(stored.status, PermitStatus::Executed);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_low_relayer_balance_defers() {
        let h = harness(fast_config(), true).await;
        h.enqueue(1).await;
        h.chain.set_balance(h.relayer, 9_999);

        let outcome = h.processor.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Deferred { .. }));
        assert_eq!(h.alerts.count(AlertType::LowRelayerBalance), 1);
    }

    #[tokio::test]
    async fn test_balance_read_failure_defers_without_retry() {
        let h = harness(fast_config(), true).await;
        let permit = h.enqueue(1).await;
        h.chain.fail_balance_reads(true);

        let outcome = h.processor.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Deferred { .. }));
        assert_eq!(h.stored(&permit).await.retry_count, 0);
    }

    #[tokio::test]
    async fn test_retry_ceiling_fails_permit() {
        let config = ProcessorConfig {
            max_retries: 2,
            ..fast_config()
        };
        let h = harness(config, true).await;
        let permit = h.enqueue(1).await;
        for _ in 0..3 {
            h.chain.push_on_chain_error("custom program error: 0x1");
        }

        let first = h.processor.process_next().await.unwrap().unwrap();
        assert!(matches!(first, ProcessOutcome::Retrying { retry_count: 1, .. }));
        let second = h.processor.process_next().await.unwrap().unwrap();
        assert!(matches!(second, ProcessOutcome::Retrying { retry_count: 2, .. }));
        let third = h.processor.process_next().await.unwrap().unwrap();
        assert!(matches!(third, ProcessOutcome::Failed { .. }));

        let stored = h.stored(&permit).await;
        assert_eq!(stored.status, PermitStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.last_error.is_some());
        assert_eq!(h.alerts.count(AlertType::PermitFailed), 1);
        assert!(h.processor.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unusable_payload_fails_immediately() {
        let h = harness(fast_config(), true).await;
        let mut permit = permit_fixture(&h.relayer.to_string(), 1);
        permit.instruction_payload = vec![9, 9];
        h.ledger.insert_permit(&permit).await.unwrap();

        let outcome = h.processor.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
        assert_eq!(h.stored(&permit).await.retry_count, 1);
        assert!(h.chain.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_wins_over_guard() {
        let h = harness(fast_config(), true).await;
        let mut permit = permit_fixture(&h.relayer.to_string(), 1);
        permit.expiry = Utc::now() - chrono::Duration::seconds(1);
        h.ledger.insert_permit(&permit).await.unwrap();
        h.chain.set_balance(h.treasury, 0);

        let outcome = h.processor.process_next().await.unwrap().unwrap();
        assert_eq!(outcome, ProcessOutcome::Expired { permit_id: permit.permit_id });
        assert_eq!(h.stored(&permit).await.status, PermitStatus::Expired);
        assert!(h.alerts.alerts().is_empty());
        assert!(h.chain.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reimbursement_alerts_and_keeps_execution() {
        let h = harness(fast_config(), false).await;
        let permit = h.enqueue(1).await;

        let outcome = h.processor.process_next().await.unwrap().unwrap();
        let ProcessOutcome::Executed { reimbursement, .. } = outcome else {
            panic!("expected execution");
        };
        assert!(!reimbursement.is_reimbursed());
        assert_eq!(h.stored(&permit).await.status, PermitStatus::Executed);
        assert_eq!(h.alerts.count(AlertType::ReimbursementFailed), 1);
        assert_eq!(h.ledger.reimbursement_count().await, 0);
    }

    #[tokio::test]
    async fn test_fee_overrun_is_recorded_on_executed_permit() {
        let h = harness(fast_config(), true).await;
        let permit = h.enqueue(1).await;
        h.chain.push_fee(20_000_000);

        let outcome = h.processor.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Executed { .. }));

        let stored = h.stored(&permit).await;
        assert_eq!(stored.status, PermitStatus::Executed);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("gas cost 20000000 exceeded max fee 10000000")
        );
    }

    #[tokio::test]
    async fn test_reconcile_recovers_own_missed_reimbursement() {
        let h = harness(fast_config(), false).await;
        let permit = h.enqueue(1).await;
        h.processor.process_next().await.unwrap().unwrap();
        assert_eq!(h.ledger.reimbursement_count().await, 0);

        h.ledger
            .upsert_service(ServiceFeeConfig {
                service_id: "svc-1".to_string(),
                protocol_fee_bps: 250,
                service_fee_bps: 100,
                is_active: true,
                allowed_programs: vec![],
            })
            .await;

        let summary = h.processor.reconcile().await.unwrap();
        assert_eq!(summary.reimbursed, 1);
        let record = h
            .ledger
            .get_reimbursement(h.stored(&permit).await.transaction_signature.as_deref().unwrap())
            .await
            .unwrap();
        assert!(record.is_some());
        assert_eq!(h.chain.balance(&h.relayer), 50_000_000);

        assert_eq!(h.processor.reconcile().await.unwrap().attempted, 0);
    }

    #[tokio::test]
    async fn test_higher_nonce_waits_for_lower() {
        let config = ProcessorConfig {
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(60),
            ..fast_config()
        };
        let h = harness(config, true).await;
        let first = h.enqueue(1).await;
        let second = h.enqueue(2).await;
        h.chain.push_on_chain_error("custom program error: 0x1");

        let outcome = h.processor.process_next().await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retrying { permit_id, .. } if permit_id == first.permit_id));

        // Nonce 2 stays blocked while nonce 1 waits out its backoff
        assert!(h.processor.process_next().await.unwrap().is_none());
        assert_eq!(h.stored(&second).await.status, PermitStatus::Pending);
    }

    #[tokio::test]
    async fn test_sweep_expires_overdue_permits() {
        let h = harness(fast_config(), true).await;
        let mut overdue = permit_fixture(&h.relayer.to_string(), 1);
        overdue.expiry = Utc::now() - chrono::Duration::seconds(5);
        h.ledger.insert_permit(&overdue).await.unwrap();
        let fresh = h.enqueue(2).await;

        assert_eq!(h.processor.sweep_expired().await.unwrap(), 1);
        assert_eq!(h.stored(&overdue).await.status, PermitStatus::Expired);
        assert_eq!(h.stored(&fresh).await.status, PermitStatus::Pending);
    }

    #[tokio::test]
    async fn test_recover_interrupted_requeues() {
        let h = harness(fast_config(), true).await;
        let permit = h.enqueue(1).await;
        h.ledger
            .transition(permit.permit_id, PermitStatus::Pending, PermitUpdate::to(PermitStatus::Executing))
            .await
            .unwrap();

        assert_eq!(h.processor.recover_interrupted().await.unwrap(), 1);
        let stored = h.stored(&permit).await;
        assert_eq!(stored.status, PermitStatus::Pending);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops() {
        let h = Arc::new(harness(fast_config(), true).await);
        let permit = h.enqueue(1).await;

        let (tx, rx) = watch::channel(false);
        let runner = {
            let h = h.clone();
            tokio::spawn(async move { h.processor.run(rx).await })
        };

        for _ in 0..100 {
            if h.stored(&permit).await.status == PermitStatus::Executed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.stored(&permit).await.status, PermitStatus::Executed);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("processor did not stop")
            .unwrap();
    }
}
