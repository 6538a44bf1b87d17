// Settlement: fee split, treasury reimbursement and reconciliation
pub mod fees;
pub mod reimbursement;

use solana_sdk::signature::{Keypair, Signer};
use std::sync::Arc;
use tracing::info;

use crate::{error::AppResult, ledger::store::PermitStore};
use reimbursement::{ReimbursementEngine, ReimbursementOutcome};

const RECONCILE_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub attempted: usize,
    pub reimbursed: usize,
    pub failed: usize,
}

/// Retries reimbursement for one relayer's executed permits that have no
/// record yet. Each processor runs it for its own relayer between permits,
/// so a relayer key never signs two transactions at once.
pub struct SettlementReconciler {
    permits: Arc<dyn PermitStore>,
    engine: Arc<ReimbursementEngine>,
}

impl SettlementReconciler {
    pub fn new(permits: Arc<dyn PermitStore>, engine: Arc<ReimbursementEngine>) -> Self {
        Self { permits, engine }
    }

    pub async fn reconcile_relayer(&self, relayer: &Keypair) -> AppResult<ReconcileSummary> {
        let relayer_address = relayer.pubkey().to_string();
        let mut summary = ReconcileSummary::default();

        for permit in self
            .permits
            .list_unreimbursed(&relayer_address, RECONCILE_BATCH)
            .await?
        {
            let (Some(signature), Some(gas_cost)) = (&permit.transaction_signature, permit.gas_cost)
            else {
                continue;
            };

            summary.attempted += 1;
            match self
                .engine
                .reimburse(relayer, &permit.service_id, gas_cost, signature)
                .await
            {
                ReimbursementOutcome::Reimbursed(_) => summary.reimbursed += 1,
                ReimbursementOutcome::NotReimbursed { .. } => summary.failed += 1,
            }
        }

        if summary.attempted > 0 {
            info!(
                "🔁 Reconciliation for {}: {} attempted, {} reimbursed, {} still failing",
                relayer_address, summary.attempted, summary.reimbursed, summary.failed
            );
        }

        Ok(summary)
    }
}
