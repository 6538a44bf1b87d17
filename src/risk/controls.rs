use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use std::{fmt, sync::Arc};
use tracing::warn;

use crate::{
    error::AppResult,
    execution::client::ChainClient,
    ledger::models::BalanceSnapshot,
    notifications::AlertType,
};

/// Safety multipliers applied to the estimated cost of one permit
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub relayer_multiplier: u64,
    /// Larger because the treasury backs every relayer and every pending permit
    pub treasury_multiplier: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            relayer_multiplier: 2,
            treasury_multiplier: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    TreasuryBalanceLow { balance: u64, required: u64 },
    RelayerBalanceLow { balance: u64, required: u64 },
}

impl DeferReason {
    pub fn alert_type(&self) -> AlertType {
        match self {
            DeferReason::TreasuryBalanceLow { .. } => AlertType::LowMasterTreasuryBalance,
            DeferReason::RelayerBalanceLow { .. } => AlertType::LowRelayerBalance,
        }
    }
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::TreasuryBalanceLow { balance, required } => write!(
                f,
                "master treasury balance {} lamports is below required {}",
                balance, required
            ),
            DeferReason::RelayerBalanceLow { balance, required } => write!(
                f,
                "relayer balance {} lamports is below required {}",
                balance, required
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit(BalanceSnapshot),
    Defer(DeferReason),
}

/// Admission check run before every execution attempt. Reads balances only.
pub struct TreasuryBalanceGuard {
    config: GuardConfig,
    chain: Arc<dyn ChainClient>,
    relayer: Pubkey,
    master_treasury: Pubkey,
}

impl TreasuryBalanceGuard {
    pub fn new(
        config: GuardConfig,
        chain: Arc<dyn ChainClient>,
        relayer: Pubkey,
        master_treasury: Pubkey,
    ) -> Self {
        Self {
            config,
            chain,
            relayer,
            master_treasury,
        }
    }

    pub async fn snapshot(&self) -> AppResult<BalanceSnapshot> {
        let relayer_balance = self.chain.get_balance(&self.relayer).await?;
        let treasury_balance = self.chain.get_balance(&self.master_treasury).await?;

        Ok(BalanceSnapshot {
            relayer_balance,
            treasury_balance,
            taken_at: Utc::now(),
        })
    }

    pub async fn check_admission(&self, estimated_cost: u64) -> AppResult<Admission> {
        let snapshot = self.snapshot().await?;
        let admission = evaluate(&self.config, &snapshot, estimated_cost);

        if let Admission::Defer(reason) = &admission {
            warn!("⚠️  Admission deferred for relayer {}: {}", self.relayer, reason);
        }

        Ok(admission)
    }
}

/// Treasury is checked first since its shortfall blocks every relayer.
pub fn evaluate(config: &GuardConfig, snapshot: &BalanceSnapshot, estimated_cost: u64) -> Admission {
    let required_treasury = estimated_cost.saturating_mul(config.treasury_multiplier);
    if snapshot.treasury_balance < required_treasury {
        return Admission::Defer(DeferReason::TreasuryBalanceLow {
            balance: snapshot.treasury_balance,
            required: required_treasury,
        });
    }

    let required_relayer = estimated_cost.saturating_mul(config.relayer_multiplier);
    if snapshot.relayer_balance < required_relayer {
        return Admission::Defer(DeferReason::RelayerBalanceLow {
            balance: snapshot.relayer_balance,
            required: required_relayer,
        });
    }

    Admission::Admit(*snapshot)
}
