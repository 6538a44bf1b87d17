use solana_sdk::{
    pubkey::Pubkey,
    signature::{Keypair, Signer},
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    config::Config,
    error::{AppError, AppResult},
    execution::{client::ChainClient, gasless::GaslessExecutor, solana::SolanaRpcClient},
    ledger::{
        models::ServiceFeeConfig,
        store::{FeeConfigStore, PermitStore, ReimbursementStore},
        InMemoryLedger, LedgerRepository,
    },
    notifications::{AlertSink, Alerter, LogAlertSink, WebhookAlertSink},
    relay::{PermitProcessor, PermitQueue},
    risk::{
        controls::TreasuryBalanceGuard,
        scheduler::{CleanupScheduleConfig, CleanupScheduler},
        throttle::InMemoryClaimThrottle,
    },
    settlement::reimbursement::ReimbursementEngine,
};

/// Everything `main` needs to serve and later stop
pub struct Runtime {
    pub state: AppState,
    pub shutdown: watch::Sender<bool>,
    pub tasks: Vec<JoinHandle<()>>,
}

struct Stores {
    permits: Arc<dyn PermitStore>,
    reimbursements: Arc<dyn ReimbursementStore>,
    fee_config: Arc<dyn FeeConfigStore>,
    kind: &'static str,
}

pub async fn initialize_runtime(config: &Config) -> AppResult<Runtime> {
    info!("Initializing application components ...");

    let relayers = config
        .relayer_secrets_b58
        .iter()
        .map(|secret| parse_keypair(secret, "RELAYER_SECRETS_B58").map(Arc::new))
        .collect::<AppResult<Vec<_>>>()?;
    if relayers.is_empty() {
        return Err(AppError::Config(
            "RELAYER_SECRETS_B58 must list at least one relayer key".to_string(),
        ));
    }

    let master_treasury = config
        .master_treasury_secret_b58
        .as_deref()
        .ok_or_else(|| AppError::Config("MASTER_TREASURY_SECRET_B58 must be set".to_string()))
        .and_then(|secret| parse_keypair(secret, "MASTER_TREASURY_SECRET_B58"))
        .map(Arc::new)?;

    let program_id = Pubkey::from_str(&config.gasless_program_id)
        .map_err(|_| AppError::Config(format!("Invalid GASLESS_PROGRAM_ID: {}", config.gasless_program_id)))?;

    let stores = initialize_stores(config).await?;

    let chain: Arc<dyn ChainClient> = Arc::new(SolanaRpcClient::new(
        config.solana_rpc_url.clone(),
        config.confirmation_config(),
    ));
    info!("✅ Solana RPC client configured for {}", config.solana_rpc_url);

    let sink: Arc<dyn AlertSink> = match &config.alert_webhook_url {
        Some(url) => {
            info!("✅ Alerts delivered to webhook");
            Arc::new(WebhookAlertSink::new(url.clone(), config.alert_api_key.clone()))
        }
        None => {
            warn!("⚠️  ALERT_WEBHOOK_URL not set - alerts are logged only");
            Arc::new(LogAlertSink)
        }
    };
    let alerter = Arc::new(Alerter::new(sink, Duration::from_secs(config.alert_cooldown_secs)));

    let engine = Arc::new(ReimbursementEngine::new(
        chain.clone(),
        master_treasury.clone(),
        program_id,
        stores.fee_config.clone(),
        stores.reimbursements.clone(),
    ));

    let relayer_pubkeys: Vec<Pubkey> = relayers.iter().map(|k| k.pubkey()).collect();
    let queue = Arc::new(PermitQueue::new(
        stores.permits.clone(),
        stores.fee_config.clone(),
        relayer_pubkeys.clone(),
        config.estimated_fee_lamports,
    ));
    // Before any processor runs, so no permit is moved mid-execution
    queue.reassign_orphaned().await?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::with_capacity(relayers.len() + 1);

    info!("⚙️  Starting {} permit processor(s)...", relayers.len());
    for relayer in &relayers {
        let guard = TreasuryBalanceGuard::new(
            config.guard_config(),
            chain.clone(),
            relayer.pubkey(),
            master_treasury.pubkey(),
        );
        let processor = PermitProcessor::new(
            config.processor_config(),
            stores.permits.clone(),
            guard,
            GaslessExecutor::new(chain.clone(), relayer.clone()),
            engine.clone(),
            alerter.clone(),
        );
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { processor.run(rx).await }));
    }

    let claim_throttle = Arc::new(InMemoryClaimThrottle::new(Duration::from_secs(
        config.claim_cooldown_secs,
    )));

    let scheduler = CleanupScheduler::new(
        CleanupScheduleConfig {
            interval: Duration::from_secs(config.claim_cleanup_interval_secs.max(1)),
        },
        claim_throttle.clone(),
    );
    tasks.push(scheduler.start(shutdown_rx));
    info!("✅ Claim cooldown cleanup started");

    let state = AppState {
        queue,
        reimbursements: stores.reimbursements.clone(),
        claim_throttle,
        chain,
        relayers: relayer_pubkeys,
        master_treasury: master_treasury.pubkey(),
        storage: stores.kind,
    };

    Ok(Runtime {
        state,
        shutdown,
        tasks,
    })
}

async fn initialize_stores(config: &Config) -> AppResult<Stores> {
    let seeds = config
        .service_seeds()
        .map_err(|e| AppError::Config(e.to_string()))?;

    match &config.database_url {
        Some(database_url) => {
            let pool = initialize_database(database_url).await?;
            let repository = Arc::new(LedgerRepository::new(pool));
            repository.ensure_protocol_fee(config.protocol_fee_bps).await?;

            for seed in seeds {
                repository
                    .upsert_service(&ServiceFeeConfig {
                        service_id: seed.service_id,
                        protocol_fee_bps: config.protocol_fee_bps,
                        service_fee_bps: seed.service_fee_bps,
                        is_active: seed.is_active,
                        allowed_programs: seed.allowed_programs,
                    })
                    .await?;
            }

            Ok(Stores {
                permits: repository.clone(),
                reimbursements: repository.clone(),
                fee_config: repository,
                kind: "postgres",
            })
        }
        None => {
            warn!("⚠️  DATABASE_URL not set - using the in-memory ledger, state is lost on restart");
            let ledger = Arc::new(InMemoryLedger::new());

            for seed in seeds {
                ledger
                    .upsert_service(ServiceFeeConfig {
                        service_id: seed.service_id,
                        protocol_fee_bps: config.protocol_fee_bps,
                        service_fee_bps: seed.service_fee_bps,
                        is_active: seed.is_active,
                        allowed_programs: seed.allowed_programs,
                    })
                    .await;
            }

            Ok(Stores {
                permits: ledger.clone(),
                reimbursements: ledger.clone(),
                fee_config: ledger,
                kind: "memory",
            })
        }
    }
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}

fn parse_keypair(secret_b58: &str, key: &str) -> AppResult<Keypair> {
    let bytes = bs58::decode(secret_b58.trim())
        .into_vec()
        .map_err(|_| AppError::Config(format!("{} holds invalid base58", key)))?;

    Keypair::try_from(bytes.as_slice())
        .map_err(|_| AppError::Config(format!("{} holds a malformed keypair", key)))
}
