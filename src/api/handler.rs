use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use solana_sdk::pubkey::Pubkey;
use std::{str::FromStr, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    error::{AppError, AppResult, PermitError},
    execution::{
        client::ChainClient,
        signature::{verify_permit_signature, PermitPayload},
    },
    ledger::{
        models::{NewPermit, PermitStatus},
        store::ReimbursementStore,
    },
    relay::PermitQueue,
    risk::throttle::ClaimThrottle,
};

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<PermitQueue>,
    pub reimbursements: Arc<dyn ReimbursementStore>,
    pub claim_throttle: Arc<dyn ClaimThrottle>,
    pub chain: Arc<dyn ChainClient>,
    pub relayers: Vec<Pubkey>,
    pub master_treasury: Pubkey,
    /// "postgres" or "memory"
    pub storage: &'static str,
}

/// Submit a signed permit
/// POST /permits
///
/// - Signature is checked before the claim cooldown is consumed
/// - A rejected intake gives the cooldown back
pub async fn create_permit(
    State(state): State<AppState>,
    Json(request): Json<CreatePermitRequest>,
) -> AppResult<(StatusCode, Json<CreatePermitResponse>)> {
    info!(
        "Permit submitted by {} for service {} (nonce {})",
        request.user_public_key, request.service_id, request.nonce
    );

    let user = Pubkey::from_str(&request.user_public_key)
        .map_err(|_| AppError::InvalidAddress(format!("Invalid user public key: {}", request.user_public_key)))?;

    let instruction_payload = base64::engine::general_purpose::STANDARD
        .decode(&request.instruction_data)
        .map_err(|e| AppError::InvalidInput(format!("Invalid base64 instruction data: {}", e)))?;

    let expiry = DateTime::<Utc>::from_timestamp(request.expiry, 0)
        .ok_or_else(|| AppError::InvalidInput(format!("Invalid expiry: {}", request.expiry)))?;

    let signature = verify_permit_signature(&permit_payload(&request), &user, &request.signature)?;

    state
        .claim_throttle
        .check_and_record(&request.user_public_key, &request.service_id)
        .await?;

    let enqueued = state
        .queue
        .enqueue(NewPermit {
            user_address: request.user_public_key.clone(),
            service_id: request.service_id.clone(),
            nonce: request.nonce,
            instruction_payload,
            target_program: request.target_program.clone(),
            expiry,
            max_fee: request.max_fee,
            signature,
        })
        .await;

    let permit = match enqueued {
        Ok(permit) => permit,
        Err(e) => {
            warn!("Permit from {} rejected: {}", request.user_public_key, e);
            state
                .claim_throttle
                .release(&request.user_public_key, &request.service_id)
                .await;
            return Err(e);
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(CreatePermitResponse {
            permit_id: permit.permit_id,
            nonce: permit.nonce,
            status: permit.status,
        }),
    ))
}

/// Dry run of the signature check on a permit body
/// POST /permits/validate-signature
///
/// Stores nothing and leaves the claim cooldown untouched. A well-formed
/// signature that does not match reports `isValid: false`.
pub async fn validate_signature(
    Json(request): Json<CreatePermitRequest>,
) -> AppResult<Json<ValidateSignatureResponse>> {
    let user = Pubkey::from_str(&request.user_public_key)
        .map_err(|_| AppError::InvalidAddress(format!("Invalid user public key: {}", request.user_public_key)))?;

    let is_valid = match verify_permit_signature(&permit_payload(&request), &user, &request.signature) {
        Ok(_) => true,
        Err(AppError::Permit(PermitError::BadSignature)) => false,
        Err(e) => return Err(e),
    };

    Ok(Json(ValidateSignatureResponse {
        is_valid,
        user_public_key: request.user_public_key,
        service_id: request.service_id,
        nonce: request.nonce,
    }))
}

fn permit_payload(request: &CreatePermitRequest) -> PermitPayload<'_> {
    PermitPayload::new(
        &request.user_public_key,
        &request.service_id,
        &request.target_program,
        request.expiry,
        request.max_fee,
        &request.instruction_data,
        request.nonce,
    )
}

/// GET /permits/:permit_id
pub async fn get_permit(
    State(state): State<AppState>,
    Path(permit_id): Path<Uuid>,
) -> AppResult<Json<PermitResponse>> {
    let permit = state.queue.get_status(permit_id).await?;
    Ok(Json(PermitResponse::from(permit)))
}

/// GET /permits/user/:user_address?service_id=..&status=..
pub async fn list_user_permits(
    State(state): State<AppState>,
    Path(user_address): Path<String>,
    Query(query): Query<ListPermitsQuery>,
) -> AppResult<Json<Vec<PermitResponse>>> {
    let status = query
        .status
        .as_deref()
        .map(PermitStatus::from_str)
        .transpose()
        .map_err(AppError::InvalidInput)?;

    let permits = state
        .queue
        .list_user_permits(&user_address, query.service_id.as_deref(), status)
        .await?;

    Ok(Json(permits.into_iter().map(PermitResponse::from).collect()))
}

/// GET /reimbursements/:original_signature
pub async fn get_reimbursement(
    State(state): State<AppState>,
    Path(original_signature): Path<String>,
) -> AppResult<Json<ReimbursementResponse>> {
    let record = state
        .reimbursements
        .get_reimbursement(&original_signature)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Reimbursement for {}", original_signature)))?;

    Ok(Json(ReimbursementResponse::from(record)))
}

/// GET /admin/balances - master treasury and every relayer
pub async fn get_balances(State(state): State<AppState>) -> AppResult<Json<BalancesResponse>> {
    let treasury_lamports = state.chain.get_balance(&state.master_treasury).await?;

    let lamports = try_join_all(state.relayers.iter().map(|relayer| state.chain.get_balance(relayer))).await?;
    let relayers = state
        .relayers
        .iter()
        .zip(lamports)
        .map(|(relayer, lamports)| AccountBalance::new(relayer.to_string(), lamports))
        .collect();

    Ok(Json(BalancesResponse {
        master_treasury: AccountBalance::new(state.master_treasury.to_string(), treasury_lamports),
        relayers,
        timestamp: Utc::now(),
    }))
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.relayers.is_empty() {
            "degraded".to_string()
        } else {
            "healthy".to_string()
        },
        timestamp: Utc::now(),
        storage: state.storage.to_string(),
        relayers: state.relayers.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        execution::instructions::encode_instructions,
        ledger::{models::ServiceFeeConfig, InMemoryLedger},
        risk::throttle::InMemoryClaimThrottle,
        testing::MockChainClient,
    };
    use solana_sdk::{
        instruction::{AccountMeta, Instruction},
        signature::{Keypair, Signer},
    };
    use std::time::Duration;

    struct Fixture {
        state: AppState,
        program: Pubkey,
        chain: Arc<MockChainClient>,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let program = Pubkey::new_unique();
        ledger
            .upsert_service(ServiceFeeConfig {
                service_id: "svc-1".to_string(),
                protocol_fee_bps: 250,
                service_fee_bps: 100,
                is_active: true,
                allowed_programs: vec![program.to_string()],
            })
            .await;

        let relayers = vec![Pubkey::new_unique()];
        let chain = Arc::new(MockChainClient::new());
        let queue = Arc::new(PermitQueue::new(ledger.clone(), ledger.clone(), relayers.clone(), 5_000));

        let state = AppState {
            queue,
            reimbursements: ledger,
            claim_throttle: Arc::new(InMemoryClaimThrottle::new(Duration::from_secs(60))),
            chain: chain.clone(),
            relayers,
            master_treasury: Pubkey::new_unique(),
            storage: "memory",
        };

        Fixture { state, program, chain }
    }

    fn signed_request(user: &Keypair, program: &Pubkey, nonce: u64) -> CreatePermitRequest {
        let payload = encode_instructions(&[Instruction {
            program_id: *program,
            accounts: vec![AccountMeta::new(user.pubkey(), false)],
            data: vec![4, 2],
        }]);
        let instruction_data = base64::engine::general_purpose::STANDARD.encode(payload);
        let user_public_key = user.pubkey().to_string();
        let target_program = program.to_string();
        let expiry = Utc::now().timestamp() + 600;

        let message = PermitPayload::new(
            &user_public_key,
            "svc-1",
            &target_program,
            expiry,
            10_000,
            &instruction_data,
            nonce,
        )
        .message()
        .unwrap();

        CreatePermitRequest {
            user_public_key: user_public_key.clone(),
            service_id: "svc-1".to_string(),
            instruction_data,
            target_program,
            expiry,
            max_fee: 10_000,
            nonce,
            signature: user.sign_message(&message).to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_permit_returns_created() {
        let f = fixture().await;
        let user = Keypair::new();

        let (status, Json(body)) = create_permit(State(f.state.clone()), Json(signed_request(&user, &f.program, 1)))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body.nonce, 1);
        assert_eq!(body.status, PermitStatus::Pending);

        let Json(stored) = get_permit(State(f.state.clone()), Path(body.permit_id)).await.unwrap();
        assert_eq!(stored.user_address, user.pubkey().to_string());
    }

    #[tokio::test]
    async fn test_second_claim_within_cooldown_is_rate_limited() {
        let f = fixture().await;
        let user = Keypair::new();

        create_permit(State(f.state.clone()), Json(signed_request(&user, &f.program, 1)))
            .await
            .unwrap();
        let err = create_permit(State(f.state.clone()), Json(signed_request(&user, &f.program, 2)))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_tampered_permit_is_rejected_without_consuming_cooldown() {
        let f = fixture().await;
        let user = Keypair::new();

        let mut tampered = signed_request(&user, &f.program, 1);
        tampered.max_fee = 20_000;
        let err = create_permit(State(f.state.clone()), Json(tampered)).await.unwrap_err();
        assert!(matches!(err, AppError::Permit(PermitError::BadSignature)));

        create_permit(State(f.state.clone()), Json(signed_request(&user, &f.program, 1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_intake_releases_cooldown() {
        let f = fixture().await;
        let user = Keypair::new();
        let other_program = Pubkey::new_unique();

        let err = create_permit(State(f.state.clone()), Json(signed_request(&user, &other_program, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Permit(PermitError::ProgramNotAllowed { .. })));

        create_permit(State(f.state.clone()), Json(signed_request(&user, &f.program, 1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_validate_signature_reports_validity_without_storing() {
        let f = fixture().await;
        let user = Keypair::new();

        let Json(valid) = validate_signature(Json(signed_request(&user, &f.program, 1))).await.unwrap();
        assert!(valid.is_valid);
        assert_eq!(valid.user_public_key, user.pubkey().to_string());
        assert_eq!(valid.nonce, 1);

        let mut tampered = signed_request(&user, &f.program, 1);
        tampered.nonce = 2;
        let Json(invalid) = validate_signature(Json(tampered)).await.unwrap();
        assert!(!invalid.is_valid);

        let stored = f
            .state
            .queue
            .list_user_permits(&user.pubkey().to_string(), None, None)
            .await
            .unwrap();
        assert!(stored.is_empty());

        // The cooldown was never consumed
        create_permit(State(f.state.clone()), Json(signed_request(&user, &f.program, 1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_validate_signature_rejects_malformed_input() {
        let user = Keypair::new();
        let program = Pubkey::new_unique();

        let mut bad_key = signed_request(&user, &program, 1);
        bad_key.user_public_key = "not-a-key".to_string();
        assert!(matches!(
            validate_signature(Json(bad_key)).await,
            Err(AppError::InvalidAddress(_))
        ));

        let mut short = signed_request(&user, &program, 1);
        short.signature = bs58::encode([1u8; 10]).into_string();
        assert!(matches!(
            validate_signature(Json(short)).await,
            Err(AppError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_status() {
        let f = fixture().await;
        let err = list_user_permits(
            State(f.state.clone()),
            Path("someone".to_string()),
            Query(ListPermitsQuery {
                service_id: None,
                status: Some("settled".to_string()),
            }),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_reimbursement_is_not_found() {
        let f = fixture().await;
        let err = get_reimbursement(State(f.state.clone()), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_balances_report_sol() {
        let f = fixture().await;
        f.chain.set_balance(f.state.master_treasury, 2_000_000_000);
        f.chain.set_balance(f.state.relayers[0], 500_000_000);

        let Json(body) = get_balances(State(f.state.clone())).await.unwrap();
        assert_eq!(body.master_treasury.lamports, 2_000_000_000);
        assert_eq!(body.relayers[0].sol, rust_decimal_macros::dec!(0.5));
    }
}
