//! Off-chain permit signature verification.
//! Wallets sign a human readable header followed by the compact JSON payload.

use ed25519_dalek::{Signature, VerifyingKey};
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;

use crate::error::{AppError, AppResult, PermitError};

const MESSAGE_HEADER: &str = "Gasless Permit\n--------------------------------\n";

/// Fields covered by the user's signature, serialized in this order
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitPayload<'a> {
    pub domain: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub version: u8,
    pub user: &'a str,
    pub service_id: &'a str,
    pub target_program: &'a str,
    pub expiry: i64,
    pub max_fee: u64,
    pub instruction_data_base64: &'a str,
    pub nonce: u64,
}

impl<'a> PermitPayload<'a> {
    pub fn new(
        user: &'a str,
        service_id: &'a str,
        target_program: &'a str,
        expiry: i64,
        max_fee: u64,
        instruction_data_base64: &'a str,
        nonce: u64,
    ) -> Self {
        Self {
            domain: "gasless-infra",
            kind: "permit",
            version: 1,
            user,
            service_id,
            target_program,
            expiry,
            max_fee,
            instruction_data_base64,
            nonce,
        }
    }

    pub fn message(&self) -> AppResult<Vec<u8>> {
        let json = serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("Failed to encode permit payload: {}", e)))?;
        Ok(format!("{}{}", MESSAGE_HEADER, json).into_bytes())
    }
}

/// Decodes a base58 signature and checks it against the payload and signer.
/// Returns the raw 64 signature bytes for storage.
pub fn verify_permit_signature(
    payload: &PermitPayload<'_>,
    signer: &Pubkey,
    signature_b58: &str,
) -> AppResult<Vec<u8>> {
    let signature_bytes = bs58::decode(signature_b58)
        .into_vec()
        .map_err(|_| AppError::InvalidSignature("Invalid base58 encoding".to_string()))?;

    let sig_array: [u8; 64] = signature_bytes
        .as_slice()
        .try_into()
        .map_err(|_| AppError::InvalidSignature("Signature must be 64 bytes".to_string()))?;

    let verify_key = VerifyingKey::from_bytes(&signer.to_bytes())
        .map_err(|_| AppError::InvalidSignature("Invalid verification key".to_string()))?;

    verify_key
        .verify_strict(&payload.message()?, &Signature::from_bytes(&sig_array))
        .map_err(|_| PermitError::BadSignature)?;

    Ok(signature_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::signature::{Keypair, Signer};

    fn payload(user: &str) -> PermitPayload<'_> {
        PermitPayload::new(user, "svc-1", "Prog1111", 1_900_000_000, 10_000, "AQID", 1)
    }

    #[test]
    fn test_message_layout_is_stable() {
        let message = payload("User1").message().unwrap();
        let text = String::from_utf8(message).unwrap();
        assert_eq!(
            text,
            "Gasless Permit\n--------------------------------\n\
             {\"domain\":\"gasless-infra\",\"type\":\"permit\",\"version\":1,\"user\":\"User1\",\
             \"serviceId\":\"svc-1\",\"targetProgram\":\"Prog1111\",\"expiry\":1900000000,\
             \"maxFee\":10000,\"instructionDataBase64\":\"AQID\",\"nonce\":1}"
        );
    }

    #[test]
    fn test_valid_signature_is_accepted() {
        let keypair = Keypair::new();
        let user = keypair.pubkey().to_string();
        let payload = payload(&user);
        let sig = keypair.sign_message(&payload.message().unwrap());

        let stored = verify_permit_signature(&payload, &keypair.pubkey(), &sig.to_string()).unwrap();
        assert_eq!(stored.len(), 64);
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let keypair = Keypair::new();
        let user = keypair.pubkey().to_string();
        let sig = keypair.sign_message(&payload(&user).message().unwrap());

        let mut tampered = payload(&user);
        tampered.max_fee = 20_000;
        let err = verify_permit_signature(&tampered, &keypair.pubkey(), &sig.to_string()).unwrap_err();
        assert!(matches!(err, AppError::Permit(PermitError::BadSignature)));
    }

    #[test]
    fn test_garbage_signature_is_rejected() {
        let keypair = Keypair::new();
        let user = keypair.pubkey().to_string();
        let err = verify_permit_signature(&payload(&user), &keypair.pubkey(), "0OIl").unwrap_err();
        assert!(matches!(err, AppError::InvalidSignature(_)));
    }
}
