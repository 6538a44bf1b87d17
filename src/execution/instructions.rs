//! Wire format of a permit's instruction payload.
//!
//! The payload is the borsh encoding of `Vec<WireInstruction>`: a `u32`
//! count, then per instruction the 32-byte program id, a `u32`-prefixed list
//! of `(32-byte key, is_signer, is_writable)` metas and `u32`-prefixed data.
//! The payload must be consumed exactly.

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
};
use thiserror::Error;

pub const MAX_INSTRUCTIONS: usize = 16;
pub const MAX_ACCOUNTS: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not a valid instruction list: {0}")]
    Malformed(String),

    #[error("instruction count {0} outside 1..=16")]
    InstructionCount(usize),

    #[error("account count {0} exceeds 32")]
    AccountCount(usize),

    #[error("instruction targets {actual}, expected {expected}")]
    ProgramMismatch { expected: Pubkey, actual: Pubkey },

    #[error("account {0} must not be a signer")]
    UnexpectedSigner(Pubkey),
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WireMeta {
    pub pubkey: [u8; 32],
    pub is_signer: bool,
    pub is_writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WireInstruction {
    pub program_id: [u8; 32],
    pub accounts: Vec<WireMeta>,
    pub data: Vec<u8>,
}

impl From<&Instruction> for WireInstruction {
    fn from(ix: &Instruction) -> Self {
        Self {
            program_id: ix.program_id.to_bytes(),
            accounts: ix
                .accounts
                .iter()
                .map(|meta| WireMeta {
                    pubkey: meta.pubkey.to_bytes(),
                    is_signer: meta.is_signer,
                    is_writable: meta.is_writable,
                })
                .collect(),
            data: ix.data.clone(),
        }
    }
}

impl From<WireInstruction> for Instruction {
    fn from(wire: WireInstruction) -> Self {
        Instruction {
            program_id: Pubkey::new_from_array(wire.program_id),
            accounts: wire
                .accounts
                .into_iter()
                .map(|meta| AccountMeta {
                    pubkey: Pubkey::new_from_array(meta.pubkey),
                    is_signer: meta.is_signer,
                    is_writable: meta.is_writable,
                })
                .collect(),
            data: wire.data,
        }
    }
}

pub fn decode_instructions(bytes: &[u8]) -> Result<Vec<Instruction>, PayloadError> {
    let wire: Vec<WireInstruction> =
        borsh::from_slice(bytes).map_err(|e| PayloadError::Malformed(e.to_string()))?;

    if wire.is_empty() || wire.len() > MAX_INSTRUCTIONS {
        return Err(PayloadError::InstructionCount(wire.len()));
    }
    if let Some(ix) = wire.iter().find(|ix| ix.accounts.len() > MAX_ACCOUNTS) {
        return Err(PayloadError::AccountCount(ix.accounts.len()));
    }

    Ok(wire.into_iter().map(Instruction::from).collect())
}

pub fn encode_instructions(instructions: &[Instruction]) -> Vec<u8> {
    let wire: Vec<WireInstruction> = instructions.iter().map(WireInstruction::from).collect();
    // Writing into a Vec cannot fail
    borsh::to_vec(&wire).unwrap_or_default()
}

/// Every instruction must call `target_program`, and only the fee payer may sign.
pub fn check_policy(
    instructions: &[Instruction],
    target_program: &Pubkey,
    fee_payer: &Pubkey,
) -> Result<(), PayloadError> {
    for ix in instructions {
        if ix.program_id != *target_program {
            return Err(PayloadError::ProgramMismatch {
                expected: *target_program,
                actual: ix.program_id,
            });
        }
        if let Some(meta) = ix
            .accounts
            .iter()
            .find(|meta| meta.is_signer && meta.pubkey != *fee_payer)
        {
            return Err(PayloadError::UnexpectedSigner(meta.pubkey));
        }
    }
    Ok(())
}
