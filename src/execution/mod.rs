pub mod client;
pub mod gasless;
pub mod instructions;
pub mod signature;
pub mod solana;

pub use client::{ChainClient, Confirmation, RecentBlockhash};
pub use gasless::{ExecutionReceipt, GaslessExecutor};
pub use signature::{verify_permit_signature, PermitPayload};
pub use solana::{ConfirmationConfig, SolanaRpcClient};
