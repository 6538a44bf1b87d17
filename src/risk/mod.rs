pub mod controls;
pub mod scheduler;
pub mod throttle;

pub use controls::{Admission, DeferReason, GuardConfig, TreasuryBalanceGuard};
pub use scheduler::{CleanupScheduleConfig, CleanupScheduler};
pub use throttle::{ClaimThrottle, InMemoryClaimThrottle};
