//! Compact targets, difficulty retargeting and proof-of-work checks.

pub mod difficulty;
pub mod validation;

pub use difficulty::{HeaderInfo, TargetKind};
pub use validation::{check_proof_of_work, PowError};
