//! Proof-of-stake checks: protocol eras, timestamp rules, the stake kernel and block
//! signatures.

pub mod era;
pub mod kernel;
pub mod signature;

pub use era::ProtocolEra;
pub use kernel::{check_stake_kernel, compute_stake_modifier_v2, KernelInput, KernelProof};
pub use signature::{check_block_signature, sign_block_hash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PosError {
    /// Coinstake or block timestamp violates the era's stake time rules.
    StakeTime,
    /// The staked output has not reached the minimum depth.
    StakeTooYoung { depth: u32, required: u32 },
    KernelTargetMissed,
    InvalidBits,
    /// No public key could be located for the kernel output.
    UnknownSigner(&'static str),
    BadSignature(&'static str),
    UnexpectedSignature,
}

impl std::fmt::Display for PosError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PosError::StakeTime => write!(f, "stake timestamp violation"),
            PosError::StakeTooYoung { depth, required } => {
                write!(f, "staked output depth {depth} below required {required}")
            }
            PosError::KernelTargetMissed => write!(f, "stake kernel does not meet target"),
            PosError::InvalidBits => write!(f, "invalid stake difficulty bits"),
            PosError::UnknownSigner(message) => write!(f, "{message}"),
            PosError::BadSignature(message) => write!(f, "{message}"),
            PosError::UnexpectedSignature => write!(f, "proof-of-work block carries a signature"),
        }
    }
}

impl std::error::Error for PosError {}
