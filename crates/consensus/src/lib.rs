//! Consensus constants, parameters, deployments and reward schedule.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;
pub mod rewards;

pub type Hash256 = [u8; 32];

pub use deployments::{flags_for_height, ConsensusFlags};
pub use params::{consensus_params, ConsensusParams, Network};
pub use rewards::{proof_of_stake_reward, proof_of_work_reward};
