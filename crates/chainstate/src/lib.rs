//! Block acceptance: header chain, validation context, consensus rules, the stake
//! metadata store and the consensus loop that drives them.

pub mod chain;
pub mod collaborators;
pub mod consensus_loop;
pub mod context;
pub mod error;
pub mod metrics;
pub mod rules;
pub mod source;
pub mod stake;

pub use chain::{ChainedHeader, HeaderChain, MemoryHeaderChain};
pub use consensus_loop::{BlockResult, ConsensusLoop};
pub use context::{UnspentOutputSet, ValidationContext};
pub use error::{ConsensusError, RuleError};
pub use rules::{Rule, RuleSet, Stage};
pub use source::{BlockRequestOptions, BlockSource, Cancelled, ShutdownSignal};
pub use stake::{BlockStake, StakeChainStore, StakeStoreError};
