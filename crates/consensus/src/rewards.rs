//! Block reward schedule.

use crate::money::Amount;
use crate::params::ConsensusParams;

pub fn proof_of_work_reward(height: i32, params: &ConsensusParams) -> Amount {
    if height == params.premine_height {
        return params.premine_reward;
    }
    params.proof_of_work_reward
}

pub fn proof_of_stake_reward(height: i32, params: &ConsensusParams) -> Amount {
    if height == params.premine_height {
        return params.premine_reward;
    }
    params.proof_of_stake_reward
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::COIN;
    use crate::params::{consensus_params, Network};

    #[test]
    fn premine_height_pays_premine() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(
            proof_of_work_reward(params.premine_height, &params),
            params.premine_reward
        );
        assert_eq!(
            proof_of_stake_reward(params.premine_height, &params),
            params.premine_reward
        );
        assert_eq!(proof_of_work_reward(params.premine_height + 1, &params), 4 * COIN);
        assert_eq!(proof_of_stake_reward(params.premine_height + 1, &params), COIN);
    }
}
