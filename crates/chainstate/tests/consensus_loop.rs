mod support;

use std::sync::Arc;

use stakd_chainstate::chain::{ChainedHeader, HeaderChain, MemoryHeaderChain};
use stakd_chainstate::collaborators::InputVerifier;
use stakd_chainstate::{BlockSource, ConsensusError, ConsensusLoop, RuleError, RuleSet};
use stakd_coinview::CoinView;
use stakd_consensus::money::COIN;
use stakd_consensus::ConsensusFlags;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxOut};
use tokio::sync::watch;

use support::{assemble, block_time, coinbase, pow_block, spend, FixedTime, Harness, GENESIS_TIME};

fn shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[test]
fn accepts_chain_and_spends_matured_coinbase() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(None));
    consensus.initialize().expect("initialize");

    let blocks = harness.extend(harness.genesis.hash(), 1, 10);
    let matured = OutPoint::new(blocks[0].transactions[0].txid(), 0);
    let spender = spend(matured, 3 * COIN, block_time(11));
    let spender_txid = spender.txid();
    let block = pow_block(
        blocks[9].hash(),
        11,
        vec![coinbase(11, 5 * COIN, block_time(11)), spender],
        &harness.params,
    );
    harness.source.push(block.clone());

    let (_tx, rx) = shutdown();
    let results: Vec<_> = consensus
        .execute(rx)
        .collect::<Result<Vec<_>, _>>()
        .expect("no fatal error");
    assert_eq!(results.len(), 11);
    assert!(results.iter().all(|result| result.is_accepted()));

    let tip = consensus.tip().expect("tip");
    assert_eq!(tip.height, 11);
    assert_eq!(tip.hash, block.hash());
    assert_eq!(harness.chain.height(), 11);
    assert_eq!(harness.cache.tip_hash().expect("cache tip"), block.hash());

    let fetched = harness
        .cache
        .fetch_coins(&[spender_txid])
        .expect("fetch spender");
    let coins = fetched.unspent[0].as_ref().expect("spender outputs");
    assert_eq!(coins.output(0).map(|out| out.value), Some(3 * COIN));

    let snapshot = consensus.counters().snapshot();
    assert_eq!(snapshot.processed_blocks, 11);
    assert_eq!(snapshot.rejected_blocks, 0);
    assert_eq!(snapshot.processed_inputs, 1);
}

#[test]
fn block_not_on_tip_is_rejected_without_state_change() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(None));
    consensus.initialize().expect("initialize");

    let orphan = pow_block([9u8; 32], 1, vec![coinbase(1, COIN, block_time(1))], &harness.params);
    harness.source.push(orphan);

    let (_tx, rx) = shutdown();
    let result = consensus.execute_next_block(&rx).expect("block result");
    assert_eq!(result.error, Some(RuleError::BadPrevBlock));
    assert!(result.chained_header.is_none());
    assert_eq!(consensus.tip().expect("tip").height, 0);
    assert_eq!(
        harness.cache.tip_hash().expect("cache tip"),
        harness.genesis.hash()
    );
}

#[test]
fn premature_coinbase_spend_is_rejected() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(None));
    consensus.initialize().expect("initialize");

    let blocks = harness.extend(harness.genesis.hash(), 1, 1);
    let young = OutPoint::new(blocks[0].transactions[0].txid(), 0);
    let block = pow_block(
        blocks[0].hash(),
        2,
        vec![
            coinbase(2, COIN, block_time(2)),
            spend(young, COIN, block_time(2)),
        ],
        &harness.params,
    );
    harness.source.push(block);

    let (_tx, rx) = shutdown();
    let first = consensus.execute_next_block(&rx).expect("first");
    assert!(first.is_accepted());
    let second = consensus.execute_next_block(&rx).expect("second");
    assert_eq!(second.error, Some(RuleError::BadTransactionPrematureSpend));
    assert_eq!(consensus.tip().expect("tip").hash, blocks[0].hash());
    assert_eq!(consensus.counters().snapshot().rejected_blocks, 1);
}

#[test]
fn coinbase_claiming_more_than_subsidy_is_rejected() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(None));
    consensus.initialize().expect("initialize");

    let greedy = pow_block(
        harness.genesis.hash(),
        1,
        vec![coinbase(1, 4 * COIN + 1, block_time(1))],
        &harness.params,
    );
    harness.source.push(greedy);

    let (_tx, rx) = shutdown();
    let result = consensus.execute_next_block(&rx).expect("block result");
    assert_eq!(result.error, Some(RuleError::BadCoinbaseAmount));
    assert_eq!(consensus.tip().expect("tip").height, 0);
}

#[test]
fn wrong_coinbase_height_is_rejected() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(None));
    consensus.initialize().expect("initialize");

    let block = pow_block(
        harness.genesis.hash(),
        1,
        vec![coinbase(5, COIN, block_time(1))],
        &harness.params,
    );
    harness.source.push(block);

    let (_tx, rx) = shutdown();
    let result = consensus.execute_next_block(&rx).expect("block result");
    assert_eq!(result.error, Some(RuleError::BadCoinbaseHeight));
}

#[test]
fn source_reorg_signal_rewinds_and_reapplies() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(None));
    consensus.initialize().expect("initialize");
    let blocks = harness.extend(harness.genesis.hash(), 1, 3);

    let (_tx, rx) = shutdown();
    for _ in 0..3 {
        assert!(consensus.execute_next_block(&rx).expect("block").is_accepted());
    }
    assert_eq!(consensus.tip().expect("tip").height, 3);

    harness.source.signal_rewind();
    let result = consensus.execute_next_block(&rx).expect("reapplied");
    assert!(result.is_accepted());
    assert_eq!(result.block.hash(), blocks[2].hash());
    assert_eq!(consensus.tip().expect("tip").hash, blocks[2].hash());
    assert_eq!(harness.cache.tip_hash().expect("cache tip"), blocks[2].hash());
}

#[test]
fn template_check_leaves_state_untouched() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(None));
    consensus.initialize().expect("initialize");

    // Templates skip proof of work, so an unmined block is fine.
    let template = assemble(
        harness.genesis.hash(),
        block_time(1),
        vec![coinbase(1, 4 * COIN, block_time(1))],
    );
    let ctx = consensus
        .check_block(Arc::new(template.clone()))
        .expect("template accepted");
    assert!(ctx.check_only);
    assert_eq!(consensus.tip().expect("tip").height, 0);
    assert_eq!(
        harness.cache.tip_hash().expect("cache tip"),
        harness.genesis.hash()
    );

    let mut broken = template;
    broken.header.merkle_root = [1u8; 32];
    let err = consensus
        .check_block(Arc::new(broken))
        .expect_err("bad merkle root");
    assert!(matches!(
        err,
        ConsensusError::Validation(RuleError::BadMerkleRoot)
    ));
}

#[test]
fn execute_stops_when_shutdown_is_signalled() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(None));
    consensus.initialize().expect("initialize");
    harness.extend(harness.genesis.hash(), 1, 2);

    let (tx, rx) = shutdown();
    tx.send(true).expect("send shutdown");
    assert_eq!(consensus.execute(rx).count(), 0);
    assert_eq!(consensus.tip().expect("tip").height, 0);
}

#[test]
fn initialize_rewinds_coin_view_onto_header_chain() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(None));
    consensus.initialize().expect("initialize");
    let blocks = harness.extend(harness.genesis.hash(), 1, 3);

    let (_tx, rx) = shutdown();
    assert_eq!(consensus.execute(rx).filter_map(Result::ok).count(), 3);
    assert!(consensus.flush(true).expect("flush"));
    assert_eq!(harness.durable.tip_hash().expect("durable tip"), blocks[2].hash());

    // A header chain that only knows the first block.
    let chain = Arc::new(MemoryHeaderChain::new(ChainedHeader::genesis(
        harness.genesis.header.clone(),
    )));
    chain
        .push(blocks[0].header.clone(), false)
        .expect("extends genesis");
    let restarted = ConsensusLoop::new(
        Arc::clone(&harness.params),
        chain as Arc<dyn HeaderChain>,
        Arc::clone(&harness.cache) as Arc<dyn CoinView>,
        Arc::clone(&harness.source) as Arc<dyn BlockSource>,
        RuleSet::proof_of_work(None),
    )
    .with_time_source(Arc::new(FixedTime(i64::from(GENESIS_TIME) + 1_000_000)));
    restarted.initialize().expect("initialize restarted");

    assert_eq!(restarted.tip().expect("tip").hash, blocks[0].hash());
    assert_eq!(harness.cache.tip_hash().expect("cache tip"), blocks[0].hash());
    assert_eq!(harness.durable.tip_hash().expect("durable tip"), blocks[0].hash());
    assert_eq!(harness.source.options().lookahead, 1);
}

#[test]
fn loop_without_cache_writes_through() {
    let harness = Harness::new();
    let consensus = ConsensusLoop::new(
        Arc::clone(&harness.params),
        Arc::clone(&harness.chain) as Arc<dyn HeaderChain>,
        Arc::clone(&harness.durable) as Arc<dyn CoinView>,
        Arc::clone(&harness.source) as Arc<dyn BlockSource>,
        RuleSet::proof_of_work(None),
    )
    .with_time_source(Arc::new(FixedTime(i64::from(GENESIS_TIME) + 1_000_000)));
    assert!(consensus.cache().is_none());
    consensus.initialize().expect("initialize");
    let blocks = harness.extend(harness.genesis.hash(), 1, 2);

    let (_tx, rx) = shutdown();
    assert_eq!(consensus.execute(rx).filter_map(Result::ok).count(), 2);
    assert_eq!(harness.durable.tip_hash().expect("durable tip"), blocks[1].hash());
    assert_eq!(harness.durable.rewind_depth().expect("depth"), 2);
    assert_eq!(harness.source.options().lookahead, 0);
}

/// Accepts only inputs whose signature script is a lone `OP_TRUE`.
struct OpTrueVerifier;

impl InputVerifier for OpTrueVerifier {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        _spent: &TxOut,
        _flags: &ConsensusFlags,
    ) -> Result<(), String> {
        match tx.vin[input_index].script_sig.as_slice() {
            [0x51] => Ok(()),
            other => Err(format!("unexpected script {other:?}")),
        }
    }
}

#[test]
fn input_verifier_failure_names_the_input() {
    let harness = Harness::new();
    let consensus = harness.consensus(RuleSet::proof_of_work(Some(Arc::new(OpTrueVerifier))));
    consensus.initialize().expect("initialize");

    let blocks = harness.extend(harness.genesis.hash(), 1, 10);
    let matured = OutPoint::new(blocks[0].transactions[0].txid(), 0);
    let mut forged = spend(matured, 3 * COIN, block_time(11));
    forged.vin[0].script_sig = vec![0x00];
    let rejected = pow_block(
        blocks[9].hash(),
        11,
        vec![coinbase(11, 4 * COIN, block_time(11)), forged],
        &harness.params,
    );
    let accepted = pow_block(
        blocks[9].hash(),
        11,
        vec![
            coinbase(11, 4 * COIN, block_time(11)),
            spend(matured, 3 * COIN, block_time(11)),
        ],
        &harness.params,
    );
    harness.source.push(rejected);
    harness.source.push(accepted.clone());

    let (_tx, rx) = shutdown();
    let results: Vec<_> = consensus
        .execute(rx)
        .collect::<Result<Vec<_>, _>>()
        .expect("no fatal error");
    assert_eq!(results.len(), 12);
    assert_eq!(
        results[10].error,
        Some(RuleError::BadInputScript {
            tx_index: 1,
            input_index: 0,
        })
    );
    assert!(results[11].is_accepted());
    assert_eq!(consensus.tip().expect("tip").hash, accepted.hash());
}
