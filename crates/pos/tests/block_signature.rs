use secp256k1::{PublicKey, Secp256k1, SecretKey};
use stakd_pos::{check_block_signature, sign_block_hash, PosError, ProtocolEra};
use stakd_primitives::block::{Block, BlockHeader};
use stakd_primitives::hash::hash160;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::script::{op_return_script, p2pk_script, p2pkh_script, push_data};
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};

fn keypair(byte: u8) -> (SecretKey, Vec<u8>) {
    let secret = SecretKey::from_slice(&[byte; 32]).expect("secret key");
    let pubkey = PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret);
    (secret, pubkey.serialize().to_vec())
}

fn coinbase() -> Transaction {
    Transaction {
        version: 1,
        time: 1_600,
        vin: vec![TxIn::new(OutPoint::null(), vec![0x01, 0x02])],
        vout: vec![TxOut::empty()],
        lock_time: 0,
    }
}

fn stake_block(kernel_script: Vec<u8>, script_sig: Vec<u8>, extra: Vec<TxOut>) -> Block {
    let mut vout = vec![TxOut::empty(), TxOut::new(50, kernel_script)];
    vout.extend(extra);
    let coinstake = Transaction {
        version: 1,
        time: 1_600,
        vin: vec![TxIn::new(OutPoint::new([7u8; 32], 0), script_sig)],
        vout,
        lock_time: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version: 7,
            prev_block: [3u8; 32],
            merkle_root: [0u8; 32],
            time: 1_600,
            bits: 0x207fffff,
            nonce: 0,
        },
        transactions: vec![coinbase(), coinstake],
        signature: Vec::new(),
    };
    block.header.merkle_root = block.compute_merkle_root().root;
    block
}

#[test]
fn proof_of_work_block_must_be_unsigned() {
    let mut block = stake_block(Vec::new(), Vec::new(), Vec::new());
    block.transactions.truncate(1);
    assert!(block.is_proof_of_work());
    assert_eq!(check_block_signature(&block, ProtocolEra::V2), Ok(()));
    block.signature = vec![0x30];
    assert_eq!(
        check_block_signature(&block, ProtocolEra::V2),
        Err(PosError::UnexpectedSignature)
    );
}

#[test]
fn p2pk_kernel_signature_verifies() {
    let (secret, pubkey) = keypair(0x11);
    let mut block = stake_block(p2pk_script(&pubkey), Vec::new(), Vec::new());
    block.signature = sign_block_hash(&secret, &block.hash());
    assert_eq!(check_block_signature(&block, ProtocolEra::V2), Ok(()));

    let (other, _) = keypair(0x22);
    block.signature = sign_block_hash(&other, &block.hash());
    assert!(matches!(
        check_block_signature(&block, ProtocolEra::V2),
        Err(PosError::BadSignature(_))
    ));
}

#[test]
fn p2pkh_kernel_uses_script_sig_key() {
    let (secret, pubkey) = keypair(0x33);
    let script_sig = [push_data(&[0x30; 71]), push_data(&pubkey)].concat();
    let mut block = stake_block(p2pkh_script(&hash160(&pubkey)), script_sig, Vec::new());
    block.signature = sign_block_hash(&secret, &block.hash());
    assert_eq!(check_block_signature(&block, ProtocolEra::V2), Ok(()));
}

#[test]
fn p2pkh_kernel_with_mismatched_key_is_rejected() {
    let (secret, pubkey) = keypair(0x33);
    let (_, other) = keypair(0x44);
    let mut block = stake_block(p2pkh_script(&hash160(&other)), push_data(&pubkey), Vec::new());
    block.signature = sign_block_hash(&secret, &block.hash());
    assert!(matches!(
        check_block_signature(&block, ProtocolEra::V2),
        Err(PosError::UnknownSigner(_))
    ));
}

#[test]
fn op_return_key_only_honored_from_v3() {
    let (secret, pubkey) = keypair(0x55);
    let published = TxOut::new(0, op_return_script(&pubkey));
    let mut block = stake_block(p2pkh_script(&hash160(&pubkey)), Vec::new(), vec![published]);
    block.signature = sign_block_hash(&secret, &block.hash());
    assert_eq!(check_block_signature(&block, ProtocolEra::V3), Ok(()));
    assert!(matches!(
        check_block_signature(&block, ProtocolEra::V2),
        Err(PosError::UnknownSigner(_))
    ));
}

#[test]
fn missing_signature_on_stake_block() {
    let (_, pubkey) = keypair(0x66);
    let block = stake_block(p2pk_script(&pubkey), Vec::new(), Vec::new());
    assert!(matches!(
        check_block_signature(&block, ProtocolEra::V3),
        Err(PosError::BadSignature(_))
    ));
}
