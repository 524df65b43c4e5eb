//! Block signature checks.
//!
//! Proof-of-work blocks carry no signature. Proof-of-stake blocks are signed over the
//! header hash by the key controlling the coinstake's kernel output (`vout[1]`).

use std::sync::OnceLock;

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey, VerifyOnly};
use stakd_consensus::Hash256;
use stakd_primitives::block::Block;
use stakd_primitives::hash::hash160;
use stakd_primitives::script::{extract_p2pk, extract_p2pkh, last_push, op_return_pushes};
use stakd_primitives::transaction::Transaction;

use crate::era::ProtocolEra;
use crate::PosError;

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

pub fn check_block_signature(block: &Block, era: ProtocolEra) -> Result<(), PosError> {
    if !block.is_proof_of_stake() {
        return if block.signature.is_empty() {
            Ok(())
        } else {
            Err(PosError::UnexpectedSignature)
        };
    }
    if block.signature.is_empty() {
        return Err(PosError::BadSignature("missing block signature"));
    }

    let coinstake = &block.transactions[1];
    let pubkey = signer_key(coinstake, era)?;
    let pubkey = PublicKey::from_slice(&pubkey)
        .map_err(|_| PosError::UnknownSigner("invalid kernel public key"))?;
    let mut sig = Signature::from_der(&block.signature)
        .map_err(|_| PosError::BadSignature("invalid block signature encoding"))?;
    sig.normalize_s();
    let msg = Message::from_digest_slice(&block.hash())
        .map_err(|_| PosError::BadSignature("invalid block hash digest"))?;
    secp256k1_verify()
        .verify_ecdsa(&msg, &sig, &pubkey)
        .map_err(|_| PosError::BadSignature("block signature verification failed"))
}

/// Locates the public key that must have signed the block.
fn signer_key(coinstake: &Transaction, era: ProtocolEra) -> Result<Vec<u8>, PosError> {
    let kernel = coinstake
        .vout
        .get(1)
        .ok_or(PosError::UnknownSigner("coinstake has no kernel output"))?;

    if let Some(pubkey) = extract_p2pk(&kernel.script_pubkey) {
        return Ok(pubkey.to_vec());
    }

    let key_hash = extract_p2pkh(&kernel.script_pubkey)
        .ok_or(PosError::UnknownSigner("unsupported kernel output script"))?;

    if era >= ProtocolEra::V3 {
        let published = coinstake
            .vout
            .iter()
            .filter_map(|output| op_return_pushes(&output.script_pubkey))
            .filter_map(|pushes| pushes.into_iter().next())
            .find(|pubkey| hash160(pubkey) == key_hash);
        if let Some(pubkey) = published {
            return Ok(pubkey);
        }
    }

    let pubkey = coinstake
        .vin
        .first()
        .and_then(|input| last_push(&input.script_sig))
        .ok_or(PosError::UnknownSigner("kernel spend carries no public key"))?;
    if hash160(&pubkey) != key_hash {
        return Err(PosError::UnknownSigner("kernel public key does not match output"));
    }
    Ok(pubkey)
}

/// DER signature over a block hash, as carried in `Block::signature`.
pub fn sign_block_hash(secret: &SecretKey, hash: &Hash256) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    let msg = Message::from_digest(*hash);
    secp.sign_ecdsa(&msg, secret).serialize_der().to_vec()
}
