//! Minimal script inspection: the standard output templates the node needs to locate a
//! staker's public key, plus push-data helpers.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;

pub const COMPRESSED_PUBKEY_SIZE: usize = 33;
pub const UNCOMPRESSED_PUBKEY_SIZE: usize = 65;

fn is_pubkey_len(len: usize) -> bool {
    len == COMPRESSED_PUBKEY_SIZE || len == UNCOMPRESSED_PUBKEY_SIZE
}

/// `<pubkey> OP_CHECKSIG`
pub fn extract_p2pk(script: &[u8]) -> Option<&[u8]> {
    let (&len, rest) = script.split_first()?;
    let len = len as usize;
    if !is_pubkey_len(len) || rest.len() != len + 1 || rest[len] != OP_CHECKSIG {
        return None;
    }
    Some(&rest[..len])
}

/// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
pub fn extract_p2pkh(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() != 25
        || script[0] != OP_DUP
        || script[1] != OP_HASH160
        || script[2] != 20
        || script[23] != OP_EQUALVERIFY
        || script[24] != OP_CHECKSIG
    {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[3..23]);
    Some(hash)
}

pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = push_data(pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160, 20];
    script.extend_from_slice(key_hash);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn op_return_script(payload: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_RETURN];
    script.extend_from_slice(&push_data(payload));
    script
}

/// Encodes `data` as a single minimal push.
pub fn push_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    match data.len() {
        len @ 0..=0x4b => out.push(len as u8),
        len @ 0x4c..=0xff => {
            out.push(OP_PUSHDATA1);
            out.push(len as u8);
        }
        len @ 0x100..=0xffff => {
            out.push(OP_PUSHDATA2);
            out.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            out.push(OP_PUSHDATA4);
            out.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
    out
}

/// Splits a push-only script into its pushed payloads. Returns `None` on a non-push
/// opcode or a truncated push. Small-integer opcodes yield their numeric encoding.
pub fn parse_pushes(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut pushes = Vec::new();
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let len = match opcode {
            OP_0 => {
                pushes.push(Vec::new());
                continue;
            }
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(cursor..cursor + 2)?;
                cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(cursor..cursor + 4)?;
                cursor += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            OP_1NEGATE => {
                pushes.push(vec![0x81]);
                continue;
            }
            OP_1..=OP_16 => {
                pushes.push(vec![opcode - OP_1 + 1]);
                continue;
            }
            _ => return None,
        };
        let data = script.get(cursor..cursor.checked_add(len)?)?;
        cursor += len;
        pushes.push(data.to_vec());
    }
    Some(pushes)
}

/// Payload pushes of an `OP_RETURN` output.
pub fn op_return_pushes(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    match script.split_first() {
        Some((&OP_RETURN, rest)) => parse_pushes(rest),
        _ => None,
    }
}

/// The final pushed item of a signature script, which for pay-to-pubkey-hash spends is
/// the spender's public key.
pub fn last_push(script_sig: &[u8]) -> Option<Vec<u8>> {
    parse_pushes(script_sig)?.pop()
}

/// Minimal little-endian script number encoding.
pub fn script_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

/// The coinbase script prefix committing to the block height.
pub fn coinbase_height_prefix(height: i32) -> Vec<u8> {
    match height {
        0 => vec![OP_0],
        1..=16 => vec![OP_1 + (height as u8) - 1],
        _ => push_data(&script_num(i64::from(height))),
    }
}
