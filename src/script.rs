//! Script hashing and construction of the standard verification scripts

use bitcoin_hashes::{sha256d, Hash, HashEngine};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::constants::*;
use crate::types::{ByteString, Hash160, Hash256, ValidatorKey};

/// Hash256: SHA256(SHA256(data))
pub fn hash256(data: &[u8]) -> Hash256 {
    let mut engine = sha256d::Hash::engine();
    engine.input(data);
    let result = sha256d::Hash::from_engine(engine);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result[..]);
    hash
}

/// Hash160: RIPEMD160(SHA256(data)), the script hash of `data`
pub fn hash160(data: &[u8]) -> Hash160 {
    let sha256_hash = Sha256::digest(data);
    let ripemd160_hash = Ripemd160::digest(sha256_hash);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&ripemd160_hash);
    hash
}

/// Append a push of `data` using the shortest push opcode
pub fn emit_push_bytes(script: &mut ByteString, data: &[u8]) {
    if data.is_empty() {
        script.push(OP_PUSH0);
    } else if data.len() <= OP_PUSHBYTES75 as usize {
        script.push(OP_PUSHBYTES1 + (data.len() as u8 - 1));
        script.extend_from_slice(data);
    } else if data.len() <= u8::MAX as usize {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
        script.extend_from_slice(data);
    } else {
        // PUSHDATA2
        script.push(OP_PUSHDATA1 + 1);
        script.extend_from_slice(&(data.len() as u16).to_le_bytes());
        script.extend_from_slice(data);
    }
}

/// Append a push of a small integer
pub fn emit_push_number(script: &mut ByteString, value: usize) {
    match value {
        0 => script.push(OP_PUSH0),
        1..=16 => script.push(OP_PUSHT + (value as u8 - 1)),
        _ => {
            let bytes = (value as u64).to_le_bytes();
            let len = bytes.iter().rposition(|b| *b != 0).map_or(1, |i| i + 1);
            let mut encoded = bytes[..len].to_vec();
            if encoded[len - 1] & 0x80 != 0 {
                encoded.push(0);
            }
            emit_push_bytes(script, &encoded);
        }
    }
}

/// Single-signature contract: `<key> CHECKSIG`
pub fn signature_redeem_script(key: &ValidatorKey) -> ByteString {
    let mut script = Vec::with_capacity(35);
    emit_push_bytes(&mut script, key.as_bytes());
    script.push(OP_CHECKSIG);
    script
}

/// m-of-n multisig contract: `<m> <key>... <n> CHECKMULTISIG`
///
/// Keys are emitted in ascending order regardless of input order.
pub fn multisig_redeem_script(m: usize, keys: &[ValidatorKey]) -> ByteString {
    let mut sorted = keys.to_vec();
    sorted.sort();
    let mut script = Vec::with_capacity(3 + sorted.len() * 34);
    emit_push_number(&mut script, m);
    for key in &sorted {
        emit_push_bytes(&mut script, key.as_bytes());
    }
    emit_push_number(&mut script, sorted.len());
    script.push(OP_CHECKMULTISIG);
    script
}

/// Signatures needed from `n` validators: n - (n - 1) / 3
pub fn consensus_threshold(n: usize) -> usize {
    n - n.saturating_sub(1) / 3
}

/// Redeem script that must sign blocks produced by `validators`
pub fn consensus_redeem_script(validators: &[ValidatorKey]) -> ByteString {
    multisig_redeem_script(consensus_threshold(validators.len()), validators)
}

/// Script hash that must sign blocks produced by `validators`
pub fn consensus_address(validators: &[ValidatorKey]) -> Hash160 {
    hash160(&consensus_redeem_script(validators))
}

/// Verification script delegating to the `verify` entry point of contract `hash`
pub fn app_call_verification_script(hash: &Hash160) -> ByteString {
    let mut script = Vec::with_capacity(32);
    // empty argument array
    script.push(OP_PUSH0);
    script.push(OP_PACK);
    emit_push_bytes(&mut script, VERIFY_METHOD.as_bytes());
    script.push(OP_APPCALL);
    script.extend_from_slice(hash);
    script
}

/// Whether `script` consists of push operations only
///
/// Invocation scripts feed arguments to verification scripts and may not run
/// any other instruction.
pub fn is_push_only(script: &[u8]) -> bool {
    let mut position = 0;
    while position < script.len() {
        let opcode = script[position];
        position += 1;
        let skip = match opcode {
            OP_PUSH0 => 0,
            OP_PUSHBYTES1..=OP_PUSHBYTES75 => opcode as usize,
            OP_PUSHDATA1 => match script.get(position) {
                Some(len) => 1 + *len as usize,
                None => return false,
            },
            0x4d => match script.get(position..position + 2) {
                Some(len) => 2 + u16::from_le_bytes([len[0], len[1]]) as usize,
                None => return false,
            },
            0x4e => match script.get(position..position + 4) {
                Some(len) => 4 + u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize,
                None => return false,
            },
            // PUSHM1 and PUSH1..PUSH16
            0x4f..=OP_PUSH16 => 0,
            _ => return false,
        };
        position += skip;
        if position > script.len() {
            return false;
        }
    }
    true
}
