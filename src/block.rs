//! Block and consensus payload verification

use std::slice;
use tracing::debug;

use crate::economic::network_fee;
use crate::error::{LedgerError, Result};
use crate::script::{consensus_address, hash160, signature_redeem_script};
use crate::storage::ReadStorage;
use crate::transaction::{verify_transaction, VerifyContext};
use crate::types::*;
use crate::validators::get_validators;
use crate::vm::ScriptContainer;
use crate::witness::verify_witnesses;

fn invalid(message: String) -> LedgerError {
    LedgerError::Verify(message)
}

/// CheckBlock: ℬ → {valid, invalid}
///
/// 1. txs[0] is the only miner transaction
/// 2. header merkle root == MerkleRoot(txs)
pub fn check_block(block: &Block) -> Result<()> {
    // 1. Miner transaction
    match block.transactions.first() {
        Some(tx) if tx.transaction_type() == TransactionType::Miner => {}
        _ => return Err(invalid("First transaction must be a miner transaction".to_string())),
    }
    if block.transactions[1..]
        .iter()
        .any(|tx| tx.transaction_type() == TransactionType::Miner)
    {
        return Err(invalid("Block contains more than one miner transaction".to_string()));
    }

    // 2. Merkle root
    if block.header.merkle_root != block.compute_merkle_root() {
        return Err(invalid("Invalid merkle root".to_string()));
    }
    Ok(())
}

/// VerifyBlock (base): ℬ × 𝒮 → {valid, invalid}
///
/// 1. CheckBlock
/// 2. The block is not stored yet
/// 3. prev = header at `previous_hash` exists, with index + 1 == index and
///    an older timestamp
/// 4. The header witness satisfies `prev.next_consensus`
pub fn verify_block_base<R: ReadStorage>(ctx: &VerifyContext<'_, R>, block: &Block) -> Result<()> {
    check_block(block)?;

    let hash = block.hash();
    if ctx.view.try_get::<Block>(&hash)?.is_some() {
        return Err(invalid(format!("Block {} already exists", short_hex(&hash))));
    }

    let previous = ctx
        .view
        .try_get::<Header>(&block.previous_hash())?
        .ok_or_else(|| invalid(format!("Previous header {} not found", short_hex(&block.previous_hash()))))?;
    if previous.index + 1 != block.index() {
        return Err(invalid(format!(
            "Expected block index {}, found {}",
            previous.index + 1,
            block.index()
        )));
    }
    if previous.timestamp >= block.timestamp() {
        return Err(invalid("Block timestamp must be later than its predecessor".to_string()));
    }

    verify_witnesses(
        ctx.vm,
        ctx.settings,
        ctx.view,
        ScriptContainer::Block(block),
        vec![previous.next_consensus],
        slice::from_ref(&block.header.script),
        ctx.settings.max_verification_gas,
    )?
    .into_result()?;
    Ok(())
}

/// VerifyBlock (complete): base checks plus
///
/// 5. next_consensus == ConsensusAddress(GetValidators(txs))
/// 6. every transaction verifies against the others in the block
/// 7. Σ miner outputs == Σ network fees
pub fn verify_block<R: ReadStorage>(ctx: &VerifyContext<'_, R>, block: &Block) -> Result<()> {
    verify_block_base(ctx, block)?;

    // 5. Next consensus
    let validators = get_validators(ctx.view, ctx.settings, &block.transactions)?;
    if consensus_address(&validators) != block.header.next_consensus {
        return Err(invalid("Invalid next consensus address".to_string()));
    }

    // 6. Transactions
    for tx in &block.transactions {
        verify_transaction(ctx, tx, &block.transactions)
            .map_err(LedgerError::into_verify_error)?
            .into_result()?;
    }

    // 7. Miner reward
    let mut fees = 0;
    for tx in &block.transactions {
        fees += network_fee(ctx.view, ctx.settings, tx)?;
    }
    let reward: Fixed8 = block.transactions[0].outputs.iter().map(|output| output.value).sum();
    if reward != fees {
        return Err(invalid(format!("Miner outputs {} do not match network fee {}", reward, fees)));
    }

    debug!(index = block.index(), "block verified");
    Ok(())
}

/// VerifyConsensusPayload: 𝒫 × 𝒮 → {valid, invalid}
///
/// 1. block_index > current index and previous_hash == current hash
/// 2. validator_index addresses one of the current validators
/// 3. The witness satisfies that validator's signature contract
pub fn verify_consensus_payload<R: ReadStorage>(
    ctx: &VerifyContext<'_, R>,
    payload: &ConsensusPayload,
    current: &Header,
) -> Result<()> {
    if payload.block_index <= current.index {
        return Err(invalid(format!(
            "Payload index {} is not above current index {}",
            payload.block_index, current.index
        )));
    }
    if payload.previous_hash != current.hash() {
        return Err(invalid("Payload does not extend the current block".to_string()));
    }

    let validators = get_validators(ctx.view, ctx.settings, &[])?;
    let validator = validators
        .get(usize::from(payload.validator_index))
        .ok_or_else(|| invalid(format!("Invalid validator index {}", payload.validator_index)))?;

    verify_witnesses(
        ctx.vm,
        ctx.settings,
        ctx.view,
        ScriptContainer::Consensus(payload),
        vec![hash160(&signature_redeem_script(validator))],
        slice::from_ref(&payload.script),
        ctx.settings.max_verification_gas,
    )?
    .into_result()?;
    Ok(())
}
