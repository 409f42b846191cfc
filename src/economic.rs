//! Fees, per-asset transaction results and generation claims

use std::collections::BTreeMap;

use crate::error::{LedgerError, Result};
use crate::settings::Settings;
use crate::state::{Coin, TransactionData};
use crate::storage::ReadStorage;
use crate::types::*;

/// SystemFee: 𝒯𝒳 → ℤ
///
/// - invocation: the gas it pays for
/// - state: register-validator fee per descriptor enabling a validator
/// - everything else: the fee table entry for its type
pub fn system_fee(settings: &Settings, tx: &Transaction) -> Fixed8 {
    match &tx.kind {
        TransactionKind::Invocation { gas, .. } => *gas,
        TransactionKind::State { descriptors } => {
            let enabling = descriptors
                .iter()
                .filter(|d| {
                    d.descriptor_type == StateDescriptorType::Validator
                        && d.value.iter().any(|b| *b != 0)
                })
                .count() as i64;
            enabling * settings.register_validator_fee
        }
        _ => settings.fee(tx.transaction_type()),
    }
}

/// Sum of the system fees of every transaction in `block`
pub fn block_system_fee(settings: &Settings, block: &Block) -> Fixed8 {
    block.transactions.iter().map(|tx| system_fee(settings, tx)).sum()
}

/// Value consumed per asset: Σ inputs - Σ outputs
///
/// Positive entries are destroyed, negative entries issued. Zero entries
/// are dropped.
pub fn transaction_results<R: ReadStorage>(view: &R, tx: &Transaction) -> Result<BTreeMap<Hash256, Fixed8>> {
    let mut results: BTreeMap<Hash256, Fixed8> = BTreeMap::new();
    for input in &tx.inputs {
        let coin = view.get::<Coin>(input)?;
        *results.entry(coin.output.asset).or_default() += coin.output.value;
    }
    for output in &tx.outputs {
        *results.entry(output.asset).or_default() -= output.value;
    }
    results.retain(|_, value| *value != 0);
    Ok(results)
}

/// NetworkFee: utility in - utility out - system fee; zero for miner and claim
pub fn network_fee<R: ReadStorage>(view: &R, settings: &Settings, tx: &Transaction) -> Result<Fixed8> {
    match tx.transaction_type() {
        TransactionType::Miner | TransactionType::Claim => Ok(0),
        _ => {
            let results = transaction_results(view, tx)?;
            let utility = results.get(&settings.utility_token).copied().unwrap_or(0);
            Ok(utility - system_fee(settings, tx))
        }
    }
}

/// Whether the coin referenced by `input` has been spent
pub fn is_spent<R: ReadStorage>(view: &R, input: &Input) -> Result<bool> {
    Ok(view
        .try_get::<TransactionData>(&input.hash)?
        .map_or(false, |data| data.end_heights.contains_key(&input.index)))
}

/// Utility tokens generated between heights `[start, end)`, in whole units
pub fn generated_amount(settings: &Settings, start: u32, end: u32) -> i64 {
    if end <= start {
        return 0;
    }
    let interval = settings.decrement_interval;
    let steps = settings.generation_amount.len() as u32;

    let mut ustart = start / interval;
    if ustart >= steps {
        return 0;
    }
    let mut istart = start % interval;
    let mut uend = end / interval;
    let mut iend = end % interval;
    if uend >= steps {
        uend = steps;
        iend = 0;
    }
    if iend == 0 {
        uend -= 1;
        iend = interval;
    }

    let mut amount = 0i64;
    while ustart < uend {
        amount += i64::from(interval - istart) * settings.generation_amount[ustart as usize];
        ustart += 1;
        istart = 0;
    }
    amount + i64::from(iend - istart) * settings.generation_amount[ustart as usize]
}

/// CalculateClaimAmount: utility tokens claimable by the spent governing
/// coins `claims`
///
/// Every coin must be spent (`CoinUnspent`), unclaimed (`CoinClaimed`) and
/// hold the governing token (`InvalidClaim`). Coins are grouped by
/// `(start height, end height)`; each group earns the generation over that
/// range plus the system fees paid in it, in proportion to its share of the
/// governing supply. `system_fee_at(i)` returns the accumulated system fee
/// up to block `i`.
pub fn calculate_claim_amount<R: ReadStorage>(
    view: &R,
    settings: &Settings,
    claims: &[Input],
    system_fee_at: impl Fn(u32) -> Result<Fixed8>,
) -> Result<Fixed8> {
    struct SpentCoin {
        output: Output,
        start_height: u32,
        end_height: Option<u32>,
        claimed: bool,
    }

    let mut coins = Vec::with_capacity(claims.len());
    for claim in claims {
        let data = view.try_get::<TransactionData>(&claim.hash)?;
        let coin = view.try_get::<Coin>(claim)?;
        match (data, coin) {
            (Some(data), Some(coin)) => coins.push(SpentCoin {
                output: coin.output,
                start_height: data.start_height,
                end_height: data.end_heights.get(&claim.index).copied(),
                claimed: data.claimed.contains(&claim.index),
            }),
            _ => return Err(LedgerError::CoinUnspent),
        }
    }

    if coins.iter().any(|coin| coin.end_height.is_none()) {
        return Err(LedgerError::CoinUnspent);
    }
    if coins.iter().any(|coin| coin.claimed) {
        return Err(LedgerError::CoinClaimed);
    }
    if coins.iter().any(|coin| coin.output.asset != settings.governing_token) {
        return Err(LedgerError::InvalidClaim);
    }

    let mut groups: BTreeMap<(u32, u32), Fixed8> = BTreeMap::new();
    for coin in &coins {
        let end_height = coin.end_height.unwrap_or(coin.start_height);
        *groups.entry((coin.start_height, end_height)).or_default() += coin.output.value;
    }

    let mut total = 0i128;
    for ((start, end), value) in groups {
        let generated = i128::from(generated_amount(settings, start, end)) * i128::from(crate::constants::FIXED8_ONE);
        let fees = if end > 0 {
            let end_fee = system_fee_at(end - 1)?;
            let start_fee = if start == 0 { 0 } else { system_fee_at(start - 1)? };
            i128::from(end_fee - start_fee)
        } else {
            0
        };
        total += i128::from(value) * (generated + fees);
    }

    Ok((total / i128::from(settings.governing_token_amount())) as Fixed8)
}
