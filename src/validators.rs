//! Validator vote bookkeeping and election
//!
//! Votes are weighted by governing-token balance. An account voting for `k`
//! validators adds its balance to each of them and to validators-count slot
//! `k - 1`. The number of validators to elect is a trimmed weighted average
//! over the non-zero slots, never below the number of standby validators.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::cache::Overlay;
use crate::entity::Updatable;
use crate::constants::{VALIDATOR_COUNT_TRIM_END, VALIDATOR_COUNT_TRIM_START};
use crate::error::{LedgerError, Result};
use crate::settings::Settings;
use crate::state::*;
use crate::storage::ReadStorage;
use crate::types::*;

/// WeightedFilter: keep the part of `input` whose cumulative weight lies in
/// `(start, end]` as a fraction of the total
///
/// Items straddling a boundary keep only the share of their weight inside
/// the window. Returns `(item, clamped weight)` pairs. An input whose total
/// weight is zero yields nothing.
pub fn weighted_filter<T: Clone>(
    input: &[T],
    start: f64,
    end: f64,
    weight_of: impl Fn(&T) -> i64,
) -> Vec<(T, i64)> {
    let amount: i64 = input.iter().map(&weight_of).sum();
    if amount == 0 {
        return Vec::new();
    }
    let total = amount as f64;

    let mut result = Vec::new();
    let mut sum = 0i64;
    let mut current = 0f64;
    for item in input {
        if current >= end {
            break;
        }
        let weight = weight_of(item);
        sum += weight;
        let old = current;
        current = sum as f64 / total;
        if current <= start {
            continue;
        }

        let clamped = if old < start {
            if current > end {
                ((end - start) * total) as i64
            } else {
                ((current - start) * total) as i64
            }
        } else if current > end {
            ((end - old) * total) as i64
        } else {
            weight
        };
        result.push((item.clone(), clamped));
    }
    result
}

/// WeightedAverage: Σ(value × weight) / Σ weight, 0 when either sum is 0
pub fn weighted_average(input: &[(i64, i64)]) -> i64 {
    let mut sum_weight = 0i128;
    let mut sum_value = 0i128;
    for (value, weight) in input {
        sum_weight += i128::from(*weight);
        sum_value += i128::from(*value) * i128::from(*weight);
    }
    if sum_value == 0 || sum_weight == 0 {
        return 0;
    }
    (sum_value / sum_weight) as i64
}

/// Vote delta and registration flag accumulated for one validator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatorChange {
    pub registered: Option<bool>,
    pub votes: Fixed8,
}

/// Effect of the state descriptors of a set of transactions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorChanges {
    pub validators: BTreeMap<ValidatorKey, ValidatorChange>,
    /// New vote list per account
    pub accounts: BTreeMap<Hash160, Vec<ValidatorKey>>,
    /// Delta per validators-count slot
    pub validators_count: BTreeMap<usize, Fixed8>,
}

impl DescriptorChanges {
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty() && self.accounts.is_empty() && self.validators_count.is_empty()
    }
}

/// Decode the vote list carried by an account descriptor
///
/// Layout: var-int count followed by `count` compressed public keys.
pub fn parse_votes(value: &[u8]) -> Result<Vec<ValidatorKey>> {
    let invalid = || LedgerError::Verify("Invalid account state descriptor".to_string());
    let (count, mut position) = match value.first() {
        None => return Err(invalid()),
        Some(0xfd) => {
            let bytes = value.get(1..3).ok_or_else(invalid)?;
            (u16::from_le_bytes([bytes[0], bytes[1]]) as usize, 3)
        }
        Some(prefix) if *prefix < 0xfd => (*prefix as usize, 1),
        Some(_) => return Err(invalid()),
    };

    let mut votes = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let bytes = value.get(position..position + 33).ok_or_else(invalid)?;
        votes.push(ValidatorKey::from_slice(bytes)?);
        position += 33;
    }
    if position != value.len() {
        return Err(invalid());
    }
    Ok(votes)
}

/// Encode a vote list as carried by an account descriptor
pub fn encode_votes(votes: &[ValidatorKey]) -> ByteString {
    let mut value = Vec::with_capacity(3 + votes.len() * 33);
    if votes.len() < 0xfd {
        value.push(votes.len() as u8);
    } else {
        value.push(0xfd);
        value.extend_from_slice(&(votes.len() as u16).to_le_bytes());
    }
    for key in votes {
        value.extend_from_slice(key.as_bytes());
    }
    value
}

/// Compute the vote moves requested by the state descriptors of `transactions`
///
/// Per account only the last descriptor counts. Its current governing
/// balance (read through `view`) is withdrawn from the old votes and given
/// to the new ones; when the vote count changes the balance also moves
/// between validators-count slots.
pub fn get_descriptor_changes<R: ReadStorage>(
    view: &R,
    transactions: &[&Transaction],
    governing_token: &Hash256,
) -> Result<DescriptorChanges> {
    let mut changes = DescriptorChanges::default();
    let mut account_votes: BTreeMap<Hash160, Vec<ValidatorKey>> = BTreeMap::new();

    for descriptor in transactions.iter().flat_map(|tx| tx.descriptors()) {
        match descriptor.descriptor_type {
            StateDescriptorType::Account => {
                let hash: Hash160 = descriptor.key.as_slice().try_into().map_err(|_| {
                    LedgerError::Verify("Invalid account state descriptor key".to_string())
                })?;
                account_votes.insert(hash, parse_votes(&descriptor.value)?);
            }
            StateDescriptorType::Validator => {
                let key = ValidatorKey::from_slice(&descriptor.key)?;
                let registered = descriptor.value.iter().any(|b| *b != 0);
                changes.validators.entry(key).or_default().registered = Some(registered);
            }
        }
    }

    for (hash, votes) in account_votes {
        let account = view.try_get::<Account>(&hash)?.unwrap_or_else(|| Account::new(hash));
        let balance = account.balance(governing_token);

        for old in &account.votes {
            changes.validators.entry(*old).or_default().votes -= balance;
        }
        for new in &votes {
            changes.validators.entry(*new).or_default().votes += balance;
        }
        if account.votes.len() != votes.len() {
            if !account.votes.is_empty() {
                *changes.validators_count.entry(account.votes.len() - 1).or_default() -= balance;
            }
            if !votes.is_empty() {
                *changes.validators_count.entry(votes.len() - 1).or_default() += balance;
            }
        }
        changes.accounts.insert(hash, votes);
    }

    Ok(changes)
}

/// Apply validator and validators-count changes to `overlay`
///
/// An absent validator is added; one that ends up unregistered with zero
/// votes is deleted; anything else is updated.
pub fn apply_descriptor_changes<S: ReadStorage>(
    overlay: &mut Overlay<'_, S>,
    changes: &DescriptorChanges,
) -> Result<()> {
    if !changes.validators_count.is_empty() {
        let mut count = overlay.try_get::<ValidatorsCount>(&())?.unwrap_or_default();
        for (slot, delta) in &changes.validators_count {
            count.add(*slot, *delta);
        }
        overlay.add(count, true)?;
    }

    for (key, change) in &changes.validators {
        match overlay.try_get::<Validator>(key)? {
            None => overlay.add(
                Validator {
                    public_key: *key,
                    registered: change.registered.unwrap_or(false),
                    votes: change.votes,
                },
                false,
            )?,
            Some(existing) => {
                let update = ValidatorUpdate {
                    registered: change.registered,
                    votes: Some(existing.votes + change.votes),
                };
                if existing.update(update.clone()).is_deletable() {
                    overlay.delete::<Validator>(key);
                } else {
                    overlay.update(&existing, update);
                }
            }
        }
    }
    Ok(())
}

/// Move `delta` governing tokens onto `votes` and their validators-count slot
pub fn apply_vote_delta<S: ReadStorage>(
    overlay: &mut Overlay<'_, S>,
    votes: &[ValidatorKey],
    delta: Fixed8,
) -> Result<()> {
    if delta == 0 || votes.is_empty() {
        return Ok(());
    }
    for key in votes {
        let validator = overlay.try_get::<Validator>(key)?.unwrap_or_else(|| Validator::new(*key));
        let votes = validator.votes + delta;
        overlay.update(&validator, ValidatorUpdate { registered: None, votes: Some(votes) });
    }
    let mut count = overlay.try_get::<ValidatorsCount>(&())?.unwrap_or_default();
    count.add(votes.len() - 1, delta);
    overlay.add(count, true)
}

/// Delete every validator in `keys` that is unregistered and has no votes
pub fn collect_garbage<S: ReadStorage>(
    overlay: &mut Overlay<'_, S>,
    keys: impl IntoIterator<Item = ValidatorKey>,
) -> Result<()> {
    for key in keys {
        if let Some(validator) = overlay.try_get::<Validator>(&key)? {
            if validator.is_deletable() {
                overlay.delete::<Validator>(&key);
            }
        }
    }
    Ok(())
}

/// GetValidators: elect the validators for the chain state in `view` after
/// applying `transactions`
///
/// 1. Replay coin movements of every transaction onto balances and votes
/// 2. Drop validators left unregistered with zero votes
/// 3. Apply the state descriptors
/// 4. N = max(trimmed weighted average over validators-count slots, |standby|)
/// 5. Rank registered validators with votes (and standby ones) by votes
///    descending, public key ascending; take N, pad from standby in declared
///    order, return in ascending key order
///
/// Nothing is written back to `view`.
pub fn get_validators<S: ReadStorage>(
    view: &S,
    settings: &Settings,
    transactions: &[Transaction],
) -> Result<Vec<ValidatorKey>> {
    let mut cache = Overlay::new(view);

    let pending: HashMap<Input, Output> = transactions
        .iter()
        .flat_map(|tx| {
            let hash = tx.hash();
            tx.outputs
                .iter()
                .enumerate()
                .map(move |(index, output)| (Input { hash, index: index as u32 }, output.clone()))
        })
        .collect();

    let mut touched = BTreeSet::new();
    for tx in transactions {
        for input in &tx.inputs {
            let output = match pending.get(input) {
                Some(output) => output.clone(),
                None => view.get::<Coin>(input)?.output,
            };
            process_output(&mut cache, settings, &output, -output.value)?;
            touched.insert(output.address);
        }
        for output in &tx.outputs {
            process_output(&mut cache, settings, output, output.value)?;
            touched.insert(output.address);
        }
    }

    let mut voted = BTreeSet::new();
    for hash in &touched {
        if let Some(account) = cache.try_get::<Account>(hash)? {
            voted.extend(account.votes);
        }
    }
    collect_garbage(&mut cache, voted)?;

    let state_transactions: Vec<&Transaction> = transactions
        .iter()
        .filter(|tx| tx.transaction_type() == TransactionType::State)
        .collect();
    if !state_transactions.is_empty() {
        let changes = get_descriptor_changes(&cache, &state_transactions, &settings.governing_token)?;
        apply_descriptor_changes(&mut cache, &changes)?;
    }

    elect(&cache, settings)
}

fn process_output<S: ReadStorage>(
    cache: &mut Overlay<'_, S>,
    settings: &Settings,
    output: &Output,
    value: Fixed8,
) -> Result<()> {
    let account = cache
        .try_get::<Account>(&output.address)?
        .unwrap_or_else(|| Account::new(output.address));
    let mut balances = account.balances.clone();
    *balances.entry(output.asset).or_default() += value;
    let account = cache.update(&account, AccountUpdate { balances: Some(balances), votes: None });

    if output.asset == settings.governing_token {
        apply_vote_delta(cache, &account.votes, value)?;
    }
    Ok(())
}

/// Election over the current validator and validators-count state of `view`
pub fn elect<R: ReadStorage>(view: &R, settings: &Settings) -> Result<Vec<ValidatorKey>> {
    let count = view.try_get::<ValidatorsCount>(&())?.unwrap_or_default();
    let slots: Vec<(i64, Fixed8)> = count
        .votes
        .iter()
        .enumerate()
        .filter(|(_, votes)| **votes > 0)
        .map(|(index, votes)| (index as i64, *votes))
        .collect();
    let filtered = weighted_filter(
        &slots,
        VALIDATOR_COUNT_TRIM_START,
        VALIDATOR_COUNT_TRIM_END,
        |(index, _)| *index,
    );
    let averaged: Vec<(i64, i64)> =
        filtered.into_iter().map(|((index, _), weight)| (index, weight)).collect();
    let num_validators = (weighted_average(&averaged).max(0) as usize).max(settings.standby_validators.len());

    let mut candidates: Vec<Validator> = view
        .scan::<Validator>(&())?
        .into_iter()
        .filter(|validator| {
            (validator.registered && validator.votes > 0)
                || settings.standby_validators.contains(&validator.public_key)
        })
        .collect();
    candidates.sort_by(|a, b| b.votes.cmp(&a.votes).then_with(|| a.public_key.cmp(&b.public_key)));

    let mut elected: Vec<ValidatorKey> = candidates
        .iter()
        .take(num_validators)
        .map(|validator| validator.public_key)
        .collect();
    for key in &settings.standby_validators {
        if elected.len() >= num_validators {
            break;
        }
        if !elected.contains(key) {
            elected.push(*key);
        }
    }
    elected.sort();

    debug!(count = elected.len(), "elected validators");
    Ok(elected)
}
