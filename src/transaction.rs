//! Transaction verification
//!
//! `check_transaction` holds the context-free rules; `verify_transaction`
//! adds everything that reads chain state and finally runs the witnesses.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::economic::{calculate_claim_amount, is_spent, system_fee, transaction_results};
use crate::error::{LedgerError, Result};
use crate::script::{hash160, signature_redeem_script};
use crate::settings::Settings;
use crate::state::{Asset, Coin};
use crate::storage::ReadStorage;
use crate::types::*;
use crate::vm::{ScriptContainer, Vm};
use crate::witness::{verify_witnesses, WitnessVerification};

/// Chain state a verification routine reads
pub struct VerifyContext<'a, R> {
    pub vm: &'a dyn Vm,
    pub settings: &'a Settings,
    pub view: &'a R,
    /// Index of the latest persisted block
    pub current_height: u32,
    /// Accumulated system fee up to and including a block index
    pub system_fee_at: &'a dyn Fn(u32) -> Result<Fixed8>,
}

fn invalid(message: &str) -> LedgerError {
    LedgerError::Verify(message.to_string())
}

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// 1. Register transactions are no longer accepted
/// 2. No input is referenced twice
/// 3. No claim is referenced twice
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    if tx.transaction_type() == TransactionType::Register {
        return Err(invalid("Register transactions are obsolete"));
    }
    if has_duplicates(&tx.inputs) {
        return Err(invalid("Duplicate inputs"));
    }
    if has_duplicates(tx.claims()) {
        return Err(invalid("Duplicate claims"));
    }
    Ok(())
}

fn has_duplicates(inputs: &[Input]) -> bool {
    let mut seen = HashSet::with_capacity(inputs.len());
    inputs.iter().any(|input| !seen.insert(*input))
}

fn intersects(a: &[Input], b: &[Input]) -> bool {
    let set: HashSet<&Input> = a.iter().collect();
    b.iter().any(|input| set.contains(input))
}

/// No other pending transaction may spend or claim the same coins
pub fn check_mempool(tx: &Transaction, mempool: &[Transaction]) -> Result<()> {
    let hash = tx.hash();
    for other in mempool.iter().filter(|other| other.hash() != hash) {
        if intersects(&other.inputs, &tx.inputs) {
            return Err(invalid("Input already exists in mempool"));
        }
        if intersects(other.claims(), tx.claims()) {
            return Err(invalid("Claim already exists in mempool"));
        }
    }
    Ok(())
}

fn verify_double_spend<R: ReadStorage>(view: &R, tx: &Transaction) -> Result<()> {
    for input in &tx.inputs {
        if is_spent(view, input)? {
            return Err(invalid("Transaction is a double spend"));
        }
    }
    Ok(())
}

/// Every output asset must exist, be unexpired (system tokens never
/// expire) and the value must respect the asset's precision
fn verify_outputs<R: ReadStorage>(view: &R, tx: &Transaction, current_height: u32) -> Result<()> {
    let mut grouped: BTreeMap<Hash256, Vec<&Output>> = BTreeMap::new();
    for output in &tx.outputs {
        grouped.entry(output.asset).or_default().push(output);
    }

    for (asset_hash, outputs) in grouped {
        let asset = view.get::<Asset>(&asset_hash)?;
        let system = matches!(asset.asset_type, AssetType::GoverningToken | AssetType::UtilityToken);
        if !system && asset.expiration <= current_height + 1 {
            return Err(invalid("Transaction has invalid output"));
        }
        let unit = 10i64.pow(8u32.saturating_sub(u32::from(asset.precision)));
        if outputs.iter().any(|output| output.value % unit != 0) {
            return Err(invalid("Transaction has invalid output"));
        }
    }
    Ok(())
}

/// Transaction results
///
/// 1. Only the utility token may be destroyed
/// 2. A positive system fee needs at least that much utility destroyed
/// 3. Miner and claim transactions may only issue the utility token, issue
///    transactions may issue anything but the utility token within the
///    asset's remaining amount, and nothing else may issue at all
fn verify_transaction_results<R: ReadStorage>(view: &R, settings: &Settings, tx: &Transaction) -> Result<()> {
    let results = transaction_results(view, tx)?;
    let destroyed: Vec<(&Hash256, &Fixed8)> = results.iter().filter(|(_, value)| **value > 0).collect();

    if destroyed.len() > 1 || destroyed.first().map_or(false, |(asset, _)| **asset != settings.utility_token) {
        return Err(invalid("Invalid destroyed output."));
    }

    let fee = system_fee(settings, tx);
    if fee > 0 && destroyed.first().map_or(true, |(_, value)| **value < fee) {
        return Err(invalid("Not enough output value for system fee."));
    }

    let issued: Vec<(&Hash256, &Fixed8)> = results.iter().filter(|(_, value)| **value < 0).collect();
    match tx.transaction_type() {
        TransactionType::Miner | TransactionType::Claim => {
            if issued.iter().any(|(asset, _)| **asset != settings.utility_token) {
                return Err(invalid("Invalid miner/claim result"));
            }
        }
        TransactionType::Issue => {
            if issued.iter().any(|(asset, _)| **asset == settings.utility_token) {
                return Err(invalid("Invalid issue result"));
            }
            for (asset_hash, value) in &issued {
                let asset = view.get::<Asset>(asset_hash)?;
                if asset.amount >= 0 && asset.available - **value > asset.amount {
                    return Err(invalid("Issued amount exceeds asset amount"));
                }
            }
        }
        _ => {
            if !issued.is_empty() {
                return Err(invalid("Invalid results."));
            }
        }
    }
    Ok(())
}

/// The utility issued by a claim must equal the claimable amount
fn verify_claim<R: ReadStorage>(ctx: &VerifyContext<'_, R>, tx: &Transaction) -> Result<()> {
    let results = transaction_results(ctx.view, tx)?;
    let issued: Vec<(&Hash256, &Fixed8)> = results.iter().filter(|(_, value)| **value < 0).collect();
    let claimed = match issued.as_slice() {
        [(asset, value)] if **asset == ctx.settings.utility_token => -**value,
        _ => return Err(invalid("Invalid claim results")),
    };

    let amount = calculate_claim_amount(ctx.view, ctx.settings, tx.claims(), ctx.system_fee_at)?;
    if amount != claimed {
        return Err(invalid("Invalid claim value"));
    }
    Ok(())
}

/// Script hashes that must witness `tx`, ascending
///
/// - owners of spent coins
/// - receivers of duty assets
/// - `Script` attributes
/// - claim: owners of claimed coins
/// - issue: issuers of issued assets
/// - enrollment: the enrolled key's signature contract
/// - state: the account of each account descriptor, the signature contract
///   of each validator descriptor
pub fn script_hashes_for_verifying<R: ReadStorage>(view: &R, tx: &Transaction) -> Result<Vec<Hash160>> {
    let mut hashes = BTreeSet::new();

    for input in &tx.inputs {
        hashes.insert(view.get::<Coin>(input)?.output.address);
    }
    for output in &tx.outputs {
        if view.get::<Asset>(&output.asset)?.asset_type.is_duty() {
            hashes.insert(output.address);
        }
    }
    for attribute in &tx.attributes {
        if let Attribute::Script(hash) = attribute {
            hashes.insert(*hash);
        }
    }

    match &tx.kind {
        TransactionKind::Claim { claims } => {
            for claim in claims {
                hashes.insert(view.get::<Coin>(claim)?.output.address);
            }
        }
        TransactionKind::Issue => {
            for (asset_hash, value) in transaction_results(view, tx)? {
                if value < 0 {
                    hashes.insert(view.get::<Asset>(&asset_hash)?.issuer);
                }
            }
        }
        TransactionKind::Enrollment { public_key } => {
            hashes.insert(hash160(&signature_redeem_script(public_key)));
        }
        TransactionKind::State { descriptors } => {
            for descriptor in descriptors {
                match descriptor.descriptor_type {
                    StateDescriptorType::Account => {
                        let hash: Hash160 = descriptor
                            .key
                            .as_slice()
                            .try_into()
                            .map_err(|_| invalid("Invalid account state descriptor key"))?;
                        hashes.insert(hash);
                    }
                    StateDescriptorType::Validator => {
                        let key = ValidatorKey::from_slice(&descriptor.key)?;
                        hashes.insert(hash160(&signature_redeem_script(&key)));
                    }
                }
            }
        }
        _ => {}
    }

    Ok(hashes.into_iter().collect())
}

/// VerifyTransaction: 𝒯𝒳 × 𝒮 → {valid, invalid}
///
/// 1. CheckTransaction
/// 2. No conflict with `mempool`
/// 3. No input already spent
/// 4. Outputs use valid assets
/// 5. Transaction results obey the per-type rules
/// 6. Claims match the claimable amount
/// 7. Every required script hash is witnessed
///
/// Returns the witness report; a rejected witness is reported there rather
/// than raised.
pub fn verify_transaction<R: ReadStorage>(
    ctx: &VerifyContext<'_, R>,
    tx: &Transaction,
    mempool: &[Transaction],
) -> Result<WitnessVerification> {
    // 1-2. Structure and pending conflicts
    check_transaction(tx)?;
    check_mempool(tx, mempool)?;

    // 3-6. State checks
    verify_double_spend(ctx.view, tx)?;
    verify_outputs(ctx.view, tx, ctx.current_height)?;
    verify_transaction_results(ctx.view, ctx.settings, tx)?;
    if tx.transaction_type() == TransactionType::Claim {
        verify_claim(ctx, tx)?;
    }

    // 7. Witnesses
    let hashes = script_hashes_for_verifying(ctx.view, tx)?;
    verify_witnesses(
        ctx.vm,
        ctx.settings,
        ctx.view,
        ScriptContainer::Transaction(tx),
        hashes,
        &tx.scripts,
        ctx.settings.max_verification_gas,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FIXED8_ONE;
    use crate::entity::{Change, Record};
    use crate::memory::MemoryStorage;
    use crate::settings::SettingsConfig;
    use crate::state::TransactionData;
    use crate::storage::Storage;

    fn settings() -> Settings {
        let config = SettingsConfig {
            standby_validators: vec![ValidatorKey::from_hex(
                "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
            )
            .unwrap()],
            ..SettingsConfig::default()
        };
        Settings::from_config(config).unwrap()
    }

    fn asset(hash: Hash256, asset_type: AssetType, precision: u8, expiration: u32) -> Asset {
        Asset {
            hash,
            asset_type,
            name: "asset".into(),
            amount: 1_000 * FIXED8_ONE,
            available: 0,
            precision,
            owner: None,
            admin: [0; 20],
            issuer: [9; 20],
            expiration,
            is_frozen: false,
        }
    }

    fn seeded(settings: &Settings) -> (MemoryStorage, Input) {
        let storage = MemoryStorage::new();
        let input = Input { hash: [1; 32], index: 0 };
        storage
            .commit(vec![
                Change::Add(Record::Asset(asset(settings.utility_token, AssetType::UtilityToken, 8, 0))),
                Change::Add(Record::Asset(asset([5; 32], AssetType::Share, 0, 100))),
                Change::Add(Record::Output(Coin {
                    input,
                    output: Output { asset: settings.utility_token, value: 10 * FIXED8_ONE, address: [3; 20] },
                })),
                Change::Add(Record::TransactionData(TransactionData {
                    hash: input.hash,
                    block_hash: [0; 32],
                    start_height: 0,
                    index: 0,
                    global_index: 0,
                    end_heights: BTreeMap::new(),
                    claimed: BTreeSet::new(),
                })),
            ])
            .unwrap();
        (storage, input)
    }

    #[test]
    fn test_check_transaction_rejects_duplicates() {
        let mut tx = Transaction::new(TransactionKind::Contract);
        let input = Input { hash: [1; 32], index: 0 };
        tx.inputs = vec![input, input];
        assert!(matches!(check_transaction(&tx), Err(LedgerError::Verify(m)) if m == "Duplicate inputs"));

        let claim = Transaction::new(TransactionKind::Claim { claims: vec![input, input] });
        assert!(matches!(check_transaction(&claim), Err(LedgerError::Verify(m)) if m == "Duplicate claims"));
    }

    #[test]
    fn test_mempool_conflict() {
        let input = Input { hash: [1; 32], index: 0 };
        let mut tx = Transaction::new(TransactionKind::Contract);
        tx.inputs.push(input);
        let mut other = Transaction::new(TransactionKind::Contract);
        other.inputs.push(input);
        other.attributes.push(Attribute::Remark(b"other".to_vec()));

        assert!(check_mempool(&tx, &[tx.clone()]).is_ok());
        assert!(check_mempool(&tx, &[other]).is_err());
    }

    #[test]
    fn test_outputs_respect_precision_and_expiration() {
        let settings = settings();
        let (storage, _) = seeded(&settings);

        let mut tx = Transaction::new(TransactionKind::Contract);
        tx.outputs.push(Output { asset: [5; 32], value: FIXED8_ONE / 2, address: [1; 20] });
        assert!(verify_outputs(&storage, &tx, 10).is_err());

        tx.outputs[0].value = FIXED8_ONE;
        assert!(verify_outputs(&storage, &tx, 10).is_ok());
        // expired one block before its expiration height
        assert!(verify_outputs(&storage, &tx, 99).is_err());

        // system tokens never expire
        tx.outputs[0] = Output { asset: settings.utility_token, value: 1, address: [1; 20] };
        assert!(verify_outputs(&storage, &tx, 10_000).is_ok());
    }

    #[test]
    fn test_results_rules() {
        let settings = settings();
        let (storage, input) = seeded(&settings);

        // contract transfer destroying utility is allowed
        let mut tx = Transaction::new(TransactionKind::Contract);
        tx.inputs.push(input);
        tx.outputs.push(Output { asset: settings.utility_token, value: 9 * FIXED8_ONE, address: [1; 20] });
        assert!(verify_transaction_results(&storage, &settings, &tx).is_ok());

        // issuing from a contract transaction is not
        tx.outputs[0].value = 11 * FIXED8_ONE;
        assert!(matches!(
            verify_transaction_results(&storage, &settings, &tx),
            Err(LedgerError::Verify(m)) if m == "Invalid results."
        ));

        // an issue transaction must pay its system fee in utility
        let mut issue = Transaction::new(TransactionKind::Issue);
        issue.inputs.push(input);
        issue.outputs.push(Output { asset: settings.utility_token, value: 10 * FIXED8_ONE, address: [1; 20] });
        assert!(matches!(
            verify_transaction_results(&storage, &settings, &issue),
            Err(LedgerError::Verify(m)) if m == "Not enough output value for system fee."
        ));
    }

    #[test]
    fn test_script_hashes_are_sorted_and_unique() {
        let settings = settings();
        let (storage, input) = seeded(&settings);

        let mut tx = Transaction::new(TransactionKind::Contract);
        tx.inputs.push(input);
        tx.outputs.push(Output { asset: [5; 32], value: FIXED8_ONE, address: [1; 20] });
        tx.attributes.push(Attribute::Script([3; 20]));
        tx.attributes.push(Attribute::Script([2; 20]));

        let hashes = script_hashes_for_verifying(&storage, &tx).unwrap();
        assert_eq!(hashes, vec![[1; 20], [2; 20], [3; 20]]);
    }

    #[test]
    fn test_spent_input_is_double_spend() {
        let settings = settings();
        let (storage, input) = seeded(&settings);
        let mut tx = Transaction::new(TransactionKind::Contract);
        tx.inputs.push(input);
        assert!(verify_double_spend(&storage, &tx).is_ok());

        let data = storage.get::<TransactionData>(&input.hash).unwrap();
        let mut spent = data.clone();
        spent.end_heights.insert(0, 3);
        storage.commit(vec![Change::Add(Record::TransactionData(spent))]).unwrap();
        assert!(verify_double_spend(&storage, &tx).is_err());
    }
}
