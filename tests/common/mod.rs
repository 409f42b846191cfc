//! Shared fixtures for integration tests
#![allow(dead_code)]

use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ledger_persist::constants::{FIXED8_ONE, OP_PUSH0};
use ledger_persist::entity::{ChangeSet, Entity, Scannable};
use ledger_persist::script::{consensus_address, consensus_redeem_script, hash160};
use ledger_persist::state::{Contract, StorageItem};
use ledger_persist::validators::encode_votes;
use ledger_persist::vm::*;
use ledger_persist::*;

/// Invocation script the mock VM accepts
pub const SIGNED: [u8; 2] = [0x01, 0x01];

/// Invocation script the mock VM rejects
pub const UNSIGNED: [u8; 1] = [OP_PUSH0];

pub fn key(n: u8) -> ValidatorKey {
    let secp = secp256k1::Secp256k1::new();
    let secret = secp256k1::SecretKey::from_slice(&[n; 32]).unwrap();
    ValidatorKey::from(secp256k1::PublicKey::from_secret_key(&secp, &secret))
}

/// One standby validator holding the whole governing supply from genesis
pub fn settings() -> Settings {
    Settings::from_config(SettingsConfig {
        standby_validators: vec![key(1)],
        issue_governing_token: true,
        ..SettingsConfig::default()
    })
    .unwrap()
}

/// Consensus address of the standby validators, owner of the genesis issue
pub fn consensus(settings: &Settings) -> Hash160 {
    consensus_address(&settings.standby_validators)
}

pub fn consensus_witness(settings: &Settings) -> Witness {
    Witness { invocation: SIGNED.to_vec(), verification: consensus_redeem_script(&settings.standby_validators) }
}

/// Coin created by the genesis governing token issue
pub fn genesis_issue_input(settings: &Settings) -> Input {
    Input { hash: settings.genesis_block.transactions[3].hash(), index: 0 }
}

pub fn governing(settings: &Settings, value: i64, address: Hash160) -> Output {
    Output { asset: settings.governing_token, value: value * FIXED8_ONE, address }
}

/// Contract transaction spending `input`, signed by the consensus address
pub fn transfer(settings: &Settings, input: Input, outputs: Vec<Output>) -> Transaction {
    let mut tx = Transaction::new(TransactionKind::Contract);
    tx.inputs.push(input);
    tx.outputs = outputs;
    tx.scripts.push(consensus_witness(settings));
    tx
}

pub fn invocation(script: &str) -> Transaction {
    Transaction::new(TransactionKind::Invocation { script: script.as_bytes().to_vec(), gas: 0 })
}

/// Validator descriptor switching registration of `key`
pub fn register(key: ValidatorKey, registered: bool) -> StateDescriptor {
    StateDescriptor {
        descriptor_type: StateDescriptorType::Validator,
        key: key.as_bytes().to_vec(),
        field: "Registered".into(),
        value: vec![u8::from(registered)],
    }
}

/// Account descriptor replacing the votes of `address`
pub fn vote(address: Hash160, votes: &[ValidatorKey]) -> StateDescriptor {
    StateDescriptor {
        descriptor_type: StateDescriptorType::Account,
        key: address.to_vec(),
        field: "Votes".into(),
        value: encode_votes(votes),
    }
}

pub fn state(descriptors: Vec<StateDescriptor>) -> Transaction {
    Transaction::new(TransactionKind::State { descriptors })
}

/// Stage `block` without verification and commit it
pub fn apply_block(storage: &MemoryStorage, settings: &Settings, vm: &dyn Vm, block: &Block) -> Result<()> {
    let mut batch = WriteBatch::new(settings, storage, vm, Some(block.index()));
    batch.persist_block(block)?;
    storage.commit(batch.into_change_set())
}

/// Block following `previous`, signed by the standby validators
pub fn next_block(settings: &Settings, previous: &Block, transactions: Vec<Transaction>) -> Block {
    let index = previous.index() + 1;
    let mut all = vec![Transaction::new(TransactionKind::Miner { nonce: index })];
    all.extend(transactions);

    let mut block = Block {
        header: Header {
            version: 0,
            previous_hash: previous.hash(),
            merkle_root: [0; 32],
            timestamp: previous.timestamp() + 15,
            index,
            consensus_data: u64::from(index),
            next_consensus: consensus(settings),
            script: consensus_witness(settings),
        },
        transactions: all,
    };
    block.header.merkle_root = block.compute_merkle_root();
    block
}

/// Script VM for tests
///
/// Verification runs succeed unless the invocation script is `UNSIGNED`.
/// Application scripts are `;`-separated commands:
/// `put:<key>=<value>`, `del:<key>`, `log:<message>`, `notify`,
/// `contract`, `migrate`, `fault`, `error`.
pub struct MockVm {
    pub verification_gas: Fixed8,
    /// Gas budgets handed to verification runs, in call order
    pub budgets: Mutex<Vec<Fixed8>>,
    /// Time the per-block hook spends before returning
    pub persist_delay: Duration,
}

impl MockVm {
    pub fn new() -> Self {
        Self::with_verification_gas(1)
    }

    pub fn with_verification_gas(gas: Fixed8) -> Self {
        MockVm { verification_gas: gas, budgets: Mutex::new(Vec::new()), persist_delay: Duration::ZERO }
    }

    /// VM whose per-block hook blocks the calling thread for `delay`
    pub fn with_persist_delay(delay: Duration) -> Self {
        MockVm { persist_delay: delay, ..Self::new() }
    }
}

pub fn verify_contract() -> Contract {
    Contract {
        script: b"contract".to_vec(),
        parameter_list: Vec::new(),
        return_type: 0,
        needs_storage: true,
        name: "verifier".into(),
        code_version: "1".into(),
        author: "tests".into(),
        email: String::new(),
        description: String::new(),
        entry_points: vec!["verify".into()],
    }
}

fn halt(stack: Vec<StackItem>) -> ExecutionResult {
    ExecutionResult { state: VmState::Halt, gas_consumed: 1, stack, error_message: None }
}

impl Vm for MockVm {
    fn execute_scripts(
        &self,
        request: ExecuteScriptsRequest<'_>,
        chain: &mut dyn ChainAccess,
        listeners: &mut dyn ExecutionListeners,
    ) -> anyhow::Result<ExecutionResult> {
        if request.trigger == TriggerType::Verification {
            self.budgets.lock().push(request.gas);
            let accepted = request.scripts[0].code[..] != UNSIGNED[..];
            return Ok(ExecutionResult {
                state: VmState::Halt,
                gas_consumed: self.verification_gas,
                stack: vec![StackItem::Boolean(accepted)],
                error_message: None,
            });
        }

        let code = &request.scripts[0].code;
        let script_hash = hash160(code);
        let text = String::from_utf8_lossy(code).to_string();
        for command in text.split(';') {
            let (name, argument) = command.split_once(':').unwrap_or((command, ""));
            match name {
                "put" => {
                    let (key, value) = argument.split_once('=').unwrap_or((argument, ""));
                    chain.put_storage_item(StorageItem {
                        hash: script_hash,
                        key: key.as_bytes().to_vec(),
                        value: value.as_bytes().to_vec(),
                    })?;
                }
                "del" => chain.delete_storage_item(&script_hash, argument.as_bytes())?,
                "log" => listeners.on_log(script_hash, argument.to_string()),
                "notify" => listeners.on_notify(script_hash, vec![StackItem::Integer(1)]),
                "contract" => chain.add_contract(verify_contract())?,
                "migrate" => listeners.on_migrate_contract(script_hash, hash160(b"migrated")),
                "fault" => {
                    return Ok(ExecutionResult {
                        state: VmState::Fault,
                        gas_consumed: 1,
                        stack: Vec::new(),
                        error_message: Some("scripted fault".into()),
                    })
                }
                "error" => return Err(anyhow!("vm crashed")),
                _ => {}
            }
        }
        Ok(halt(vec![StackItem::Integer(1)]))
    }

    fn on_persist(&self, _block: &Block, _chain: &mut dyn ChainAccess) -> anyhow::Result<()> {
        std::thread::sleep(self.persist_delay);
        Ok(())
    }
}

/// Memory storage whose commits can be made to fail
#[derive(Default)]
pub struct FlakyStorage {
    pub inner: MemoryStorage,
    pub fail_commits: AtomicBool,
}

impl FlakyStorage {
    pub fn set_failing(&self, failing: bool) {
        self.fail_commits.store(failing, Ordering::SeqCst);
    }
}

impl ReadStorage for FlakyStorage {
    fn try_get<E: Entity>(&self, key: &E::Key) -> Result<Option<E>> {
        self.inner.try_get::<E>(key)
    }

    fn scan<E: Scannable>(&self, partial: &E::PartialKey) -> Result<Vec<E>> {
        self.inner.scan::<E>(partial)
    }
}

impl Storage for FlakyStorage {
    fn try_get_latest_block(&self) -> Result<Option<Block>> {
        self.inner.try_get_latest_block()
    }

    fn try_get_latest_header(&self) -> Result<Option<Header>> {
        self.inner.try_get_latest_header()
    }

    fn commit(&self, changes: ChangeSet) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("injected commit failure".into()));
        }
        self.inner.commit(changes)
    }

    fn reset(&self) -> Result<()> {
        self.inner.reset()
    }
}
