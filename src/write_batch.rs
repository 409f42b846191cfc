//! Block application overlay
//!
//! A `WriteBatch` stages every effect of one block in memory: the block and
//! header, transactions and their coins, account balances and coin indices,
//! assets, contracts, validators, invocation results and actions. Nothing
//! reaches storage until the orchestrator commits `change_set()`.
//!
//! Invocations run against a temporary batch stacked on this one. Its changes
//! are hoisted only when the script halts, so a faulting invocation leaves
//! no trace besides its `InvocationData` and the actions it emitted.

use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::cache::Overlay;
use crate::constants::ASSET_EXPIRATION_BLOCKS;
use crate::economic::{block_system_fee, transaction_results};
use crate::entity::{ChangeSet, Entity, Scannable, Updatable};
use crate::error::{LedgerError, Result};
use crate::settings::Settings;
use crate::state::*;
use crate::storage::ReadStorage;
use crate::types::*;
use crate::validators::{apply_descriptor_changes, apply_vote_delta, collect_garbage, get_descriptor_changes, DescriptorChanges};
use crate::vm::*;

pub struct WriteBatch<'a, S> {
    settings: &'a Settings,
    vm: &'a dyn Vm,
    current_block_index: Option<u32>,
    overlay: Overlay<'a, S>,
}

/// Coin movements of one transaction for one address
#[derive(Default)]
struct AccountDelta {
    values: BTreeMap<Hash256, Fixed8>,
    spent: Vec<Coin>,
    created: Vec<Input>,
    claimed: Vec<Input>,
}

impl<'a, S: ReadStorage> WriteBatch<'a, S> {
    pub fn new(settings: &'a Settings, storage: &'a S, vm: &'a dyn Vm, current_block_index: Option<u32>) -> Self {
        WriteBatch { settings, vm, current_block_index, overlay: Overlay::new(storage) }
    }

    pub fn overlay(&self) -> &Overlay<'a, S> {
        &self.overlay
    }

    pub fn change_set(&self) -> ChangeSet {
        self.overlay.change_set()
    }

    pub fn into_change_set(self) -> ChangeSet {
        self.overlay.into_change_set()
    }

    /// PersistBlock: stage all effects of `block`
    ///
    /// 1. Stage block, header, every transaction with its coins and
    ///    transaction data (global index = previous last + position + 1)
    /// 2. Claim, contract and miner transactions that pay no contract only
    ///    move coins: update accounts and spent/claimed markers
    /// 3. Every other transaction is applied in block order through
    ///    `persist_transaction`, which numbers actions consecutively
    /// 4. Stage the block data with the new running totals
    pub fn persist_block(&mut self, block: &Block) -> Result<()> {
        let block_hash = block.hash();
        let index = block.index();
        debug!(index, transactions = block.transactions.len(), "applying block");

        let previous = if index == 0 {
            BlockData {
                hash: [0u8; 32],
                last_global_transaction_index: -1,
                last_global_action_index: -1,
                system_fee: 0,
            }
        } else {
            self.get::<BlockData>(&block.previous_hash())?
        };

        self.overlay.add(block.clone(), false)?;
        self.overlay.add(block.header.clone(), false)?;

        if index > 0 {
            let vm = self.vm;
            vm.on_persist(block, self).map_err(|e| LedgerError::Vm(e.to_string()))?;
        }

        for (position, tx) in block.transactions.iter().enumerate() {
            self.add_transaction(tx, block_hash, index, position as u32, previous.last_global_transaction_index)?;
        }

        let mut sequential = Vec::new();
        for (position, tx) in block.transactions.iter().enumerate() {
            if self.is_utxo_only(tx)? {
                self.update_accounts(tx, &BTreeMap::new())?;
                self.update_coins(tx, index)?;
            } else {
                sequential.push((position as u32, tx));
            }
        }

        let mut global_action_index = previous.last_global_action_index + 1;
        for (position, tx) in sequential {
            global_action_index = self.persist_transaction(block, block_hash, tx, position, global_action_index)?;
        }

        self.overlay.add(
            BlockData {
                hash: block_hash,
                last_global_transaction_index: previous.last_global_transaction_index
                    + block.transactions.len() as i64,
                last_global_action_index: global_action_index - 1,
                system_fee: previous.system_fee + block_system_fee(self.settings, block),
            },
            false,
        )
    }

    fn add_transaction(
        &mut self,
        tx: &Transaction,
        block_hash: Hash256,
        block_index: u32,
        position: u32,
        last_global_index: i64,
    ) -> Result<()> {
        let hash = tx.hash();
        self.overlay.add(tx.clone(), true)?;
        for (index, output) in tx.outputs.iter().enumerate() {
            self.overlay.add(
                Coin { input: Input { hash, index: index as u32 }, output: output.clone() },
                true,
            )?;
        }
        self.overlay.add(
            TransactionData {
                hash,
                block_hash,
                start_height: block_index,
                index: position,
                global_index: last_global_index + i64::from(position) + 1,
                end_heights: BTreeMap::new(),
                claimed: Default::default(),
            },
            true,
        )
    }

    fn is_utxo_only(&self, tx: &Transaction) -> Result<bool> {
        if !matches!(
            tx.transaction_type(),
            TransactionType::Claim | TransactionType::Contract | TransactionType::Miner
        ) {
            return Ok(false);
        }
        for output in &tx.outputs {
            if self.try_get::<Contract>(&output.address)?.is_some() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Apply one transaction; returns the next free global action index
    fn persist_transaction(
        &mut self,
        block: &Block,
        block_hash: Hash256,
        tx: &Transaction,
        position: u32,
        global_action_index: i64,
    ) -> Result<i64> {
        let hash = tx.hash();
        trace!(tx = %short_hex(&hash), kind = ?tx.transaction_type(), "applying transaction");

        let changes = if tx.transaction_type() == TransactionType::State {
            get_descriptor_changes(&*self, &[tx], &self.settings.governing_token)?
        } else {
            DescriptorChanges::default()
        };
        apply_descriptor_changes(&mut self.overlay, &changes)?;
        self.update_accounts(tx, &changes.accounts)?;
        self.update_coins(tx, block.index())?;

        match &tx.kind {
            TransactionKind::Register { asset } => {
                self.overlay.add(
                    Asset {
                        hash,
                        asset_type: asset.asset_type,
                        name: asset.name.clone(),
                        amount: asset.amount,
                        available: 0,
                        precision: asset.precision,
                        owner: asset.owner,
                        admin: asset.admin,
                        issuer: asset.admin,
                        expiration: block.index() + ASSET_EXPIRATION_BLOCKS,
                        is_frozen: false,
                    },
                    false,
                )?;
            }
            TransactionKind::Issue => {
                for (asset_hash, value) in transaction_results(&*self, tx)? {
                    let asset = self.get::<Asset>(&asset_hash)?;
                    let available = asset.available - value;
                    self.overlay.update(&asset, AssetUpdate { available: Some(available), is_frozen: None });
                }
            }
            TransactionKind::Enrollment { public_key } => match self.try_get::<Validator>(public_key)? {
                Some(existing) => {
                    self.overlay.update(&existing, ValidatorUpdate { registered: Some(true), votes: None });
                }
                None => {
                    self.overlay.add(Validator { public_key: *public_key, registered: true, votes: 0 }, false)?;
                }
            },
            TransactionKind::Publish { contract } => {
                if self.try_get::<Contract>(&contract.hash())?.is_none() {
                    self.overlay.add(contract.clone(), false)?;
                }
            }
            TransactionKind::Invocation { script, gas } => {
                let context = ActionContext {
                    block_index: block.index(),
                    block_hash,
                    transaction_index: position,
                    transaction_hash: hash,
                };
                return self.persist_invocation(tx, script, *gas, context, global_action_index);
            }
            _ => {}
        }

        Ok(global_action_index)
    }

    fn persist_invocation(
        &mut self,
        tx: &Transaction,
        script: &ByteString,
        gas: Fixed8,
        context: ActionContext,
        global_action_index: i64,
    ) -> Result<i64> {
        let action_index_start = global_action_index.max(0) as u64;
        let mut recorder = ActionRecorder::new(context, action_index_start);
        let settings = self.settings;
        let vm = self.vm;
        let current_block_index = self.current_block_index;

        let (result, staged) = {
            let mut temporary = WriteBatch::new(settings, &*self, vm, current_block_index);
            let request = ExecuteScriptsRequest {
                scripts: vec![Script { code: script.clone(), push_only: false }],
                trigger: TriggerType::Application,
                container: ScriptContainer::Transaction(tx),
                gas,
                skip_witness_verify: false,
                action_context: Some(context),
            };
            let result = vm
                .execute_scripts(request, &mut temporary, &mut recorder)
                .unwrap_or_else(|e| ExecutionResult {
                    state: VmState::Fault,
                    gas_consumed: 0,
                    stack: Vec::new(),
                    error_message: Some(e.to_string()),
                });
            let staged = if result.state == VmState::Halt { Some(StagedInvocation::collect(temporary)) } else { None };
            (result, staged)
        };

        let action_index_stop = recorder.next_index();
        let mut data = InvocationData {
            hash: context.transaction_hash,
            asset_hash: None,
            contract_hashes: Vec::new(),
            deleted_contract_hashes: Vec::new(),
            migrated_contract_hashes: Vec::new(),
            vote_updates: Vec::new(),
            storage_changes: Vec::new(),
            block_index: context.block_index,
            transaction_index: context.transaction_index,
            action_index_start,
            action_index_stop,
            result: result.into_invocation_result(),
        };

        match staged {
            Some(staged) => {
                self.overlay.apply_change_set(staged.changes);
                data.asset_hash = staged.asset_hash;
                data.contract_hashes = staged.contract_hashes;
                data.deleted_contract_hashes = staged.deleted_contract_hashes;
                data.storage_changes = staged.storage_changes;
                data.migrated_contract_hashes = recorder.migrated_contract_hashes;
                data.vote_updates = recorder.vote_updates;
            }
            None => debug!(tx = %short_hex(&context.transaction_hash), "invocation faulted"),
        }

        for action in recorder.actions {
            self.overlay.add(action, false)?;
        }
        self.overlay.add(data, false)?;

        Ok(action_index_stop as i64)
    }

    /// Run `script` against this batch without witness checks
    ///
    /// Used for read-only invocations: the batch is dropped afterwards, so
    /// nothing the script stages is ever committed.
    pub fn invoke(
        &mut self,
        script: ByteString,
        container: ScriptContainer<'_>,
        gas: Fixed8,
        context: ActionContext,
    ) -> Result<InvocationReceipt> {
        let vm = self.vm;
        let mut recorder = ActionRecorder::new(context, 0);
        let request = ExecuteScriptsRequest {
            scripts: vec![Script { code: script, push_only: false }],
            trigger: TriggerType::Application,
            container,
            gas,
            skip_witness_verify: true,
            action_context: Some(context),
        };
        let result = vm
            .execute_scripts(request, self, &mut recorder)
            .map_err(|e| LedgerError::Vm(e.to_string()))?;
        Ok(InvocationReceipt { result: result.into_invocation_result(), actions: recorder.actions })
    }

    fn update_accounts(&mut self, tx: &Transaction, vote_changes: &BTreeMap<Hash160, Vec<ValidatorKey>>) -> Result<()> {
        let hash = tx.hash();
        let mut deltas: BTreeMap<Hash160, AccountDelta> = BTreeMap::new();

        for input in &tx.inputs {
            let coin = self.get::<Coin>(input)?;
            let delta = deltas.entry(coin.output.address).or_default();
            *delta.values.entry(coin.output.asset).or_default() -= coin.output.value;
            delta.spent.push(coin);
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            let delta = deltas.entry(output.address).or_default();
            *delta.values.entry(output.asset).or_default() += output.value;
            delta.created.push(Input { hash, index: index as u32 });
        }
        for claim in tx.claims() {
            let coin = self.get::<Coin>(claim)?;
            deltas.entry(coin.output.address).or_default().claimed.push(*claim);
        }
        for address in vote_changes.keys() {
            deltas.entry(*address).or_default();
        }

        for (address, delta) in deltas {
            self.update_account(address, delta, vote_changes.get(&address))?;
        }
        Ok(())
    }

    fn update_account(&mut self, address: Hash160, delta: AccountDelta, new_votes: Option<&Vec<ValidatorKey>>) -> Result<()> {
        let governing = self.settings.governing_token;
        let existing = self.try_get::<Account>(&address)?;
        let account = existing.clone().unwrap_or_else(|| Account::new(address));

        let mut balances = account.balances.clone();
        for (asset, value) in &delta.values {
            *balances.entry(*asset).or_default() += value;
        }
        let votes = new_votes.cloned().unwrap_or_else(|| account.votes.clone());

        let governing_delta = delta.values.get(&governing).copied().unwrap_or(0);
        apply_vote_delta(&mut self.overlay, &votes, governing_delta)?;
        collect_garbage(&mut self.overlay, votes.iter().copied())?;

        for coin in &delta.spent {
            self.overlay.delete::<AccountUnspent>(&(address, coin.input));
            if coin.output.asset == governing {
                self.overlay.add(AccountUnclaimed { address, input: coin.input }, true)?;
            }
        }
        for input in &delta.created {
            self.overlay.add(AccountUnspent { address, input: *input }, true)?;
        }
        for input in &delta.claimed {
            self.overlay.delete::<AccountUnclaimed>(&(address, *input));
        }

        let update = AccountUpdate { balances: Some(balances), votes: Some(votes) };
        match existing {
            None => {
                let created = account.update(update);
                if !created.is_deletable() {
                    self.overlay.add(created, false)?;
                }
            }
            Some(existing) => {
                let updated = self.overlay.update(&existing, update);
                if updated.is_deletable() {
                    self.overlay.delete::<Account>(&address);
                }
            }
        }
        Ok(())
    }

    fn update_coins(&mut self, tx: &Transaction, block_index: u32) -> Result<()> {
        let mut spent: BTreeMap<Hash256, TransactionDataUpdate> = BTreeMap::new();
        for input in &tx.inputs {
            spent.entry(input.hash).or_default().end_heights.insert(input.index, block_index);
        }
        for claim in tx.claims() {
            spent.entry(claim.hash).or_default().claimed.insert(claim.index);
        }
        for (hash, update) in spent {
            let data = self.get::<TransactionData>(&hash)?;
            self.overlay.update(&data, update);
        }
        Ok(())
    }
}

/// Outcome of a read-only invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReceipt {
    pub result: InvocationResult,
    pub actions: Vec<Action>,
}

/// Changes of a halted invocation, captured before its overlay is dropped
struct StagedInvocation {
    changes: ChangeSet,
    asset_hash: Option<Hash256>,
    contract_hashes: Vec<Hash160>,
    deleted_contract_hashes: Vec<Hash160>,
    storage_changes: Vec<StorageChange>,
}

impl StagedInvocation {
    fn collect<S: ReadStorage>(batch: WriteBatch<'_, S>) -> Self {
        let overlay = batch.overlay();
        let asset_hash = overlay.cache::<Asset>().added().next().map(|asset| asset.hash);
        let contract_hashes = overlay.cache::<Contract>().added().map(Contract::hash).collect();
        let deleted_contract_hashes = overlay.cache::<Contract>().deleted().copied().collect();

        let storage = overlay.cache::<StorageItem>();
        let mut storage_changes: Vec<StorageChange> = storage
            .added()
            .map(|item| StorageChange { hash: item.hash, key: item.key.clone(), value: Some(item.value.clone()) })
            .collect();
        storage_changes.extend(
            storage
                .deleted()
                .map(|(hash, key)| StorageChange { hash: *hash, key: key.clone(), value: None }),
        );

        StagedInvocation {
            changes: batch.into_change_set(),
            asset_hash,
            contract_hashes,
            deleted_contract_hashes,
            storage_changes,
        }
    }
}

impl<S: ReadStorage> ReadStorage for WriteBatch<'_, S> {
    fn try_get<E: Entity>(&self, key: &E::Key) -> Result<Option<E>> {
        self.overlay.try_get::<E>(key)
    }

    fn scan<E: Scannable>(&self, partial: &E::PartialKey) -> Result<Vec<E>> {
        self.overlay.scan::<E>(partial)
    }
}

impl<S: ReadStorage> ChainAccess for WriteBatch<'_, S> {
    fn current_block_index(&self) -> Option<u32> {
        self.current_block_index
    }

    fn try_get_account(&self, hash: &Hash160) -> Result<Option<Account>> {
        self.try_get::<Account>(hash)
    }

    fn try_get_asset(&self, hash: &Hash256) -> Result<Option<Asset>> {
        self.try_get::<Asset>(hash)
    }

    fn add_asset(&mut self, asset: Asset) -> Result<()> {
        self.overlay.add(asset, false)
    }

    fn try_get_contract(&self, hash: &Hash160) -> Result<Option<Contract>> {
        self.try_get::<Contract>(hash)
    }

    fn add_contract(&mut self, contract: Contract) -> Result<()> {
        self.overlay.add(contract, false)
    }

    fn delete_contract(&mut self, hash: &Hash160) -> Result<()> {
        self.overlay.delete::<Contract>(hash);
        Ok(())
    }

    fn try_get_storage_item(&self, hash: &Hash160, key: &[u8]) -> Result<Option<StorageItem>> {
        self.try_get::<StorageItem>(&(*hash, key.to_vec()))
    }

    fn put_storage_item(&mut self, item: StorageItem) -> Result<()> {
        self.overlay.add(item, true)
    }

    fn delete_storage_item(&mut self, hash: &Hash160, key: &[u8]) -> Result<()> {
        self.overlay.delete::<StorageItem>(&(*hash, key.to_vec()));
        Ok(())
    }

    fn find_storage_items(&self, hash: &Hash160, prefix: &[u8]) -> Result<Vec<StorageItem>> {
        self.scan::<StorageItem>(&StorageItemsKey { hash: Some(*hash), prefix: Some(prefix.to_vec()) })
    }

    fn try_get_validator(&self, key: &ValidatorKey) -> Result<Option<Validator>> {
        self.try_get::<Validator>(key)
    }

    fn try_get_transaction(&self, hash: &Hash256) -> Result<Option<Transaction>> {
        self.try_get::<Transaction>(hash)
    }

    fn try_get_header(&self, hash: &Hash256) -> Result<Option<Header>> {
        self.try_get::<Header>(hash)
    }

    fn try_get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        self.try_get::<Block>(hash)
    }

    fn try_get_coin(&self, input: &Input) -> Result<Option<Coin>> {
        self.try_get::<Coin>(input)
    }
}
