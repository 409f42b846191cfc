//! Ledger state records persisted alongside blocks

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::entity::{Deletable, Scannable, Updatable};
use crate::script::hash160;
use crate::types::*;
use crate::vm::StackItem;

/// Account: balances per asset and the validators it votes for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub hash: Hash160,
    pub is_frozen: bool,
    pub votes: Vec<ValidatorKey>,
    pub balances: BTreeMap<Hash256, Fixed8>,
}

impl Account {
    pub fn new(hash: Hash160) -> Self {
        Account { hash, is_frozen: false, votes: Vec::new(), balances: BTreeMap::new() }
    }

    pub fn balance(&self, asset: &Hash256) -> Fixed8 {
        self.balances.get(asset).copied().unwrap_or(0)
    }

    /// An account with no balance and no votes carries no state
    pub fn is_deletable(&self) -> bool {
        !self.is_frozen && self.votes.is_empty() && self.balances.values().all(|value| *value == 0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub balances: Option<BTreeMap<Hash256, Fixed8>>,
    pub votes: Option<Vec<ValidatorKey>>,
}

impl Updatable for Account {
    type Update = AccountUpdate;

    fn update(&self, update: AccountUpdate) -> Self {
        let mut next = self.clone();
        if let Some(balances) = update.balances {
            next.balances = balances.into_iter().filter(|(_, value)| *value != 0).collect();
        }
        if let Some(votes) = update.votes {
            next.votes = votes;
        }
        next
    }
}

impl Deletable for Account {}

impl Scannable for Account {
    type PartialKey = ();

    fn matches(&self, _: &()) -> bool {
        true
    }
}

/// Unspent coin owned by an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUnspent {
    pub address: Hash160,
    pub input: Input,
}

impl Deletable for AccountUnspent {}

impl Scannable for AccountUnspent {
    type PartialKey = Hash160;

    fn matches(&self, address: &Hash160) -> bool {
        self.address == *address
    }
}

/// Spent governing-token coin whose generation has not been claimed yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUnclaimed {
    pub address: Hash160,
    pub input: Input,
}

impl Deletable for AccountUnclaimed {}

impl Scannable for AccountUnclaimed {
    type PartialKey = Hash160;

    fn matches(&self, address: &Hash160) -> bool {
        self.address == *address
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub public_key: ValidatorKey,
    pub registered: bool,
    pub votes: Fixed8,
}

impl Validator {
    pub fn new(public_key: ValidatorKey) -> Self {
        Validator { public_key, registered: false, votes: 0 }
    }

    /// Unregistered validators without votes are garbage collected
    pub fn is_deletable(&self) -> bool {
        !self.registered && self.votes == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidatorUpdate {
    pub registered: Option<bool>,
    pub votes: Option<Fixed8>,
}

impl Updatable for Validator {
    type Update = ValidatorUpdate;

    fn update(&self, update: ValidatorUpdate) -> Self {
        Validator {
            public_key: self.public_key,
            registered: update.registered.unwrap_or(self.registered),
            votes: update.votes.unwrap_or(self.votes),
        }
    }
}

impl Deletable for Validator {}

impl Scannable for Validator {
    type PartialKey = ();

    fn matches(&self, _: &()) -> bool {
        true
    }
}

/// Vote weight per preferred validator count
///
/// Slot `i` holds the governing tokens of accounts voting for `i + 1` validators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorsCount {
    pub votes: Vec<Fixed8>,
}

impl ValidatorsCount {
    /// Add `delta` to slot `index`, growing the slot list as needed
    pub fn add(&mut self, index: usize, delta: Fixed8) {
        if self.votes.len() <= index {
            self.votes.resize(index + 1, 0);
        }
        self.votes[index] += delta;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidatorsCountUpdate {
    pub votes: Vec<Fixed8>,
}

impl Updatable for ValidatorsCount {
    type Update = ValidatorsCountUpdate;

    fn update(&self, update: ValidatorsCountUpdate) -> Self {
        ValidatorsCount { votes: update.votes }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub hash: Hash256,
    pub asset_type: AssetType,
    pub name: String,
    pub amount: Fixed8,
    pub available: Fixed8,
    pub precision: u8,
    pub owner: Option<ValidatorKey>,
    pub admin: Hash160,
    pub issuer: Hash160,
    pub expiration: u32,
    pub is_frozen: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AssetUpdate {
    pub available: Option<Fixed8>,
    pub is_frozen: Option<bool>,
}

impl Updatable for Asset {
    type Update = AssetUpdate;

    fn update(&self, update: AssetUpdate) -> Self {
        let mut next = self.clone();
        if let Some(available) = update.available {
            next.available = available;
        }
        if let Some(is_frozen) = update.is_frozen {
            next.is_frozen = is_frozen;
        }
        next
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub script: ByteString,
    pub parameter_list: ByteString,
    pub return_type: u8,
    pub needs_storage: bool,
    pub name: String,
    pub code_version: String,
    pub author: String,
    pub email: String,
    pub description: String,
    pub entry_points: Vec<String>,
}

impl Contract {
    pub fn hash(&self) -> Hash160 {
        hash160(&self.script)
    }

    pub fn has_entry_point(&self, name: &str) -> bool {
        self.entry_points.iter().any(|entry| entry == name)
    }
}

impl Deletable for Contract {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageItem {
    pub hash: Hash160,
    pub key: ByteString,
    pub value: ByteString,
}

#[derive(Debug, Clone, Default)]
pub struct StorageItemUpdate {
    pub value: ByteString,
}

impl Updatable for StorageItem {
    type Update = StorageItemUpdate;

    fn update(&self, update: StorageItemUpdate) -> Self {
        StorageItem { hash: self.hash, key: self.key.clone(), value: update.value }
    }
}

impl Deletable for StorageItem {}

/// Filter for storage item scans: contract hash and key prefix, both optional
#[derive(Debug, Clone, Default)]
pub struct StorageItemsKey {
    pub hash: Option<Hash160>,
    pub prefix: Option<ByteString>,
}

impl Scannable for StorageItem {
    type PartialKey = StorageItemsKey;

    fn matches(&self, partial: &StorageItemsKey) -> bool {
        partial.hash.map_or(true, |hash| hash == self.hash)
            && partial.prefix.as_ref().map_or(true, |prefix| self.key.starts_with(prefix))
    }
}

/// Where a transaction landed and which of its coins were spent or claimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    pub hash: Hash256,
    pub block_hash: Hash256,
    pub start_height: u32,
    pub index: u32,
    pub global_index: i64,
    /// Output index -> height of the block that spent it
    pub end_heights: BTreeMap<u32, u32>,
    pub claimed: BTreeSet<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionDataUpdate {
    pub end_heights: BTreeMap<u32, u32>,
    pub claimed: BTreeSet<u32>,
}

impl Updatable for TransactionData {
    type Update = TransactionDataUpdate;

    fn update(&self, update: TransactionDataUpdate) -> Self {
        let mut next = self.clone();
        next.end_heights.extend(update.end_heights);
        next.claimed.extend(update.claimed);
        next
    }
}

/// A coin: output `input.index` of transaction `input.hash`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub input: Input,
    pub output: Output,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Log { message: String },
    Notification { args: Vec<StackItem> },
}

/// Log or notification emitted by a contract during an invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub index: u64,
    pub block_index: u32,
    pub block_hash: Hash256,
    pub transaction_index: u32,
    pub transaction_hash: Hash256,
    pub script_hash: Hash160,
    pub kind: ActionKind,
}

/// Half-open range `[index_start, index_stop)` of global action indices
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionsKey {
    pub index_start: Option<u64>,
    pub index_stop: Option<u64>,
}

impl Scannable for Action {
    type PartialKey = ActionsKey;

    fn matches(&self, range: &ActionsKey) -> bool {
        range.index_start.map_or(true, |start| self.index >= start)
            && range.index_stop.map_or(true, |stop| self.index < stop)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationResult {
    Success { gas_consumed: Fixed8, stack: Vec<StackItem> },
    Failure { gas_consumed: Fixed8, stack: Vec<StackItem>, message: String },
}

impl InvocationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResult::Success { .. })
    }

    pub fn gas_consumed(&self) -> Fixed8 {
        match self {
            InvocationResult::Success { gas_consumed, .. }
            | InvocationResult::Failure { gas_consumed, .. } => *gas_consumed,
        }
    }
}

/// Storage item written (`Some`) or removed (`None`) by an invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageChange {
    pub hash: Hash160,
    pub key: ByteString,
    pub value: Option<ByteString>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationData {
    pub hash: Hash256,
    pub asset_hash: Option<Hash256>,
    pub contract_hashes: Vec<Hash160>,
    pub deleted_contract_hashes: Vec<Hash160>,
    pub migrated_contract_hashes: Vec<(Hash160, Hash160)>,
    pub vote_updates: Vec<(Hash160, Vec<ValidatorKey>)>,
    pub storage_changes: Vec<StorageChange>,
    pub block_index: u32,
    pub transaction_index: u32,
    pub action_index_start: u64,
    pub action_index_stop: u64,
    pub result: InvocationResult,
}

/// Per-block running totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub hash: Hash256,
    pub last_global_transaction_index: i64,
    pub last_global_action_index: i64,
    /// Accumulated system fee up to and including this block
    pub system_fee: Fixed8,
}

/// One persisted batch of consecutive header hashes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderHashList {
    pub batch: u32,
    pub hashes: Vec<Hash256>,
}

/// Number of header hashes persisted in full batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderHashCount {
    pub count: u32,
}
