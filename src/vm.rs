//! Virtual machine collaborator contract
//!
//! Script execution itself is external. The ledger hands the VM the scripts
//! to run, a gas budget, the item being verified or invoked and a mutable
//! view of chain state; the VM reports the final state, the gas it used and
//! the result stack. Logs, notifications, contract migrations and vote
//! changes raised during execution come back through `ExecutionListeners`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::*;
use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Verification,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Halt,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackItem {
    Boolean(bool),
    Integer(i64),
    ByteArray(ByteString),
    Array(Vec<StackItem>),
    InteropInterface,
}

impl StackItem {
    /// Boolean value of the item, `None` when it has none
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            StackItem::Boolean(value) => Some(*value),
            StackItem::Integer(value) => Some(*value != 0),
            StackItem::ByteArray(bytes) => Some(bytes.iter().any(|b| *b != 0)),
            StackItem::Array(_) | StackItem::InteropInterface => None,
        }
    }
}

/// One script of an execution; `push_only` scripts may only push data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub code: ByteString,
    pub push_only: bool,
}

/// Item whose hash and contents the executing scripts can inspect
#[derive(Debug, Clone, Copy)]
pub enum ScriptContainer<'a> {
    Transaction(&'a Transaction),
    Block(&'a Block),
    Consensus(&'a ConsensusPayload),
}

impl ScriptContainer<'_> {
    pub fn hash(&self) -> Hash256 {
        match self {
            ScriptContainer::Transaction(tx) => tx.hash(),
            ScriptContainer::Block(block) => block.hash(),
            ScriptContainer::Consensus(payload) => payload.hash(),
        }
    }
}

/// Block and transaction an application execution belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionContext {
    pub block_index: u32,
    pub block_hash: Hash256,
    pub transaction_index: u32,
    pub transaction_hash: Hash256,
}

pub struct ExecuteScriptsRequest<'a> {
    pub scripts: Vec<Script>,
    pub trigger: TriggerType,
    pub container: ScriptContainer<'a>,
    pub gas: Fixed8,
    pub skip_witness_verify: bool,
    pub action_context: Option<ActionContext>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub state: VmState,
    pub gas_consumed: Fixed8,
    pub stack: Vec<StackItem>,
    pub error_message: Option<String>,
}

impl ExecutionResult {
    pub fn into_invocation_result(self) -> InvocationResult {
        match self.state {
            VmState::Halt => InvocationResult::Success {
                gas_consumed: self.gas_consumed,
                stack: self.stack,
            },
            VmState::Fault => InvocationResult::Failure {
                gas_consumed: self.gas_consumed,
                stack: self.stack,
                message: self.error_message.unwrap_or_else(|| "VM fault".to_string()),
            },
        }
    }
}

/// Callbacks raised while scripts run
pub trait ExecutionListeners {
    fn on_log(&mut self, script_hash: Hash160, message: String);
    fn on_notify(&mut self, script_hash: Hash160, args: Vec<StackItem>);
    fn on_migrate_contract(&mut self, from: Hash160, to: Hash160);
    fn on_set_votes(&mut self, address: Hash160, votes: Vec<ValidatorKey>);
}

/// Listeners that drop every event
pub struct NullListeners;

impl ExecutionListeners for NullListeners {
    fn on_log(&mut self, _: Hash160, _: String) {}
    fn on_notify(&mut self, _: Hash160, _: Vec<StackItem>) {}
    fn on_migrate_contract(&mut self, _: Hash160, _: Hash160) {}
    fn on_set_votes(&mut self, _: Hash160, _: Vec<ValidatorKey>) {}
}

/// Collects events of one invocation, numbering actions from `next_index`
pub struct ActionRecorder {
    context: ActionContext,
    next_index: u64,
    pub actions: Vec<Action>,
    pub migrated_contract_hashes: Vec<(Hash160, Hash160)>,
    pub vote_updates: Vec<(Hash160, Vec<ValidatorKey>)>,
}

impl ActionRecorder {
    pub fn new(context: ActionContext, next_index: u64) -> Self {
        ActionRecorder {
            context,
            next_index,
            actions: Vec::new(),
            migrated_contract_hashes: Vec::new(),
            vote_updates: Vec::new(),
        }
    }

    /// Index the next action would receive
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    fn push(&mut self, script_hash: Hash160, kind: ActionKind) {
        self.actions.push(Action {
            index: self.next_index,
            block_index: self.context.block_index,
            block_hash: self.context.block_hash,
            transaction_index: self.context.transaction_index,
            transaction_hash: self.context.transaction_hash,
            script_hash,
            kind,
        });
        self.next_index += 1;
    }
}

impl ExecutionListeners for ActionRecorder {
    fn on_log(&mut self, script_hash: Hash160, message: String) {
        self.push(script_hash, ActionKind::Log { message });
    }

    fn on_notify(&mut self, script_hash: Hash160, args: Vec<StackItem>) {
        self.push(script_hash, ActionKind::Notification { args });
    }

    fn on_migrate_contract(&mut self, from: Hash160, to: Hash160) {
        self.migrated_contract_hashes.push((from, to));
    }

    fn on_set_votes(&mut self, address: Hash160, votes: Vec<ValidatorKey>) {
        self.vote_updates.push((address, votes));
    }
}

/// Chain state visible to and mutable by executing scripts
///
/// Mutations land in the overlay the VM was handed and are only persisted
/// when that overlay is hoisted and committed.
pub trait ChainAccess {
    fn current_block_index(&self) -> Option<u32>;
    fn try_get_account(&self, hash: &Hash160) -> Result<Option<Account>>;
    fn try_get_asset(&self, hash: &Hash256) -> Result<Option<Asset>>;
    fn add_asset(&mut self, asset: Asset) -> Result<()>;
    fn try_get_contract(&self, hash: &Hash160) -> Result<Option<Contract>>;
    fn add_contract(&mut self, contract: Contract) -> Result<()>;
    fn delete_contract(&mut self, hash: &Hash160) -> Result<()>;
    fn try_get_storage_item(&self, hash: &Hash160, key: &[u8]) -> Result<Option<StorageItem>>;
    fn put_storage_item(&mut self, item: StorageItem) -> Result<()>;
    fn delete_storage_item(&mut self, hash: &Hash160, key: &[u8]) -> Result<()>;
    fn find_storage_items(&self, hash: &Hash160, prefix: &[u8]) -> Result<Vec<StorageItem>>;
    fn try_get_validator(&self, key: &ValidatorKey) -> Result<Option<Validator>>;
    fn try_get_transaction(&self, hash: &Hash256) -> Result<Option<Transaction>>;
    fn try_get_header(&self, hash: &Hash256) -> Result<Option<Header>>;
    fn try_get_block(&self, hash: &Hash256) -> Result<Option<Block>>;
    fn try_get_coin(&self, input: &Input) -> Result<Option<Coin>>;
}

pub trait Vm: Send + Sync {
    fn execute_scripts(
        &self,
        request: ExecuteScriptsRequest<'_>,
        chain: &mut dyn ChainAccess,
        listeners: &mut dyn ExecutionListeners,
    ) -> anyhow::Result<ExecutionResult>;

    /// Hook run against the block overlay before its transactions are applied
    fn on_persist(&self, _block: &Block, _chain: &mut dyn ChainAccess) -> anyhow::Result<()> {
        Ok(())
    }
}
