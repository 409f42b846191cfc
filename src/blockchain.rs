//! Blockchain orchestrator
//!
//! Blocks may arrive in any order and from any task. They wait in a
//! min-queue keyed by index until they are next in line, then a single
//! persist loop verifies, applies and commits them one at a time. Every
//! committed block advances the chain head and is published to subscribers.

use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::block;
use crate::constants::{BLOCK_CHANNEL_CAPACITY, INVOKE_SCRIPT_GAS};
use crate::economic;
use crate::error::{LedgerError, Result};
use crate::header_index::HeaderIndexCache;
use crate::settings::Settings;
use crate::state::*;
use crate::storage::{ReadStorage, Storage};
use crate::transaction::{self, VerifyContext};
use crate::types::*;
use crate::validators;
use crate::vm::{ActionContext, ScriptContainer, Vm};
use crate::witness::WitnessVerification;
use crate::write_batch::{InvocationReceipt, WriteBatch};

struct QueueEntry {
    index: u32,
    seq: u64,
    block: Block,
    skip_verification: bool,
    done: oneshot::Sender<Result<()>>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.index, self.seq).cmp(&(other.index, other.seq))
    }
}

#[derive(Default)]
struct ChainState {
    current_block: Option<Block>,
    previous_block: Option<Block>,
    current_header: Option<Header>,
    running: bool,
    persisting: bool,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    in_queue: HashSet<Hash256>,
    next_seq: u64,
}

impl ChainState {
    fn current_index(&self) -> Option<u32> {
        self.current_block.as_ref().map(Block::index)
    }
}

struct Inner<S, V> {
    settings: Settings,
    storage: Arc<S>,
    vm: V,
    header_index: HeaderIndexCache<S>,
    state: Mutex<ChainState>,
    idle: Notify,
    blocks: broadcast::Sender<Block>,
}

/// Handle to a running chain; clones share the same state
pub struct Blockchain<S, V> {
    inner: Arc<Inner<S, V>>,
}

impl<S, V> Clone for Blockchain<S, V> {
    fn clone(&self) -> Self {
        Blockchain { inner: self.inner.clone() }
    }
}

impl<S: Storage + 'static, V: Vm + 'static> Blockchain<S, V> {
    /// Open the chain stored in `storage`
    ///
    /// An empty store is seeded with the genesis block. Otherwise the chain
    /// head is restored from the latest stored block and the header index is
    /// brought up to it.
    pub async fn create(settings: Settings, storage: Arc<S>, vm: V) -> Result<Self> {
        let header_index = HeaderIndexCache::new(storage.clone())?;
        let current_block = storage.try_get_latest_block()?;
        let current_header = storage.try_get_latest_header()?;
        let previous_block = match &current_block {
            Some(block) if block.index() > 0 => storage.try_get::<Block>(&block.previous_hash())?,
            _ => None,
        };

        let (blocks, _) = broadcast::channel(BLOCK_CHANNEL_CAPACITY);
        let state = ChainState {
            current_block,
            previous_block,
            current_header,
            running: true,
            ..ChainState::default()
        };
        let blockchain = Blockchain {
            inner: Arc::new(Inner {
                settings,
                storage,
                vm,
                header_index,
                state: Mutex::new(state),
                idle: Notify::new(),
                blocks,
            }),
        };

        match blockchain.current_block_index() {
            None => {
                let genesis = blockchain.inner.settings.genesis_block.clone();
                blockchain.persist_block(genesis, false).await?;
            }
            Some(index) => blockchain.inner.sync_header_index(index)?,
        }

        info!(index = ?blockchain.current_block_index(), "blockchain started");
        Ok(blockchain)
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.inner.storage
    }

    pub fn current_block(&self) -> Result<Block> {
        self.inner.state.lock().current_block.clone().ok_or(LedgerError::GenesisBlockNotRegistered)
    }

    pub fn previous_block(&self) -> Option<Block> {
        self.inner.state.lock().previous_block.clone()
    }

    pub fn current_header(&self) -> Result<Header> {
        self.inner.state.lock().current_header.clone().ok_or(LedgerError::GenesisBlockNotRegistered)
    }

    pub fn current_block_index(&self) -> Option<u32> {
        self.inner.state.lock().current_index()
    }

    /// Stream of committed blocks, in commit order
    pub fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.inner.blocks.subscribe()
    }

    /// Queue `block` and wait until it is committed or rejected
    ///
    /// A block whose hash is already queued resolves immediately. With
    /// `skip_verification` the block is applied without running any
    /// verification rule.
    pub async fn persist_block(&self, block: Block, skip_verification: bool) -> Result<()> {
        let hash = block.hash();
        let done = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return Err(LedgerError::Stopped);
            }
            if !state.in_queue.insert(hash) {
                debug!(hash = %short_hex(&hash), "block already queued");
                return Ok(());
            }
            let (done, wait) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(Reverse(QueueEntry {
                index: block.index(),
                seq,
                block,
                skip_verification,
                done,
            }));
            wait
        };

        self.kick();
        done.await.map_err(|_| LedgerError::Stopped)?
    }

    fn kick(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.persisting || !state.running {
                return;
            }
            state.persisting = true;
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.persist_loop());
    }

    /// Stop applying blocks
    ///
    /// Waits for an in-flight commit to finish; queued blocks stay queued.
    pub async fn stop(&self) {
        loop {
            let idle = self.inner.idle.notified();
            {
                let mut state = self.inner.state.lock();
                state.running = false;
                if !state.persisting {
                    break;
                }
            }
            idle.await;
        }
        if let Err(error) = self.inner.header_index.dispose() {
            warn!(%error, "failed to persist header index tail");
        }
        info!("blockchain stopped");
    }

    /// Wipe storage and start over from genesis
    ///
    /// Callers still waiting on queued blocks are rejected with `Stopped`.
    pub async fn reset(&self) -> Result<()> {
        self.stop().await;
        self.inner.storage.reset()?;
        self.inner.header_index.reset();
        {
            let mut state = self.inner.state.lock();
            let next_seq = state.next_seq;
            *state = ChainState { running: true, next_seq, ..ChainState::default() };
        }
        info!("blockchain reset");

        let genesis = self.inner.settings.genesis_block.clone();
        self.persist_block(genesis, false).await
    }

    /// Full verification of `block` against the committed chain
    ///
    /// Failures not raised by a verification rule surface as `UnknownVerify`.
    pub fn verify_block(&self, block: &Block) -> Result<()> {
        self.inner
            .with_context(|ctx| block::verify_block(ctx, block))
            .map_err(LedgerError::into_verify_error)
    }

    /// Verify `tx` against the committed chain and `mempool`
    ///
    /// Failures not raised by a verification rule surface as `UnknownVerify`.
    pub fn verify_transaction(&self, tx: &Transaction, mempool: &[Transaction]) -> Result<WitnessVerification> {
        self.inner
            .with_context(|ctx| transaction::verify_transaction(ctx, tx, mempool))
            .map_err(LedgerError::into_verify_error)
    }

    pub fn verify_consensus_payload(&self, payload: &ConsensusPayload) -> Result<()> {
        let current = self.current_header()?;
        self.inner
            .with_context(|ctx| block::verify_consensus_payload(ctx, payload, &current))
    }

    /// Simulate `script` on top of the committed chain
    pub fn invoke_script(&self, script: ByteString) -> Result<InvocationReceipt> {
        let tx = Transaction::new(TransactionKind::Invocation { script: script.clone(), gas: 0 });
        self.inner.invoke(script, &tx)
    }

    /// Simulate an invocation transaction without committing it
    pub fn invoke_transaction(&self, tx: &Transaction) -> Result<InvocationReceipt> {
        match &tx.kind {
            TransactionKind::Invocation { script, .. } => self.inner.invoke(script.clone(), tx),
            _ => Err(LedgerError::Verify("Expected an invocation transaction".to_string())),
        }
    }

    /// Validators elected after applying `transactions` to the chain
    pub fn get_validators(&self, transactions: &[Transaction]) -> Result<Vec<ValidatorKey>> {
        validators::get_validators(self.inner.storage.as_ref(), &self.inner.settings, transactions)
    }

    pub fn calculate_claim_amount(&self, claims: &[Input]) -> Result<Fixed8> {
        economic::calculate_claim_amount(self.inner.storage.as_ref(), &self.inner.settings, claims, |index| {
            self.inner.system_fee_at(index)
        })
    }

    pub fn is_spent(&self, input: &Input) -> Result<bool> {
        economic::is_spent(self.inner.storage.as_ref(), input)
    }

    /// Unspent coins owned by `address`
    pub fn get_unspent(&self, address: &Hash160) -> Result<Vec<Input>> {
        let mut inputs: Vec<Input> = self
            .inner
            .storage
            .scan::<AccountUnspent>(address)?
            .into_iter()
            .map(|unspent| unspent.input)
            .collect();
        inputs.sort();
        Ok(inputs)
    }

    /// Spent governing coins of `address` whose generation is still unclaimed
    pub fn get_unclaimed(&self, address: &Hash160) -> Result<Vec<Input>> {
        let mut inputs: Vec<Input> = self
            .inner
            .storage
            .scan::<AccountUnclaimed>(address)?
            .into_iter()
            .map(|unclaimed| unclaimed.input)
            .collect();
        inputs.sort();
        Ok(inputs)
    }

    /// Invocation outcome of transaction `hash` with the actions it emitted
    pub fn try_get_invocation_data(&self, hash: &Hash256) -> Result<Option<(InvocationData, Vec<Action>)>> {
        let data = match self.inner.storage.try_get::<InvocationData>(hash)? {
            Some(data) => data,
            None => return Ok(None),
        };
        let mut actions = self.inner.storage.scan::<Action>(&ActionsKey {
            index_start: Some(data.action_index_start),
            index_stop: Some(data.action_index_stop),
        })?;
        actions.sort_by_key(|action| action.index);
        Ok(Some((data, actions)))
    }

    pub fn try_get_block_by_index(&self, index: u32) -> Result<Option<Block>> {
        match self.inner.header_index.try_get(index)? {
            Some(hash) => self.inner.storage.try_get::<Block>(&hash),
            None => Ok(None),
        }
    }

    pub fn try_get_header_by_index(&self, index: u32) -> Result<Option<Header>> {
        match self.inner.header_index.try_get(index)? {
            Some(hash) => self.inner.storage.try_get::<Header>(&hash),
            None => Ok(None),
        }
    }
}

impl<S: Storage, V: Vm> Inner<S, V> {
    /// Drain ready blocks from the queue
    ///
    /// Verification, VM runs and commits all block, so this runs on the
    /// blocking pool rather than an async worker.
    fn persist_loop(&self) {
        loop {
            let entry = {
                let mut state = self.state.lock();
                let current = state.current_index();

                // stale duplicates of already applied heights
                while let Some(Reverse(head)) = state.queue.peek() {
                    if !current.map_or(false, |index| head.index <= index) {
                        break;
                    }
                    if let Some(Reverse(stale)) = state.queue.pop() {
                        state.in_queue.remove(&stale.block.hash());
                        let _ = stale.done.send(Ok(()));
                    }
                }

                let next = current.map_or(0, |index| index + 1);
                let ready = state.running
                    && state.queue.peek().map_or(false, |Reverse(head)| head.index == next);
                if !ready {
                    state.persisting = false;
                    self.idle.notify_waiters();
                    return;
                }
                match state.queue.pop() {
                    Some(Reverse(entry)) => entry,
                    None => {
                        state.persisting = false;
                        self.idle.notify_waiters();
                        return;
                    }
                }
            };

            let index = entry.index;
            let hash = entry.block.hash();
            let start = Instant::now();
            let result = self.apply(&entry.block, entry.skip_verification);

            {
                let mut state = self.state.lock();
                state.in_queue.remove(&hash);
                if result.is_ok() {
                    state.previous_block = state.current_block.take();
                    state.current_header = Some(entry.block.header.clone());
                    state.current_block = Some(entry.block.clone());
                } else {
                    state.persisting = false;
                }
            }

            match result {
                Ok(()) => {
                    if let Err(error) = self.header_index.push(hash) {
                        debug!(%error, "header hash flush deferred");
                    }
                    info!(
                        index,
                        hash = %short_hex(&hash),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "persisted block"
                    );
                    let _ = entry.done.send(Ok(()));
                    let _ = self.blocks.send(entry.block);
                }
                Err(e) => {
                    error!(index, hash = %short_hex(&hash), error = %e, "failed to persist block");
                    let _ = entry.done.send(Err(e));
                    self.idle.notify_waiters();
                    return;
                }
            }
        }
    }

    /// Verify, stage and commit one block
    fn apply(&self, block: &Block, skip_verification: bool) -> Result<()> {
        if !skip_verification && block.index() > 0 {
            self.with_context(|ctx| block::verify_block(ctx, block))?;
        }

        let changes = {
            let mut batch = WriteBatch::new(&self.settings, self.storage.as_ref(), &self.vm, Some(block.index()));
            batch.persist_block(block)?;
            batch.into_change_set()
        };
        debug!(index = block.index(), changes = changes.len(), "committing block");
        self.storage.commit(changes)
    }

    fn with_context<T>(&self, f: impl FnOnce(&VerifyContext<'_, S>) -> Result<T>) -> Result<T> {
        let system_fee_at = |index: u32| self.system_fee_at(index);
        let ctx = VerifyContext {
            vm: &self.vm,
            settings: &self.settings,
            view: self.storage.as_ref(),
            current_height: self.state.lock().current_index().unwrap_or(0),
            system_fee_at: &system_fee_at,
        };
        f(&ctx)
    }

    /// Accumulated system fee up to and including block `index`
    fn system_fee_at(&self, index: u32) -> Result<Fixed8> {
        let hash = self.header_index.get(index)?;
        Ok(self.storage.get::<BlockData>(&hash)?.system_fee)
    }

    fn invoke(&self, script: ByteString, tx: &Transaction) -> Result<InvocationReceipt> {
        let (block_index, block_hash) = {
            let state = self.state.lock();
            match &state.current_block {
                Some(block) => (block.index(), block.hash()),
                None => return Err(LedgerError::GenesisBlockNotRegistered),
            }
        };
        let context = ActionContext {
            block_index,
            block_hash,
            transaction_index: 0,
            transaction_hash: tx.hash(),
        };
        let mut batch = WriteBatch::new(&self.settings, self.storage.as_ref(), &self.vm, Some(block_index));
        batch.invoke(script, ScriptContainer::Transaction(tx), INVOKE_SCRIPT_GAS, context)
    }

    /// Push the hashes of stored headers the index does not cover yet
    fn sync_header_index(&self, current_index: u32) -> Result<()> {
        let indexed = self.header_index.len();
        if indexed > current_index {
            return Ok(());
        }

        let mut missing = Vec::with_capacity((current_index + 1 - indexed) as usize);
        let mut header = self.state.lock().current_header.clone();
        while let Some(current) = header {
            if current.index < indexed {
                break;
            }
            missing.push(current.hash());
            header = if current.index == 0 {
                None
            } else {
                Some(self.storage.get::<Header>(&current.previous_hash)?)
            };
        }

        debug!(count = missing.len(), "restoring header index");
        for hash in missing.into_iter().rev() {
            self.header_index.push(hash)?;
        }
        Ok(())
    }
}
