//! # Ledger Persist
//!
//! State-transition core of a UTXO + account ledger node.
//!
//! Blocks arrive in any order and are applied strictly in index order. Each
//! block is verified, staged in a change-tracking overlay and committed to
//! storage as one atomic change-set. Committed blocks are published to
//! subscribers.
//!
//! ## Architecture
//!
//! - `cache`: per-entity change tracking over a read-only store; overlays stack
//! - `write_batch`: stages every effect of one block, with nested overlays for
//!   script invocations
//! - `witness`: runs witness scripts through the VM under a shared gas budget
//! - `validators`: vote bookkeeping and the trimmed weighted-average election
//! - `header_index`: index to header hash lookup, persisted in batches
//! - `blockchain`: the async orchestrator tying these together
//!
//! Storage and the script VM are collaborators behind the `Storage` and `Vm`
//! traits. `MemoryStorage` is an in-memory backend.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ledger_persist::vm::{ChainAccess, ExecuteScriptsRequest, ExecutionListeners, ExecutionResult, StackItem, Vm, VmState};
//! use ledger_persist::{Blockchain, MemoryStorage, Settings};
//!
//! struct AlwaysTrue;
//!
//! impl Vm for AlwaysTrue {
//!     fn execute_scripts(
//!         &self,
//!         _request: ExecuteScriptsRequest<'_>,
//!         _chain: &mut dyn ChainAccess,
//!         _listeners: &mut dyn ExecutionListeners,
//!     ) -> anyhow::Result<ExecutionResult> {
//!         Ok(ExecutionResult {
//!             state: VmState::Halt,
//!             gas_consumed: 0,
//!             stack: vec![StackItem::Boolean(true)],
//!             error_message: None,
//!         })
//!     }
//! }
//!
//! # async fn run() -> ledger_persist::Result<()> {
//! let settings = Settings::from_json(
//!     r#"{"standby_validators": ["0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"]}"#,
//! )?;
//! let chain = Blockchain::create(settings, Arc::new(MemoryStorage::new()), AlwaysTrue).await?;
//! assert_eq!(chain.current_block_index(), Some(0));
//! chain.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod script;
pub mod state;
pub mod entity;
pub mod storage;
pub mod memory;
pub mod cache;
pub mod header_index;
pub mod vm;
pub mod settings;
pub mod economic;
pub mod validators;
pub mod witness;
pub mod transaction;
pub mod block;
pub mod write_batch;
pub mod blockchain;

// Re-export commonly used types
pub use types::*;
pub use error::{LedgerError, Result};
pub use blockchain::Blockchain;
pub use cache::{Overlay, StorageCache};
pub use entity::{Change, ChangeSet, Entity, EntityKind, Record, RecordKey};
pub use header_index::HeaderIndexCache;
pub use memory::MemoryStorage;
pub use settings::{Settings, SettingsConfig};
pub use storage::{ReadStorage, Storage};
pub use write_batch::{InvocationReceipt, WriteBatch};
