//! Storage collaborator contract

use crate::entity::{ChangeSet, Entity, Scannable, StorageKey};
use crate::error::{LedgerError, Result};
use crate::types::{Block, Header};

/// Read side of a keyed store, implemented by backends and by overlays
pub trait ReadStorage {
    fn try_get<E: Entity>(&self, key: &E::Key) -> Result<Option<E>>;

    fn get<E: Entity>(&self, key: &E::Key) -> Result<E> {
        self.try_get::<E>(key)?.ok_or_else(|| not_found::<E>(key))
    }

    /// Every stored value of kind `E` matching `partial`
    fn scan<E: Scannable>(&self, partial: &E::PartialKey) -> Result<Vec<E>>;
}

/// Persistent backend
///
/// `commit` must apply a change-set atomically: either every change becomes
/// visible or none does.
pub trait Storage: ReadStorage + Send + Sync {
    fn try_get_latest_block(&self) -> Result<Option<Block>>;
    fn try_get_latest_header(&self) -> Result<Option<Header>>;
    fn commit(&self, changes: ChangeSet) -> Result<()>;
    fn reset(&self) -> Result<()>;
}

pub fn not_found<E: Entity>(key: &E::Key) -> LedgerError {
    LedgerError::NotFound { kind: E::KIND.name(), key: key.key_string() }
}
