//! Change-tracking caches layered over a read-only store
//!
//! A `StorageCache` records at most one pending change per key: an add
//! (the new value) or a delete. Reads consult the pending change first and
//! fall through to the backing store otherwise. Nothing is written until the
//! pending changes are flattened into a `ChangeSet` and committed.

use std::collections::BTreeMap;

use crate::entity::{CacheSet, Change, ChangeSet, Deletable, Entity, Scannable, StorageKey, Updatable};
use crate::error::{LedgerError, Result};
use crate::storage::{not_found, ReadStorage};

#[derive(Debug, Clone, PartialEq)]
pub enum TrackedChange<E: Entity> {
    Add(E),
    Delete(E::Key),
}

#[derive(Debug)]
pub struct StorageCache<E: Entity> {
    values: BTreeMap<E::Key, TrackedChange<E>>,
}

impl<E: Entity> Default for StorageCache<E> {
    fn default() -> Self {
        StorageCache { values: BTreeMap::new() }
    }
}

impl<E: Entity> StorageCache<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked(&self, key: &E::Key) -> Option<&TrackedChange<E>> {
        self.values.get(key)
    }

    pub fn try_get<S: ReadStorage>(&self, storage: &S, key: &E::Key) -> Result<Option<E>> {
        match self.values.get(key) {
            Some(TrackedChange::Add(value)) => Ok(Some(value.clone())),
            Some(TrackedChange::Delete(_)) => Ok(None),
            None => storage.try_get::<E>(key),
        }
    }

    pub fn get<S: ReadStorage>(&self, storage: &S, key: &E::Key) -> Result<E> {
        self.try_get(storage, key)?.ok_or_else(|| not_found::<E>(key))
    }

    /// Stage `value`; without `force` an existing value for the key is an error
    pub fn add<S: ReadStorage>(&mut self, storage: &S, value: E, force: bool) -> Result<()> {
        if !force {
            let key = value.key();
            if self.try_get(storage, &key)?.is_some() {
                return Err(LedgerError::AlreadyExists {
                    kind: E::KIND.name(),
                    key: key.key_string(),
                });
            }
        }
        self.stage_add(value);
        Ok(())
    }

    pub fn stage_add(&mut self, value: E) {
        self.values.insert(value.key(), TrackedChange::Add(value));
    }

    pub fn stage_delete(&mut self, key: E::Key) {
        self.values.insert(key.clone(), TrackedChange::Delete(key));
    }

    /// Values staged as adds, in key order
    pub fn added(&self) -> impl Iterator<Item = &E> {
        self.values.values().filter_map(|change| match change {
            TrackedChange::Add(value) => Some(value),
            TrackedChange::Delete(_) => None,
        })
    }

    /// Keys staged as deletes, in key order
    pub fn deleted(&self) -> impl Iterator<Item = &E::Key> {
        self.values.values().filter_map(|change| match change {
            TrackedChange::Add(_) => None,
            TrackedChange::Delete(key) => Some(key),
        })
    }

    pub fn change_set(&self) -> ChangeSet {
        self.values
            .values()
            .map(|change| match change {
                TrackedChange::Add(value) => Change::Add(value.clone().into_record()),
                TrackedChange::Delete(key) => Change::Delete(E::record_key(key)),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<E: Updatable> StorageCache<E> {
    /// Stage the result of applying `update` to `value` and return it
    pub fn update(&mut self, value: &E, update: E::Update) -> E {
        let next = value.update(update);
        self.stage_add(next.clone());
        next
    }
}

impl<E: Deletable> StorageCache<E> {
    pub fn delete(&mut self, key: &E::Key) {
        self.stage_delete(key.clone());
    }
}

impl<E: Scannable> StorageCache<E> {
    /// Storage scan minus every key with a pending change, then pending adds
    /// matching `partial`
    pub fn get_all<S: ReadStorage>(&self, storage: &S, partial: &E::PartialKey) -> Result<Vec<E>> {
        let mut values: Vec<E> = storage
            .scan::<E>(partial)?
            .into_iter()
            .filter(|value| !self.values.contains_key(&value.key()))
            .collect();
        values.extend(self.added().filter(|value| value.matches(partial)).cloned());
        Ok(values)
    }
}

/// A full set of caches over one backing store
///
/// Overlays implement `ReadStorage` themselves, so one overlay can back
/// another; the inner overlay's change-set is hoisted into the outer one
/// with `apply_change_set`.
pub struct Overlay<'a, S> {
    storage: &'a S,
    caches: CacheSet,
}

impl<'a, S: ReadStorage> Overlay<'a, S> {
    pub fn new(storage: &'a S) -> Self {
        Overlay { storage, caches: CacheSet::new() }
    }

    pub fn storage(&self) -> &'a S {
        self.storage
    }

    pub fn cache<E: Entity>(&self) -> &StorageCache<E> {
        E::cache(&self.caches)
    }

    pub fn add<E: Entity>(&mut self, value: E, force: bool) -> Result<()> {
        E::cache_mut(&mut self.caches).add(self.storage, value, force)
    }

    pub fn update<E: Updatable>(&mut self, value: &E, update: E::Update) -> E {
        E::cache_mut(&mut self.caches).update(value, update)
    }

    pub fn delete<E: Deletable>(&mut self, key: &E::Key) {
        E::cache_mut(&mut self.caches).delete(key)
    }

    pub fn change_set(&self) -> ChangeSet {
        self.caches.change_set()
    }

    pub fn into_change_set(self) -> ChangeSet {
        self.caches.change_set()
    }

    /// Replay `changes` as pending adds and deletes
    pub fn apply_change_set(&mut self, changes: ChangeSet) {
        for change in changes {
            self.caches.stage(change);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

impl<S: ReadStorage> ReadStorage for Overlay<'_, S> {
    fn try_get<E: Entity>(&self, key: &E::Key) -> Result<Option<E>> {
        E::cache(&self.caches).try_get(self.storage, key)
    }

    fn scan<E: Scannable>(&self, partial: &E::PartialKey) -> Result<Vec<E>> {
        E::cache(&self.caches).get_all(self.storage, partial)
    }
}
