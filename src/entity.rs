//! Registry of persisted entity kinds
//!
//! Every kind stored by the ledger is declared once in the `entities!` table
//! below, which generates:
//! - `EntityKind`, the tag used in logs and errors
//! - `Record` / `RecordKey`, the type-erased value and key carried by change-sets
//! - `CacheSet`, one `StorageCache` per kind
//! - the `Entity` implementation tying a value type to all of the above
//!
//! Capabilities beyond read/add are opted into per kind through `Updatable`,
//! `Deletable` and `Scannable`.

use std::fmt;

use crate::cache::StorageCache;
use crate::state::*;
use crate::types::*;

/// Key type of an entity kind, with its canonical string form
pub trait StorageKey: Clone + Ord + fmt::Debug + Send + Sync + 'static {
    fn key_string(&self) -> String;
}

impl StorageKey for Hash160 {
    fn key_string(&self) -> String {
        hex::encode(self)
    }
}

impl StorageKey for Hash256 {
    fn key_string(&self) -> String {
        hex::encode(self)
    }
}

impl StorageKey for ValidatorKey {
    fn key_string(&self) -> String {
        self.to_hex()
    }
}

impl StorageKey for Input {
    fn key_string(&self) -> String {
        format!("{}:{}", hex::encode(self.hash), self.index)
    }
}

impl StorageKey for (Hash160, Input) {
    fn key_string(&self) -> String {
        format!("{}:{}", hex::encode(self.0), self.1.key_string())
    }
}

impl StorageKey for (Hash160, ByteString) {
    fn key_string(&self) -> String {
        format!("{}:{}", hex::encode(self.0), hex::encode(&self.1))
    }
}

impl StorageKey for u32 {
    fn key_string(&self) -> String {
        self.to_string()
    }
}

impl StorageKey for u64 {
    fn key_string(&self) -> String {
        self.to_string()
    }
}

impl StorageKey for () {
    fn key_string(&self) -> String {
        String::new()
    }
}

/// A value type persisted under its own kind
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    type Key: StorageKey;
    const KIND: EntityKind;

    fn key(&self) -> Self::Key;
    fn into_record(self) -> Record;
    fn from_record(record: &Record) -> Option<&Self>;
    fn record_key(key: &Self::Key) -> RecordKey;
    fn cache(caches: &CacheSet) -> &StorageCache<Self>;
    fn cache_mut(caches: &mut CacheSet) -> &mut StorageCache<Self>;
}

/// Kinds whose stored value can be replaced through an update reducer
pub trait Updatable: Entity {
    type Update;

    fn update(&self, update: Self::Update) -> Self;
}

/// Kinds that can be removed
pub trait Deletable: Entity {}

/// Kinds that support range scans by partial key
pub trait Scannable: Entity {
    type PartialKey;

    fn matches(&self, partial: &Self::PartialKey) -> bool;
}

/// Staged mutation carried by a change-set
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Add(Record),
    Delete(RecordKey),
}

impl Change {
    pub fn kind(&self) -> EntityKind {
        match self {
            Change::Add(record) => record.kind(),
            Change::Delete(key) => key.kind(),
        }
    }
}

/// Ordered list of staged mutations, applied atomically by storage
pub type ChangeSet = Vec<Change>;

macro_rules! entities {
    ($($variant:ident($ty:ty, $key:ty, $field:ident, $name:literal) => |$v:ident| $key_expr:expr;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum EntityKind {
            $($variant,)*
        }

        impl EntityKind {
            pub fn name(self) -> &'static str {
                match self {
                    $(EntityKind::$variant => $name,)*
                }
            }
        }

        #[derive(Debug, Clone, PartialEq)]
        pub enum Record {
            $($variant($ty),)*
        }

        impl Record {
            pub fn kind(&self) -> EntityKind {
                match self {
                    $(Record::$variant(_) => EntityKind::$variant,)*
                }
            }

            pub fn key(&self) -> RecordKey {
                match self {
                    $(Record::$variant(value) => RecordKey::$variant(value.key()),)*
                }
            }
        }

        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum RecordKey {
            $($variant($key),)*
        }

        impl RecordKey {
            pub fn kind(&self) -> EntityKind {
                match self {
                    $(RecordKey::$variant(_) => EntityKind::$variant,)*
                }
            }

            pub fn key_string(&self) -> String {
                match self {
                    $(RecordKey::$variant(key) => key.key_string(),)*
                }
            }
        }

        /// One change-tracking cache per entity kind
        #[derive(Debug, Default)]
        pub struct CacheSet {
            $(pub $field: StorageCache<$ty>,)*
        }

        impl CacheSet {
            pub fn new() -> Self {
                Self::default()
            }

            /// Flatten every cache into one change-set, in kind order
            pub fn change_set(&self) -> ChangeSet {
                let mut changes = Vec::new();
                $(changes.extend(self.$field.change_set());)*
                changes
            }

            /// Stage a change without capability or existence checks
            pub fn stage(&mut self, change: Change) {
                match change {
                    $(Change::Add(Record::$variant(value)) => self.$field.stage_add(value),)*
                    $(Change::Delete(RecordKey::$variant(key)) => self.$field.stage_delete(key),)*
                }
            }

            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_empty())*
            }
        }

        $(
            impl Entity for $ty {
                type Key = $key;
                const KIND: EntityKind = EntityKind::$variant;

                fn key(&self) -> $key {
                    let $v = self;
                    $key_expr
                }

                fn into_record(self) -> Record {
                    Record::$variant(self)
                }

                fn from_record(record: &Record) -> Option<&Self> {
                    match record {
                        Record::$variant(value) => Some(value),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn record_key(key: &$key) -> RecordKey {
                    RecordKey::$variant(key.clone())
                }

                fn cache(caches: &CacheSet) -> &StorageCache<Self> {
                    &caches.$field
                }

                fn cache_mut(caches: &mut CacheSet) -> &mut StorageCache<Self> {
                    &mut caches.$field
                }
            }
        )*
    };
}

entities! {
    Account(Account, Hash160, account, "account") => |v| v.hash;
    AccountUnspent(AccountUnspent, (Hash160, Input), account_unspent, "accountUnspent") => |v| (v.address, v.input);
    AccountUnclaimed(AccountUnclaimed, (Hash160, Input), account_unclaimed, "accountUnclaimed") => |v| (v.address, v.input);
    Action(Action, u64, action, "action") => |v| v.index;
    Asset(Asset, Hash256, asset, "asset") => |v| v.hash;
    Block(Block, Hash256, block, "block") => |v| v.hash();
    BlockData(BlockData, Hash256, block_data, "blockData") => |v| v.hash;
    Header(Header, Hash256, header, "header") => |v| v.hash();
    Transaction(Transaction, Hash256, transaction, "transaction") => |v| v.hash();
    TransactionData(TransactionData, Hash256, transaction_data, "transactionData") => |v| v.hash;
    Output(Coin, Input, output, "output") => |v| v.input;
    Contract(Contract, Hash160, contract, "contract") => |v| v.hash();
    StorageItem(StorageItem, (Hash160, ByteString), storage_item, "storageItem") => |v| (v.hash, v.key.clone());
    Validator(Validator, ValidatorKey, validator, "validator") => |v| v.public_key;
    InvocationData(InvocationData, Hash256, invocation_data, "invocationData") => |v| v.hash;
    ValidatorsCount(ValidatorsCount, (), validators_count, "validatorsCount") => |_v| ();
    HeaderHashList(HeaderHashList, u32, header_hash_list, "headerHashList") => |v| v.batch;
    HeaderHashCount(HeaderHashCount, (), header_hash_count, "headerHashCount") => |_v| ();
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
