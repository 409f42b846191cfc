//! Core chain types: hashes, keys, transactions, headers and blocks

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{LedgerError, Result};
use crate::script::hash256;
use crate::state::Contract;

/// Hash type: 256-bit hash (transactions, blocks, assets)
pub type Hash256 = [u8; 32];

/// Hash type: 160-bit script hash (addresses, contracts)
pub type Hash160 = [u8; 20];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Fixed-point amount with 8 decimals
pub type Fixed8 = i64;

/// Compressed secp256k1 public key identifying a validator
///
/// Keys order by their compressed byte encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidatorKey([u8; 33]);

impl ValidatorKey {
    /// Parse and validate a public key, normalizing it to compressed form
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key = secp256k1::PublicKey::from_slice(bytes)
            .map_err(|e| LedgerError::Verify(format!("Invalid public key: {}", e)))?;
        Ok(ValidatorKey(key.serialize()))
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| LedgerError::Verify(format!("Invalid public key hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<secp256k1::PublicKey> for ValidatorKey {
    fn from(key: secp256k1::PublicKey) -> Self {
        ValidatorKey(key.serialize())
    }
}

impl fmt::Debug for ValidatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorKey({})", self.to_hex())
    }
}

impl fmt::Display for ValidatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ValidatorKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ValidatorKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        ValidatorKey::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// Reference to a coin: output `index` of transaction `hash`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Input {
    pub hash: Hash256,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub asset: Hash256,
    pub value: Fixed8,
    pub address: Hash160,
}

/// Invocation script (arguments) paired with the verification script it feeds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub invocation: ByteString,
    pub verification: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attribute {
    /// Requires a witness from the given script hash
    Script(Hash160),
    Remark(ByteString),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AssetType {
    GoverningToken,
    UtilityToken,
    Currency,
    Share,
    Invoice,
    Token,
}

impl AssetType {
    /// Duty assets require the receiver's witness
    pub fn is_duty(self) -> bool {
        matches!(self, AssetType::Share | AssetType::Invoice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRegistration {
    pub asset_type: AssetType,
    pub name: String,
    pub amount: Fixed8,
    pub precision: u8,
    /// `None` stands for the point at infinity used by system assets
    pub owner: Option<ValidatorKey>,
    pub admin: Hash160,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateDescriptorType {
    Account,
    Validator,
}

/// One field assignment carried by a state transaction
///
/// Account descriptors: `key` is the account hash and `value` a var-int
/// prefixed list of 33-byte public keys (the new votes).
/// Validator descriptors: `key` is the public key and `value` a single
/// byte, registered when any byte is non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDescriptor {
    pub descriptor_type: StateDescriptorType,
    pub key: ByteString,
    pub field: String,
    pub value: ByteString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransactionType {
    Miner,
    Issue,
    Claim,
    Enrollment,
    Register,
    Contract,
    State,
    Publish,
    Invocation,
}

/// Per-type payload of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Miner { nonce: u32 },
    Issue,
    Claim { claims: Vec<Input> },
    Enrollment { public_key: ValidatorKey },
    Register { asset: AssetRegistration },
    Contract,
    State { descriptors: Vec<StateDescriptor> },
    Publish { contract: Contract },
    Invocation { script: ByteString, gas: Fixed8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    pub kind: TransactionKind,
    pub attributes: Vec<Attribute>,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub scripts: Vec<Witness>,
}

#[derive(Serialize)]
struct UnsignedTransaction<'a> {
    version: u8,
    kind: &'a TransactionKind,
    attributes: &'a [Attribute],
    inputs: &'a [Input],
    outputs: &'a [Output],
}

impl Transaction {
    pub fn new(kind: TransactionKind) -> Self {
        Transaction {
            version: 0,
            kind,
            attributes: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            scripts: Vec::new(),
        }
    }

    pub fn transaction_type(&self) -> TransactionType {
        match self.kind {
            TransactionKind::Miner { .. } => TransactionType::Miner,
            TransactionKind::Issue => TransactionType::Issue,
            TransactionKind::Claim { .. } => TransactionType::Claim,
            TransactionKind::Enrollment { .. } => TransactionType::Enrollment,
            TransactionKind::Register { .. } => TransactionType::Register,
            TransactionKind::Contract => TransactionType::Contract,
            TransactionKind::State { .. } => TransactionType::State,
            TransactionKind::Publish { .. } => TransactionType::Publish,
            TransactionKind::Invocation { .. } => TransactionType::Invocation,
        }
    }

    /// Hash of the unsigned transaction (witnesses excluded)
    pub fn hash(&self) -> Hash256 {
        let unsigned = UnsignedTransaction {
            version: self.version,
            kind: &self.kind,
            attributes: &self.attributes,
            inputs: &self.inputs,
            outputs: &self.outputs,
        };
        // plain data with string map keys only, encoding cannot fail
        hash256(&serde_json::to_vec(&unsigned).unwrap_or_default())
    }

    /// Coins referenced by a claim transaction, empty for every other type
    pub fn claims(&self) -> &[Input] {
        match &self.kind {
            TransactionKind::Claim { claims } => claims,
            _ => &[],
        }
    }

    pub fn descriptors(&self) -> &[StateDescriptor] {
        match &self.kind {
            TransactionKind::State { descriptors } => descriptors,
            _ => &[],
        }
    }

    /// Coin reference for output `index` of this transaction
    pub fn output_reference(&self, index: u32) -> Input {
        Input { hash: self.hash(), index }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub previous_hash: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u64,
    pub index: u32,
    pub consensus_data: u64,
    /// Script hash that must sign the next block
    pub next_consensus: Hash160,
    pub script: Witness,
}

#[derive(Serialize)]
struct UnsignedHeader<'a> {
    version: u32,
    previous_hash: &'a Hash256,
    merkle_root: &'a Hash256,
    timestamp: u64,
    index: u32,
    consensus_data: u64,
    next_consensus: &'a Hash160,
}

impl Header {
    pub fn hash(&self) -> Hash256 {
        let unsigned = UnsignedHeader {
            version: self.version,
            previous_hash: &self.previous_hash,
            merkle_root: &self.merkle_root,
            timestamp: self.timestamp,
            index: self.index,
            consensus_data: self.consensus_data,
            next_consensus: &self.next_consensus,
        };
        hash256(&serde_json::to_vec(&unsigned).unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn index(&self) -> u32 {
        self.header.index
    }

    pub fn previous_hash(&self) -> Hash256 {
        self.header.previous_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    /// Merkle root over the transaction hashes
    ///
    /// Levels are built bottom-up with double SHA-256; an odd hash is paired
    /// with itself.
    pub fn compute_merkle_root(&self) -> Hash256 {
        let mut hashes: Vec<Hash256> = self.transactions.iter().map(Transaction::hash).collect();
        if hashes.is_empty() {
            return [0u8; 32];
        }

        while hashes.len() > 1 {
            hashes = hashes
                .chunks(2)
                .map(|chunk| {
                    let right = chunk.get(1).unwrap_or(&chunk[0]);
                    let mut combined = Vec::with_capacity(64);
                    combined.extend_from_slice(&chunk[0]);
                    combined.extend_from_slice(right);
                    hash256(&combined)
                })
                .collect();
        }

        hashes[0]
    }
}

/// Consensus message relayed between validators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPayload {
    pub version: u32,
    pub previous_hash: Hash256,
    pub block_index: u32,
    pub validator_index: u16,
    pub timestamp: u32,
    pub data: ByteString,
    pub script: Witness,
}

#[derive(Serialize)]
struct UnsignedPayload<'a> {
    version: u32,
    previous_hash: &'a Hash256,
    block_index: u32,
    validator_index: u16,
    timestamp: u32,
    data: &'a [u8],
}

impl ConsensusPayload {
    pub fn hash(&self) -> Hash256 {
        let unsigned = UnsignedPayload {
            version: self.version,
            previous_hash: &self.previous_hash,
            block_index: self.block_index,
            validator_index: self.validator_index,
            timestamp: self.timestamp,
            data: &self.data,
        };
        hash256(&serde_json::to_vec(&unsigned).unwrap_or_default())
    }
}

/// Short hex rendering of a hash for log fields
pub fn short_hex(hash: &[u8]) -> String {
    hex::encode(&hash[..hash.len().min(8)])
}
