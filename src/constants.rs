//! Ledger constants

/// Number of header hashes stored per persisted header hash list batch
pub const HEADER_HASH_LIST_BATCH_SIZE: usize = 2000;

/// Number of header hash list batches kept in the in-memory LRU
pub const HEADER_HASH_LIST_CACHE_SIZE: usize = 100;

/// Number of individual index -> hash lookups kept in front of the batches
pub const HEADER_INDEX_CACHE_SIZE: usize = 10_000;

/// Lower trim fraction used when averaging validator-count votes
pub const VALIDATOR_COUNT_TRIM_START: f64 = 0.25;

/// Upper trim fraction used when averaging validator-count votes
pub const VALIDATOR_COUNT_TRIM_END: f64 = 0.75;

/// One whole token in fixed-point (8 decimal) units
pub const FIXED8_ONE: i64 = 100_000_000;

/// Gas granted to read-only script invocations: 100 units
pub const INVOKE_SCRIPT_GAS: i64 = 100 * FIXED8_ONE;

/// Default upper bound on the gas shared by all witnesses of one item
pub const DEFAULT_MAX_VERIFICATION_GAS: i64 = 20 * FIXED8_ONE;

/// Committed blocks buffered for slow subscribers
pub const BLOCK_CHANNEL_CAPACITY: usize = 256;

/// Blocks a freshly registered asset stays valid for
pub const ASSET_EXPIRATION_BLOCKS: u32 = 2 * 2_000_000;

/// Nonce of the genesis miner transaction and consensus data of the genesis header
pub const GENESIS_NONCE: u32 = 2_083_236_893;

/// Governing token supply in whole units
pub const GOVERNING_TOKEN_SUPPLY: i64 = 100_000_000;

/// Entry point a contract must expose to verify witnesses on its behalf
pub const VERIFY_METHOD: &str = "verify";

// Opcodes used when building scripts
pub const OP_PUSH0: u8 = 0x00;
pub const OP_PUSHBYTES1: u8 = 0x01;
pub const OP_PUSHBYTES75: u8 = 0x4b;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHT: u8 = 0x51;
pub const OP_PUSH16: u8 = 0x60;
pub const OP_APPCALL: u8 = 0x67;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_PACK: u8 = 0xc1;
