//! Chain settings and genesis block construction

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::script::{consensus_address, hash160};
use crate::types::*;

/// Serializable chain description, typically loaded from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub standby_validators: Vec<ValidatorKey>,
    pub address_version: u8,
    pub message_magic: u32,
    pub seconds_per_block: u32,
    /// Blocks per generation step
    pub decrement_interval: u32,
    /// Utility tokens generated per block, in whole units, for each step
    pub generation_amount: Vec<i64>,
    /// System fee per transaction type, fixed-point
    pub fees: BTreeMap<TransactionType, Fixed8>,
    pub register_validator_fee: Fixed8,
    pub max_verification_gas: Fixed8,
    pub genesis_timestamp: u64,
    /// Issue the whole governing token supply to the standby validators in genesis
    pub issue_governing_token: bool,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        SettingsConfig {
            standby_validators: Vec::new(),
            address_version: 23,
            message_magic: 7_630_401,
            seconds_per_block: 15,
            decrement_interval: 2_000_000,
            generation_amount: vec![8, 7, 6, 5, 4, 3, 2, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1],
            fees: BTreeMap::from([
                (TransactionType::Enrollment, 1000 * FIXED8_ONE),
                (TransactionType::Issue, 500 * FIXED8_ONE),
                (TransactionType::Publish, 500 * FIXED8_ONE),
                (TransactionType::Register, 10_000 * FIXED8_ONE),
            ]),
            register_validator_fee: 1000 * FIXED8_ONE,
            max_verification_gas: DEFAULT_MAX_VERIFICATION_GAS,
            genesis_timestamp: 1_468_595_301,
            issue_governing_token: false,
        }
    }
}

/// Settings consumed by the ledger core
#[derive(Debug, Clone)]
pub struct Settings {
    pub genesis_block: Block,
    pub governing_token: Hash256,
    pub utility_token: Hash256,
    pub standby_validators: Vec<ValidatorKey>,
    pub address_version: u8,
    pub message_magic: u32,
    pub seconds_per_block: u32,
    pub decrement_interval: u32,
    pub generation_amount: Vec<i64>,
    pub fees: BTreeMap<TransactionType, Fixed8>,
    pub register_validator_fee: Fixed8,
    pub max_verification_gas: Fixed8,
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SettingsConfig =
            serde_json::from_str(json).map_err(|e| LedgerError::Settings(e.to_string()))?;
        Self::from_config(config)
    }

    /// Derive settings and the genesis block from `config`
    ///
    /// Genesis carries, in order: the miner transaction, the governing and
    /// utility token registrations and, when enabled, an issue of the whole
    /// governing supply to the standby validators' consensus address.
    pub fn from_config(config: SettingsConfig) -> Result<Self> {
        if config.standby_validators.is_empty() {
            return Err(LedgerError::Settings("at least one standby validator is required".into()));
        }
        if config.decrement_interval == 0 {
            return Err(LedgerError::Settings("decrement interval must be positive".into()));
        }

        let system_admin = hash160(&[OP_PUSHT]);
        let system_witness = Witness { invocation: Vec::new(), verification: vec![OP_PUSHT] };

        let governing = Transaction::new(TransactionKind::Register {
            asset: AssetRegistration {
                asset_type: AssetType::GoverningToken,
                name: "NEO".to_string(),
                amount: GOVERNING_TOKEN_SUPPLY * FIXED8_ONE,
                precision: 0,
                owner: None,
                admin: system_admin,
            },
        });
        let utility_amount = config
            .generation_amount
            .iter()
            .try_fold(0i64, |total, amount| total.checked_add(*amount))
            .and_then(|total| total.checked_mul(i64::from(config.decrement_interval)))
            .and_then(|total| total.checked_mul(FIXED8_ONE))
            .ok_or_else(|| LedgerError::Settings("utility token supply overflows Fixed8".into()))?;
        let utility = Transaction::new(TransactionKind::Register {
            asset: AssetRegistration {
                asset_type: AssetType::UtilityToken,
                name: "NeoGas".to_string(),
                amount: utility_amount,
                precision: 8,
                owner: None,
                admin: hash160(&[OP_PUSHT + 1]),
            },
        });
        let governing_token = governing.hash();
        let utility_token = utility.hash();
        let next_consensus = consensus_address(&config.standby_validators);

        let mut transactions = vec![
            Transaction::new(TransactionKind::Miner { nonce: GENESIS_NONCE }),
            governing,
            utility,
        ];
        if config.issue_governing_token {
            let mut issue = Transaction::new(TransactionKind::Issue);
            issue.outputs.push(Output {
                asset: governing_token,
                value: GOVERNING_TOKEN_SUPPLY * FIXED8_ONE,
                address: next_consensus,
            });
            issue.scripts.push(system_witness.clone());
            transactions.push(issue);
        }

        let mut genesis_block = Block {
            header: Header {
                version: 0,
                previous_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                timestamp: config.genesis_timestamp,
                index: 0,
                consensus_data: u64::from(GENESIS_NONCE),
                next_consensus,
                script: system_witness,
            },
            transactions,
        };
        genesis_block.header.merkle_root = genesis_block.compute_merkle_root();

        Ok(Settings {
            genesis_block,
            governing_token,
            utility_token,
            standby_validators: config.standby_validators,
            address_version: config.address_version,
            message_magic: config.message_magic,
            seconds_per_block: config.seconds_per_block,
            decrement_interval: config.decrement_interval,
            generation_amount: config.generation_amount,
            fees: config.fees,
            register_validator_fee: config.register_validator_fee,
            max_verification_gas: config.max_verification_gas,
        })
    }

    /// Total governing token supply, fixed-point
    pub fn governing_token_amount(&self) -> Fixed8 {
        GOVERNING_TOKEN_SUPPLY * FIXED8_ONE
    }

    pub fn fee(&self, transaction_type: TransactionType) -> Fixed8 {
        self.fees.get(&transaction_type).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    #[test]
    fn test_from_json_with_defaults() {
        let json = format!(
            r#"{{"standby_validators": ["{}"], "fees": {{"Issue": 7}}, "issue_governing_token": true}}"#,
            KEY
        );
        let settings = Settings::from_json(&json).unwrap();
        assert_eq!(settings.fee(TransactionType::Issue), 7);
        assert_eq!(settings.fee(TransactionType::Contract), 0);
        assert_eq!(settings.decrement_interval, 2_000_000);
        assert_eq!(settings.genesis_block.transactions.len(), 4);
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let config = SettingsConfig {
            standby_validators: vec![ValidatorKey::from_hex(KEY).unwrap()],
            ..SettingsConfig::default()
        };
        let a = Settings::from_config(config.clone()).unwrap();
        let b = Settings::from_config(config).unwrap();
        assert_eq!(a.genesis_block.hash(), b.genesis_block.hash());
        assert_eq!(a.genesis_block.index(), 0);
        assert_eq!(a.genesis_block.header.merkle_root, a.genesis_block.compute_merkle_root());
        assert_ne!(a.governing_token, a.utility_token);
        assert_eq!(
            a.genesis_block.header.next_consensus,
            consensus_address(&a.standby_validators)
        );
    }

    #[test]
    fn test_rejects_missing_validators() {
        let err = Settings::from_config(SettingsConfig::default()).unwrap_err();
        assert!(matches!(err, LedgerError::Settings(_)));
        assert!(Settings::from_json("{not json").is_err());
    }

    #[test]
    fn test_rejects_oversized_utility_supply() {
        let config = SettingsConfig {
            standby_validators: vec![ValidatorKey::from_hex(KEY).unwrap()],
            generation_amount: vec![i64::MAX / 2_000_000],
            ..SettingsConfig::default()
        };
        let err = Settings::from_config(config).unwrap_err();
        assert!(matches!(err, LedgerError::Settings(ref m) if m.contains("overflows")));

        let config = SettingsConfig {
            standby_validators: vec![ValidatorKey::from_hex(KEY).unwrap()],
            generation_amount: vec![i64::MAX, 1],
            ..SettingsConfig::default()
        };
        assert!(Settings::from_config(config).is_err());
    }
}
