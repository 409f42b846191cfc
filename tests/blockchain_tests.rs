//! Orchestrator tests: ordering, dedup, failures, stop/reset and queries

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use ledger_persist::constants::FIXED8_ONE;
use ledger_persist::script::signature_redeem_script;
use ledger_persist::*;

type Chain = Blockchain<MemoryStorage, MockVm>;

/// Let spawned persist calls reach the queue
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn chain() -> Chain {
    Blockchain::create(settings(), Arc::new(MemoryStorage::new()), MockVm::new()).await.unwrap()
}

/// Block 1 moving the genesis supply: 60M stay with the consensus address, 40M go to `[7; 20]`
fn split_block(settings: &Settings) -> (Block, Transaction) {
    let tx = transfer(
        settings,
        genesis_issue_input(settings),
        vec![
            governing(settings, 60_000_000, consensus(settings)),
            governing(settings, 40_000_000, [7; 20]),
        ],
    );
    let block = next_block(settings, &settings.genesis_block, vec![tx.clone()]);
    (block, tx)
}

#[tokio::test]
async fn test_create_seeds_genesis() {
    let chain = chain().await;
    let genesis = chain.settings().genesis_block.clone();

    assert_eq!(chain.current_block_index(), Some(0));
    assert_eq!(chain.current_block().unwrap(), genesis);
    assert_eq!(chain.current_header().unwrap(), genesis.header);
    assert!(chain.previous_block().is_none());
    assert_eq!(chain.try_get_block_by_index(0).unwrap(), Some(genesis.clone()));
    assert_eq!(chain.try_get_header_by_index(0).unwrap(), Some(genesis.header.clone()));
    assert_eq!(chain.try_get_block_by_index(1).unwrap(), None);
    assert_eq!(chain.storage().count(EntityKind::Block), 1);
}

#[tokio::test]
async fn test_genesis_without_allocations() {
    let settings = Settings::from_config(SettingsConfig {
        standby_validators: vec![key(1), key(2)],
        ..SettingsConfig::default()
    })
    .unwrap();
    let mut standby = settings.standby_validators.clone();
    standby.sort();

    let chain = Blockchain::create(settings, Arc::new(MemoryStorage::new()), MockVm::new()).await.unwrap();

    assert_eq!(chain.current_block_index(), Some(0));
    assert_eq!(chain.storage().count(EntityKind::Account), 0);
    assert_eq!(chain.storage().count(EntityKind::Validator), 0);
    assert_eq!(chain.get_validators(&[]).unwrap(), standby);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_slow_block_does_not_stall_runtime() {
    let chain = Blockchain::create(
        settings(),
        Arc::new(MemoryStorage::new()),
        MockVm::with_persist_delay(Duration::from_millis(500)),
    )
    .await
    .unwrap();
    let settings = chain.settings().clone();
    let block1 = next_block(&settings, &settings.genesis_block, vec![]);

    let timer = tokio::spawn(async {
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        start.elapsed()
    });
    chain.persist_block(block1, true).await.unwrap();

    let waited = timer.await.unwrap();
    assert!(waited < Duration::from_millis(250), "timer waited {:?}", waited);
    assert_eq!(chain.current_block_index(), Some(1));
}

#[tokio::test]
async fn test_verify_block_wraps_lookup_failures() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let orphan = transfer(&settings, Input { hash: [9; 32], index: 0 }, vec![]);
    let block = next_block(&settings, &settings.genesis_block, vec![orphan]);

    let err = chain.verify_block(&block).unwrap_err();
    assert!(matches!(err, LedgerError::UnknownVerify(_)), "unexpected {:?}", err);
}

#[tokio::test]
async fn test_blocks_apply_in_index_order() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let mut blocks = chain.subscribe();

    let block1 = next_block(&settings, &settings.genesis_block, vec![]);
    let block2 = next_block(&settings, &block1, vec![]);

    let early = {
        let chain = chain.clone();
        let block2 = block2.clone();
        tokio::spawn(async move { chain.persist_block(block2, false).await })
    };
    settle().await;
    assert_eq!(chain.current_block_index(), Some(0));

    chain.persist_block(block1.clone(), false).await.unwrap();
    early.await.unwrap().unwrap();

    assert_eq!(chain.current_block_index(), Some(2));
    assert_eq!(chain.previous_block(), Some(block1.clone()));
    assert_eq!(blocks.recv().await.unwrap(), block1);
    assert_eq!(blocks.recv().await.unwrap(), block2);
}

#[tokio::test]
async fn test_duplicate_block_resolves_immediately() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let block1 = next_block(&settings, &settings.genesis_block, vec![]);
    let block2 = next_block(&settings, &block1, vec![]);

    let queued = {
        let chain = chain.clone();
        let block2 = block2.clone();
        tokio::spawn(async move { chain.persist_block(block2, false).await })
    };
    settle().await;

    // block 2 is still waiting for block 1
    chain.persist_block(block2.clone(), false).await.unwrap();
    assert_eq!(chain.current_block_index(), Some(0));

    chain.persist_block(block1, false).await.unwrap();
    queued.await.unwrap().unwrap();
    assert_eq!(chain.current_block_index(), Some(2));
    assert_eq!(chain.storage().count(EntityKind::Block), 3);
}

#[tokio::test]
async fn test_already_applied_block_is_ignored() {
    let chain = chain().await;
    let genesis = chain.settings().genesis_block.clone();

    chain.persist_block(genesis, false).await.unwrap();
    assert_eq!(chain.current_block_index(), Some(0));
}

#[tokio::test]
async fn test_rejected_block_can_be_retried() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let block = next_block(&settings, &settings.genesis_block, vec![]);

    let mut unsigned = block.clone();
    unsigned.header.script.invocation = UNSIGNED.to_vec();
    let err = chain.persist_block(unsigned, false).await.unwrap_err();
    assert!(matches!(err, LedgerError::ScriptVerify(_)), "unexpected {:?}", err);
    assert_eq!(chain.current_block_index(), Some(0));

    let mut bad_root = block.clone();
    bad_root.header.merkle_root = [9; 32];
    let err = chain.persist_block(bad_root, false).await.unwrap_err();
    assert!(matches!(err, LedgerError::Verify(ref m) if m == "Invalid merkle root"));

    chain.persist_block(block, false).await.unwrap();
    assert_eq!(chain.current_block_index(), Some(1));
}

#[tokio::test]
async fn test_skip_verification_applies_unsigned_block() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let mut block = next_block(&settings, &settings.genesis_block, vec![]);
    block.header.script.invocation = UNSIGNED.to_vec();

    chain.persist_block(block, true).await.unwrap();
    assert_eq!(chain.current_block_index(), Some(1));
}

#[tokio::test]
async fn test_commit_failure_keeps_chain_head() {
    let storage = Arc::new(FlakyStorage::default());
    let chain = Blockchain::create(settings(), storage.clone(), MockVm::new()).await.unwrap();
    let settings = chain.settings().clone();
    let block = next_block(&settings, &settings.genesis_block, vec![]);

    storage.set_failing(true);
    let err = chain.persist_block(block.clone(), false).await.unwrap_err();
    assert!(matches!(err, LedgerError::Storage(_)));
    assert_eq!(chain.current_block_index(), Some(0));
    assert_eq!(storage.inner.count(EntityKind::Block), 1);

    storage.set_failing(false);
    chain.persist_block(block, false).await.unwrap();
    assert_eq!(chain.current_block_index(), Some(1));
    assert_eq!(storage.inner.count(EntityKind::Block), 2);
}

#[tokio::test]
async fn test_stopped_chain_rejects_blocks() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    chain.stop().await;

    let block = next_block(&settings, &settings.genesis_block, vec![]);
    let err = chain.persist_block(block, false).await.unwrap_err();
    assert!(matches!(err, LedgerError::Stopped));
    assert_eq!(chain.current_block_index(), Some(0));
}

#[tokio::test]
async fn test_reset_returns_to_genesis() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let block1 = next_block(&settings, &settings.genesis_block, vec![]);
    let block3 = next_block(&settings, &next_block(&settings, &block1, vec![]), vec![]);
    chain.persist_block(block1, false).await.unwrap();

    let waiting = {
        let chain = chain.clone();
        tokio::spawn(async move { chain.persist_block(block3, false).await })
    };
    settle().await;

    chain.reset().await.unwrap();
    assert!(matches!(waiting.await.unwrap(), Err(LedgerError::Stopped)));
    assert_eq!(chain.current_block_index(), Some(0));
    assert!(chain.previous_block().is_none());
    assert_eq!(chain.storage().count(EntityKind::Block), 1);
    assert_eq!(chain.try_get_block_by_index(1).unwrap(), None);
}

#[tokio::test]
async fn test_restart_restores_head_and_index() {
    let storage = Arc::new(MemoryStorage::new());
    let settings = settings();
    let block1 = next_block(&settings, &settings.genesis_block, vec![]);
    {
        let chain = Blockchain::create(settings.clone(), storage.clone(), MockVm::new()).await.unwrap();
        chain.persist_block(block1.clone(), false).await.unwrap();
        chain.stop().await;
    }

    let chain = Blockchain::create(settings.clone(), storage, MockVm::new()).await.unwrap();
    assert_eq!(chain.current_block_index(), Some(1));
    assert_eq!(chain.previous_block(), Some(settings.genesis_block.clone()));
    assert_eq!(chain.try_get_block_by_index(1).unwrap(), Some(block1.clone()));

    let block2 = next_block(&settings, &block1, vec![]);
    chain.persist_block(block2, false).await.unwrap();
    assert_eq!(chain.current_block_index(), Some(2));
}

#[tokio::test]
async fn test_coin_queries_after_transfer() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let (block, tx) = split_block(&settings);
    let genesis_coin = genesis_issue_input(&settings);

    assert!(!chain.is_spent(&genesis_coin).unwrap());
    assert_eq!(chain.get_unspent(&consensus(&settings)).unwrap(), vec![genesis_coin]);

    chain.verify_block(&block).unwrap();
    chain.persist_block(block, false).await.unwrap();

    assert!(chain.is_spent(&genesis_coin).unwrap());
    assert_eq!(chain.get_unspent(&consensus(&settings)).unwrap(), vec![tx.output_reference(0)]);
    assert_eq!(chain.get_unspent(&[7; 20]).unwrap(), vec![tx.output_reference(1)]);
    assert_eq!(chain.get_unclaimed(&consensus(&settings)).unwrap(), vec![genesis_coin]);
    assert!(chain.get_unclaimed(&[7; 20]).unwrap().is_empty());

    // generation of block 0 plus the genesis system fees: two registers and one issue
    let claim = chain.calculate_claim_amount(&[genesis_coin]).unwrap();
    assert_eq!(claim, 8 * FIXED8_ONE + 20_500 * FIXED8_ONE);

    let err = chain.calculate_claim_amount(&[tx.output_reference(0)]).unwrap_err();
    assert!(matches!(err, LedgerError::CoinUnspent));
}

#[tokio::test]
async fn test_verify_transaction() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let (block, tx) = split_block(&settings);
    chain.persist_block(block, false).await.unwrap();

    let spend = transfer(&settings, tx.output_reference(0), vec![governing(&settings, 60_000_000, [8; 20])]);
    let verification = chain.verify_transaction(&spend, &[]).unwrap();
    assert!(verification.is_verified());
    assert_eq!(verification.results.len(), 1);
    assert_eq!(verification.results[0].hash, consensus(&settings));

    let mut unsigned = spend.clone();
    unsigned.scripts[0].invocation = UNSIGNED.to_vec();
    assert!(!chain.verify_transaction(&unsigned, &[]).unwrap().is_verified());

    let rival = transfer(&settings, tx.output_reference(0), vec![governing(&settings, 60_000_000, [9; 20])]);
    let err = chain.verify_transaction(&spend, &[rival]).unwrap_err();
    assert!(matches!(err, LedgerError::Verify(ref m) if m == "Input already exists in mempool"));

    let double = transfer(&settings, genesis_issue_input(&settings), vec![governing(&settings, 1, [8; 20])]);
    let err = chain.verify_transaction(&double, &[]).unwrap_err();
    assert!(matches!(err, LedgerError::Verify(ref m) if m == "Transaction is a double spend"));

    let missing = transfer(&settings, Input { hash: [9; 32], index: 0 }, vec![]);
    let err = chain.verify_transaction(&missing, &[]).unwrap_err();
    assert!(matches!(err, LedgerError::UnknownVerify(_)), "unexpected {:?}", err);
}

#[tokio::test]
async fn test_verify_consensus_payload() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let payload = ConsensusPayload {
        version: 0,
        previous_hash: settings.genesis_block.hash(),
        block_index: 1,
        validator_index: 0,
        timestamp: 0,
        data: b"prepare".to_vec(),
        script: Witness { invocation: SIGNED.to_vec(), verification: signature_redeem_script(&key(1)) },
    };
    chain.verify_consensus_payload(&payload).unwrap();

    let mut stale = payload.clone();
    stale.block_index = 0;
    assert!(matches!(chain.verify_consensus_payload(&stale), Err(LedgerError::Verify(_))));

    let mut unknown = payload.clone();
    unknown.validator_index = 1;
    assert!(matches!(
        chain.verify_consensus_payload(&unknown),
        Err(LedgerError::Verify(ref m)) if m == "Invalid validator index 1"
    ));

    let mut wrong_key = payload;
    wrong_key.script.verification = signature_redeem_script(&key(2));
    assert!(matches!(chain.verify_consensus_payload(&wrong_key), Err(LedgerError::WitnessVerify)));
}

#[tokio::test]
async fn test_invoke_script_does_not_commit() {
    let chain = chain().await;

    let receipt = chain.invoke_script(b"put:k=v;log:hello".to_vec()).unwrap();
    assert!(receipt.result.is_success());
    assert_eq!(receipt.actions.len(), 1);
    assert_eq!(receipt.actions[0].block_index, 0);
    assert_eq!(chain.storage().count(EntityKind::StorageItem), 0);

    let faulted = chain.invoke_script(b"fault".to_vec()).unwrap();
    assert!(!faulted.result.is_success());

    assert!(matches!(chain.invoke_script(b"error".to_vec()), Err(LedgerError::Vm(_))));

    let contract_tx = Transaction::new(TransactionKind::Contract);
    assert!(matches!(chain.invoke_transaction(&contract_tx), Err(LedgerError::Verify(_))));
    assert!(chain.invoke_transaction(&invocation("notify")).unwrap().result.is_success());
}

#[tokio::test]
async fn test_invocation_data_query() {
    let chain = chain().await;
    let settings = chain.settings().clone();
    let tx = invocation("put:k=v;log:hello;notify");
    let block = next_block(&settings, &settings.genesis_block, vec![tx.clone()]);
    chain.persist_block(block, false).await.unwrap();

    let (data, actions) = chain.try_get_invocation_data(&tx.hash()).unwrap().unwrap();
    assert!(data.result.is_success());
    assert_eq!(data.transaction_index, 1);
    assert_eq!((data.action_index_start, data.action_index_stop), (0, 2));
    assert_eq!(actions.iter().map(|action| action.index).collect::<Vec<_>>(), vec![0, 1]);
    assert!(chain.try_get_invocation_data(&[3; 32]).unwrap().is_none());
}
