#![recursion_limit = "256"]

use fixtures::*;

use std::{collections::BTreeSet, sync::Arc};

use alloy::primitives::Address;
use engine_executors::{
    nonce_manager::NonceManager,
    store::{ExecutorStore, InMemoryExecutorStore, NonceRecord, WalletKey},
};

fn key(address: Address) -> WalletKey {
    WalletKey {
        chain_id: CHAIN_ID,
        address,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_issuance_has_no_gaps_or_duplicates() {
    let store = Arc::new(InMemoryExecutorStore::new());
    let nonces = Arc::new(NonceManager::new(store.clone()));
    let chain = MockChain::new(CHAIN_ID);
    let wallet = Address::repeat_byte(0x11);
    chain.set_counts(wallet, 40, 42);

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let nonces = nonces.clone();
            let chain = chain.clone();
            tokio::spawn(async move { nonces.next_nonce(&chain, wallet).await.unwrap() })
        })
        .collect();

    let mut issued = BTreeSet::new();
    for task in tasks {
        assert!(issued.insert(task.await.unwrap()), "duplicate nonce");
    }

    // Seeded from the pending count, then contiguous
    assert_eq!(issued, (42..92).collect::<BTreeSet<u64>>());
    assert_eq!(chain.count_reads(), 1);

    let record = store.get_nonce_record(key(wallet)).await.unwrap().unwrap();
    assert_eq!(record.last_issued_nonce, Some(91));
}

#[tokio::test]
async fn wallets_have_independent_sequences() {
    let store = Arc::new(InMemoryExecutorStore::new());
    let nonces = NonceManager::new(store);
    let chain = MockChain::new(CHAIN_ID);
    let a = Address::repeat_byte(0x0a);
    let b = Address::repeat_byte(0x0b);
    chain.set_counts(b, 7, 7);

    assert_eq!(nonces.next_nonce(&chain, a).await.unwrap(), 0);
    assert_eq!(nonces.next_nonce(&chain, b).await.unwrap(), 7);
    assert_eq!(nonces.next_nonce(&chain, a).await.unwrap(), 1);
    assert_eq!(nonces.next_nonce(&chain, b).await.unwrap(), 8);
}

#[tokio::test]
async fn only_the_latest_nonce_can_be_released() {
    let store = Arc::new(InMemoryExecutorStore::new());
    let nonces = NonceManager::new(store);
    let chain = MockChain::new(CHAIN_ID);
    let wallet = Address::repeat_byte(0x22);
    chain.set_counts(wallet, 3, 3);

    let mut lock = nonces.lock(key(wallet)).await;
    assert_eq!(lock.next_nonce(&chain).await.unwrap(), 3);
    assert_eq!(lock.next_nonce(&chain).await.unwrap(), 4);

    // Releasing 3 would leave 4 orphaned behind a gap
    assert!(!lock.release(3).await);
    assert!(lock.release(4).await);
    assert_eq!(lock.last_issued(), Some(3));
    assert_eq!(lock.next_nonce(&chain).await.unwrap(), 4);
}

#[tokio::test]
async fn resync_rereads_the_chain() {
    let store = Arc::new(InMemoryExecutorStore::new());
    let nonces = NonceManager::new(store.clone());
    let chain = MockChain::new(CHAIN_ID);
    let wallet = Address::repeat_byte(0x33);

    let mut lock = nonces.lock(key(wallet)).await;
    assert_eq!(lock.next_nonce(&chain).await.unwrap(), 0);

    chain.set_counts(wallet, 12, 12);
    lock.resync().await;
    assert_eq!(lock.last_issued(), None);
    assert_eq!(
        store
            .get_nonce_record(key(wallet))
            .await
            .unwrap()
            .unwrap()
            .last_issued_nonce,
        None
    );

    assert_eq!(lock.next_nonce(&chain).await.unwrap(), 12);
    assert_eq!(chain.count_reads(), 2);
}

#[tokio::test]
async fn failed_persist_does_not_advance_counter() {
    let store = Arc::new(InMemoryExecutorStore::new());
    let nonces = NonceManager::new(store.clone());
    let chain = MockChain::new(CHAIN_ID);
    let wallet = Address::repeat_byte(0x44);

    let mut lock = nonces.lock(key(wallet)).await;
    assert_eq!(lock.next_nonce(&chain).await.unwrap(), 0);

    store.set_unavailable(true);
    assert!(lock.next_nonce(&chain).await.is_err());
    store.set_unavailable(false);

    assert_eq!(lock.last_issued(), Some(0));
    assert_eq!(lock.next_nonce(&chain).await.unwrap(), 1);
}

#[tokio::test]
async fn restart_continues_after_persisted_nonce() {
    let store = Arc::new(InMemoryExecutorStore::new());
    let chain = MockChain::new(CHAIN_ID);
    let behind = Address::repeat_byte(0x55);
    let ahead = Address::repeat_byte(0x56);
    for wallet in [behind, ahead] {
        store
            .save_nonce_record(&NonceRecord {
                chain_id: CHAIN_ID,
                wallet_address: wallet,
                last_issued_nonce: Some(9),
            })
            .await
            .unwrap();
    }
    // Nonces 5..=9 were signed but never reached the mempool
    chain.set_counts(behind, 5, 5);
    chain.set_counts(ahead, 20, 20);

    let nonces = NonceManager::new(store.clone());
    assert_eq!(nonces.next_nonce(&chain, behind).await.unwrap(), 10);
    assert_eq!(nonces.next_nonce(&chain, ahead).await.unwrap(), 20);
    assert_eq!(nonces.next_nonce(&chain, behind).await.unwrap(), 11);
}
