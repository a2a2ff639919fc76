#![recursion_limit = "256"]

use fixtures::*;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy::primitives::{U256, keccak256};
use engine_core::{
    error::EngineError,
    signer::{AccountSigner, EoaAccount},
    transaction::{FeeParams, UnsignedTransaction},
};
use engine_executors::{
    events::{LifecycleEvent, LifecycleListener, spawn_listener},
    queue::{
        ProcessOutcome,
        worker::{QueueWorkerPool, WorkerPoolConfig},
    },
    store::{ExecutorStore, PreparedAttempt, TransactionStatus},
};

#[tokio::test]
async fn idempotency_key_returns_existing_transaction() {
    let h = harness();
    let wallet = local_wallet(1);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();

    let first = h
        .queue
        .enqueue(transfer(wallet.address(), 1), Some("abc".to_string()))
        .await
        .unwrap();
    // Different amount, same key
    let second = h
        .queue
        .enqueue(transfer(wallet.address(), 2), Some("abc".to_string()))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.store.transaction_count(), 1);

    let record = h.queue.get_status(&first).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Queued);
    assert_eq!(record.chain_id, CHAIN_ID);
    assert_eq!(record.value, U256::from(1));
}

#[tokio::test]
async fn enqueue_rejects_unknown_chain_and_wallet() {
    let h = harness();
    let wallet = local_wallet(1);

    let err = h
        .queue
        .enqueue(transfer(wallet.address(), 1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WalletConfigError { .. }));

    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();
    let mut request = transfer(wallet.address(), 1);
    request.chain_id = 1;
    let err = h.queue.enqueue(request, None).await.unwrap_err();
    assert!(matches!(err, EngineError::ValidationError { .. }));

    assert_eq!(h.store.transaction_count(), 0);
}

#[tokio::test]
async fn process_signs_and_sends_with_chain_nonce() {
    let h = harness();
    let wallet = local_wallet(2);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();
    h.chain.set_counts(wallet.address(), 5, 5);

    let first = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
    let second = h.queue.enqueue(transfer(wallet.address(), 2), None).await.unwrap();

    let ProcessOutcome::Sent { transaction_hash } = h.queue.process(&first).await.unwrap() else {
        panic!("expected first transaction to be sent");
    };
    assert!(matches!(
        h.queue.process(&second).await.unwrap(),
        ProcessOutcome::Sent { .. }
    ));

    let sent = h.chain.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(keccak256(&sent[0]), transaction_hash);

    let record = h.queue.get_status(&first).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.nonce, Some(5));
    assert_eq!(record.sent_transaction_hashes, vec![transaction_hash]);
    assert_eq!(record.gas_limit, Some(21_000));
    assert_eq!(
        record.fees,
        Some(FeeParams::Eip1559 {
            max_fee_per_gas: 30_000_000_000,
            max_priority_fee_per_gas: 2_000_000_000,
        })
    );
    assert_eq!(record.sent_at_block, Some(100));
    assert!(record.prepared_attempt.is_none());

    let record = h.queue.get_status(&second).await.unwrap().unwrap();
    assert_eq!(record.nonce, Some(6));
    // Seeded from the chain once, then counted locally
    assert_eq!(h.chain.count_reads(), 1);

    // Processing again is a no-op
    assert_eq!(h.queue.process(&first).await.unwrap(), ProcessOutcome::Skipped);
    assert_eq!(h.chain.sent().len(), 2);
}

#[tokio::test]
async fn legacy_chain_uses_gas_price() {
    let h = harness();
    let wallet = local_wallet(3);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();
    h.chain.set_eip1559(None);

    let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
    h.queue.process(&id).await.unwrap();

    let record = h.queue.get_status(&id).await.unwrap().unwrap();
    assert_eq!(
        record.fees,
        Some(FeeParams::Legacy {
            gas_price: 20_000_000_000
        })
    );
}

#[tokio::test]
async fn cancel_only_applies_to_queued_transactions() {
    let h = harness();
    let wallet = local_wallet(4);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();

    let queued = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
    let cancelled = h.queue.cancel(&queued).await.unwrap();
    assert_eq!(cancelled.status, TransactionStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    // A cancelled record is never sent
    assert_eq!(h.queue.process(&queued).await.unwrap(), ProcessOutcome::Skipped);
    assert!(h.chain.sent().is_empty());

    let err = h.queue.cancel(&queued).await.unwrap_err();
    assert!(matches!(err, EngineError::ValidationError { .. }));

    let sent = h.queue.enqueue(transfer(wallet.address(), 2), None).await.unwrap();
    h.queue.process(&sent).await.unwrap();
    let err = h.queue.cancel(&sent).await.unwrap_err();
    assert!(matches!(err, EngineError::ValidationError { .. }));
    assert_eq!(
        h.queue.get_status(&sent).await.unwrap().unwrap().status,
        TransactionStatus::Sent
    );

    let err = h.queue.cancel("does-not-exist").await.unwrap_err();
    assert!(matches!(err, EngineError::ValidationError { .. }));
}

#[tokio::test]
async fn rejected_send_records_provider_message_and_frees_nonce() {
    let h = harness();
    let wallet = local_wallet(5);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();
    h.chain.set_counts(wallet.address(), 3, 3);
    h.chain
        .push_send_error(rpc_error(-32000, "insufficient funds for gas * price + value"));

    let failed = h
        .queue
        .enqueue(transfer(wallet.address(), 1), Some("pay-1".to_string()))
        .await
        .unwrap();
    assert_eq!(h.queue.process(&failed).await.unwrap(), ProcessOutcome::Errored);

    let record = h.queue.get_status(&failed).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Errored);
    assert_eq!(
        record.error_message.as_deref(),
        Some("insufficient funds for gas * price + value")
    );
    assert!(record.errored_at.is_some());
    assert!(record.nonce.is_none());

    // The key is free again and the nonce is reused
    let retried = h
        .queue
        .enqueue(transfer(wallet.address(), 1), Some("pay-1".to_string()))
        .await
        .unwrap();
    assert_ne!(retried, failed);
    h.queue.process(&retried).await.unwrap();
    let record = h.queue.get_status(&retried).await.unwrap().unwrap();
    assert_eq!(record.nonce, Some(3));
}

#[tokio::test]
async fn transient_broadcast_failures_are_retried() {
    let h = harness();
    let wallet = local_wallet(6);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();
    h.chain.push_send_error(http_error(503));
    h.chain.push_send_error(rpc_error(-32005, "request rate exceeded"));

    let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
    assert!(matches!(
        h.queue.process(&id).await.unwrap(),
        ProcessOutcome::Sent { .. }
    ));
    assert_eq!(h.chain.sent().len(), 1);
}

#[tokio::test]
async fn persistence_failure_keeps_transaction_queued() {
    let h = harness();
    let wallet = local_wallet(7);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();
    h.chain.set_counts(wallet.address(), 7, 7);

    let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();

    h.store.set_fail_updates(true);
    let err = h.queue.process(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::PersistenceError { .. }));
    assert!(h.chain.sent().is_empty());
    h.store.set_fail_updates(false);

    let record = h.queue.get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Queued);
    assert!(record.prepared_attempt.is_none());

    // The nonce taken by the failed attempt was handed back
    h.queue.process(&id).await.unwrap();
    let record = h.queue.get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.nonce, Some(7));
}

#[tokio::test]
async fn nonce_too_low_resyncs_from_chain() {
    let h = harness();
    let wallet = local_wallet(8);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();

    let first = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
    h.queue.process(&first).await.unwrap();

    // Someone else used the wallet outside the engine
    h.chain.set_counts(wallet.address(), 5, 5);
    h.chain.push_send_error(rpc_error(-32000, "nonce too low"));

    let second = h.queue.enqueue(transfer(wallet.address(), 2), None).await.unwrap();
    assert!(matches!(
        h.queue.process(&second).await.unwrap(),
        ProcessOutcome::Sent { .. }
    ));

    let record = h.queue.get_status(&second).await.unwrap().unwrap();
    assert_eq!(record.nonce, Some(5));
    assert_eq!(record.sent_transaction_hashes.len(), 1);
    assert_eq!(h.chain.count_reads(), 2);
}

/// Builds the attempt a previous process would have persisted before it
/// stopped between preparing and broadcasting.
async fn persist_prepared_attempt(h: &Harness, wallet: &TestWallet, id: &str, nonce: u64) -> PreparedAttempt {
    let mut record = h.queue.get_status(id).await.unwrap().unwrap();
    let fees = FeeParams::Eip1559 {
        max_fee_per_gas: 30_000_000_000,
        max_priority_fee_per_gas: 2_000_000_000,
    };
    let signed = EoaAccount::Local(wallet.signer.clone())
        .sign_transaction(UnsignedTransaction {
            chain_id: CHAIN_ID,
            nonce,
            to: record.to_address,
            value: record.value,
            input: record.data.clone(),
            gas_limit: 21_000,
            fees,
        })
        .await
        .unwrap();

    let attempt = PreparedAttempt {
        nonce,
        transaction_hash: signed.hash,
        raw: signed.raw,
        gas_limit: 21_000,
        fees,
    };
    record.prepared_attempt = Some(attempt.clone());
    h.store
        .update_transaction(&record, TransactionStatus::Queued)
        .await
        .unwrap();
    attempt
}

#[tokio::test]
async fn prepared_attempt_is_rebroadcast_after_restart() {
    let h = harness();
    let wallet = local_wallet(9);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();

    let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
    let attempt = persist_prepared_attempt(&h, &wallet, &id, 4).await;

    // The node already has it from before the restart
    h.chain.push_send_error(rpc_error(-32000, "already known"));

    let outcome = h.queue.process(&id).await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Sent {
            transaction_hash: attempt.transaction_hash
        }
    );

    let record = h.queue.get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.nonce, Some(4));
    assert_eq!(record.sent_transaction_hashes, vec![attempt.transaction_hash]);
    // No new nonce was drawn
    assert_eq!(h.chain.count_reads(), 0);
}

#[tokio::test]
async fn prepared_attempt_already_mined_is_not_resent_with_new_nonce() {
    let h = harness();
    let wallet = local_wallet(10);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();

    let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
    let attempt = persist_prepared_attempt(&h, &wallet, &id, 0).await;
    h.chain.mine(attempt.transaction_hash, 101, true);
    h.chain.set_counts(wallet.address(), 1, 1);
    h.chain.push_send_error(rpc_error(-32000, "nonce too low"));

    h.queue.process(&id).await.unwrap();

    let record = h.queue.get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.nonce, Some(0));
    assert!(h.chain.sent().is_empty());
}

#[tokio::test]
async fn receipt_lookup_failure_keeps_prepared_attempt() {
    let h = harness();
    let wallet = local_wallet(40);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();

    let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
    let attempt = persist_prepared_attempt(&h, &wallet, &id, 0).await;
    h.chain.mine(attempt.transaction_hash, 101, true);
    h.chain.set_counts(wallet.address(), 1, 1);
    h.chain.push_send_error(rpc_error(-32000, "nonce too low"));
    h.chain.set_fail_receipts(true);

    let err = h.queue.process(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::RpcError { .. }));

    // Nothing was given up on: no fresh nonce, no resync, attempt intact
    let record = h.queue.get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Queued);
    assert_eq!(record.prepared_attempt, Some(attempt.clone()));
    assert_eq!(record.nonce, None);
    assert_eq!(h.chain.count_reads(), 0);
    assert!(h.chain.sent().is_empty());

    h.chain.set_fail_receipts(false);
    h.chain.push_send_error(rpc_error(-32000, "nonce too low"));
    assert_eq!(
        h.queue.process(&id).await.unwrap(),
        ProcessOutcome::Sent {
            transaction_hash: attempt.transaction_hash
        }
    );

    let record = h.queue.get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Sent);
    assert_eq!(record.nonce, Some(0));
    assert_eq!(record.sent_transaction_hashes, vec![attempt.transaction_hash]);
    assert_eq!(h.chain.count_reads(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_process_never_cancels_a_broadcast() {
    let h = harness();

    for seed in 41..=56 {
        let wallet = local_wallet(seed);
        h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();
        let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
        let sent_before = h.chain.sent().len();

        let cancel = {
            let queue = h.queue.clone();
            let id = id.clone();
            tokio::spawn(async move { queue.cancel(&id).await })
        };
        let process = {
            let queue = h.queue.clone();
            let id = id.clone();
            tokio::spawn(async move { queue.process(&id).await })
        };
        let cancelled = cancel.await.unwrap();
        let processed = process.await.unwrap().unwrap();

        let broadcasts = h.chain.sent().len() - sent_before;
        let record = h.queue.get_status(&id).await.unwrap().unwrap();
        match cancelled {
            Ok(_) => {
                assert_eq!(record.status, TransactionStatus::Cancelled);
                assert_eq!(processed, ProcessOutcome::Skipped);
                assert_eq!(broadcasts, 0);
                assert!(record.sent_transaction_hashes.is_empty());
            }
            Err(e) => {
                assert!(matches!(e, EngineError::ValidationError { .. }));
                assert_eq!(record.status, TransactionStatus::Sent);
                assert!(matches!(processed, ProcessOutcome::Sent { .. }));
                assert_eq!(broadcasts, 1);
                assert!(record.cancelled_at.is_none());
            }
        }
    }
}

#[tokio::test]
async fn contract_account_routes_through_execute() {
    let h = harness();
    let admin = local_wallet(11);
    let account = contract_account(&admin);
    h.queue.register_wallet(account.clone()).await.unwrap();

    let id = h.queue.enqueue(transfer(account.address, 1_000), None).await.unwrap();
    let record = h.queue.get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.from_address, admin.address());
    assert_eq!(record.account_address, Some(account.address));
    assert_eq!(record.signer_address, Some(admin.address()));

    assert!(matches!(
        h.queue.process(&id).await.unwrap(),
        ProcessOutcome::Sent { .. }
    ));

    let estimate = h.chain.state.lock().unwrap().estimate_calls[0].clone();
    assert_eq!(estimate.from, admin.address());
    assert_eq!(estimate.to, Some(account.address));
    assert_eq!(estimate.value, U256::ZERO);
    assert!(!estimate.data.is_empty());
}

#[tokio::test]
async fn wait_for_terminal_returns_latest_state() {
    let h = harness();
    let wallet = local_wallet(12);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();

    let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();

    let record = h
        .queue
        .wait_for_terminal(&id, Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(record.status, TransactionStatus::Queued);

    let ProcessOutcome::Sent { transaction_hash } = h.queue.process(&id).await.unwrap() else {
        panic!("expected send");
    };

    let queue = h.queue.clone();
    let chain = h.chain.clone();
    let confirm_id = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        chain.mine(transaction_hash, 101, true);
        queue.check_confirmation(&confirm_id).await.unwrap();
    });

    let record = h
        .queue
        .wait_for_terminal(&id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(record.status, TransactionStatus::Mined);
    assert_eq!(record.transaction_hash, Some(transaction_hash));
    assert_eq!(record.mined_at_block, Some(101));
}

#[derive(Clone, Default)]
struct RecordingListener {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl LifecycleListener for RecordingListener {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn on_event(&self, event: &LifecycleEvent) -> Result<(), EngineError> {
        self.events.lock().unwrap().push(event.clone());
        if event.new_status == TransactionStatus::Sent {
            return Err(EngineError::DeliveryError {
                message: "webhook endpoint returned 500".to_string(),
            });
        }
        Ok(())
    }
}

#[tokio::test]
async fn listeners_see_every_transition_and_cannot_affect_it() {
    let h = harness();
    let wallet = local_wallet(13);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();

    let listener = RecordingListener::default();
    let handle = spawn_listener(h.queue.events(), listener.clone());

    let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();
    h.queue.process(&id).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while listener.events.lock().unwrap().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "events not delivered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let transitions: Vec<_> = listener
        .events
        .lock()
        .unwrap()
        .iter()
        .map(|e| (e.previous_status, e.new_status))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (None, TransactionStatus::Queued),
            (Some(TransactionStatus::Queued), TransactionStatus::Sent),
        ]
    );

    // A failing delivery leaves the record untouched
    assert_eq!(
        h.queue.get_status(&id).await.unwrap().unwrap().status,
        TransactionStatus::Sent
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn worker_pool_sends_each_wallet_in_order() {
    let h = harness();
    let alice = local_wallet(14);
    let bob = local_wallet(15);
    h.queue.register_wallet(alice.descriptor.clone()).await.unwrap();
    h.queue.register_wallet(bob.descriptor.clone()).await.unwrap();
    h.chain.set_counts(bob.address(), 10, 10);

    let mut alice_ids = vec![];
    let mut bob_ids = vec![];
    for amount in 0..3 {
        alice_ids.push(h.queue.enqueue(transfer(alice.address(), amount), None).await.unwrap());
        bob_ids.push(h.queue.enqueue(transfer(bob.address(), amount), None).await.unwrap());
    }

    let pool = QueueWorkerPool::new(h.queue.clone(), WorkerPoolConfig::default());
    pool.run_once().await.unwrap();

    for (ids, first_nonce) in [(alice_ids, 0u64), (bob_ids, 10u64)] {
        for (offset, id) in ids.iter().enumerate() {
            let record = h.queue.get_status(id).await.unwrap().unwrap();
            assert_eq!(record.status, TransactionStatus::Sent);
            assert_eq!(record.nonce, Some(first_nonce + offset as u64));
        }
    }
}

#[tokio::test]
async fn started_worker_pool_picks_up_new_transactions() {
    let h = harness();
    let wallet = local_wallet(16);
    h.queue.register_wallet(wallet.descriptor.clone()).await.unwrap();

    let handle = QueueWorkerPool::new(
        h.queue.clone(),
        WorkerPoolConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        },
    )
    .start();

    let id = h.queue.enqueue(transfer(wallet.address(), 1), None).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = h.queue.get_status(&id).await.unwrap().unwrap();
        if record.status == TransactionStatus::Sent {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "transaction never sent");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    handle.shutdown().await.unwrap();
}
