/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Enqueue semantics: commit gating, rollback, deduplication.

use crate::fixtures::{build_outbox, wait_for, CountingTarget, RecordingListener};
use outpost::{Instantiator, InvocationArg, OutboxError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn counter_instantiator() -> (Instantiator, Arc<CountingTarget>) {
    let target = Arc::new(CountingTarget::default());
    let mut instantiator = Instantiator::new();
    instantiator.register("counter", target.clone());
    (instantiator, target)
}

#[tokio::test]
async fn test_committed_entry_is_delivered() {
    let (instantiator, target) = counter_instantiator();
    let fx = build_outbox(instantiator, |b| b.submit_immediately(true)).await;

    let outbox = fx.outbox.clone();
    fx.outbox
        .in_transaction(move |tx| {
            outbox
                .schedule("counter")
                .invoke(tx, "bump", vec![InvocationArg::Int(1)])?;
            Ok(())
        })
        .await
        .unwrap();

    // The post-commit hook submits the entry; delivery should land well
    // inside two seconds without any flusher involvement.
    let listener = fx.listener.clone();
    assert!(wait_for(Duration::from_secs(2), || listener.successes().len() == 1).await);
    assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.listener.scheduled_count(), 1);
}

#[tokio::test]
async fn test_rolled_back_entry_is_discarded() {
    let (instantiator, target) = counter_instantiator();
    let fx = build_outbox(instantiator, |b| b.submit_immediately(true)).await;

    let outbox = fx.outbox.clone();
    let result = fx
        .outbox
        .in_transaction(move |tx| {
            outbox
                .schedule("counter")
                .invoke(tx, "bump", vec![InvocationArg::Int(1)])?;
            Err(OutboxError::Configuration("business failure".to_string()))
        })
        .await;
    assert!(result.is_err());

    // The scheduled notification fired inside the transaction, but the
    // rollback must discard the entry and its post-commit submission.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let _ = fx.outbox.flush().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(fx.listener.successes().is_empty());
    assert_eq!(target.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_duplicate_unique_request_id_is_rejected_while_pending() {
    let (instantiator, _target) = counter_instantiator();
    let fx = build_outbox(instantiator, |b| b).await;

    let outbox = fx.outbox.clone();
    fx.outbox
        .in_transaction(move |tx| {
            outbox
                .schedule("counter")
                .unique_request_id("req-1")
                .invoke(tx, "bump", vec![])?;
            Ok(())
        })
        .await
        .unwrap();

    let outbox = fx.outbox.clone();
    let err = fx
        .outbox
        .in_transaction(move |tx| {
            outbox
                .schedule("counter")
                .unique_request_id("req-1")
                .invoke(tx, "bump", vec![])?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(
        matches!(&err, OutboxError::AlreadyScheduled { unique_request_id } if unique_request_id == "req-1"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_unique_request_id_blocks_until_reaped() {
    let (instantiator, _target) = counter_instantiator();
    // Tiny retention so the test can outlive it.
    let fx = build_outbox(instantiator, |b| b.retention(Duration::from_millis(300))).await;

    let outbox = fx.outbox.clone();
    fx.outbox
        .in_transaction(move |tx| {
            outbox
                .schedule("counter")
                .unique_request_id("req-2")
                .invoke(tx, "bump", vec![])?;
            Ok(())
        })
        .await
        .unwrap();

    // Run it to completion; the processed row is retained for dedup.
    fx.outbox.flush().await.unwrap();
    let listener = fx.listener.clone();
    assert!(wait_for(Duration::from_secs(2), || listener.successes().len() == 1).await);

    let outbox = fx.outbox.clone();
    let err = fx
        .outbox
        .in_transaction(move |tx| {
            outbox
                .schedule("counter")
                .unique_request_id("req-2")
                .invoke(tx, "bump", vec![])?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::AlreadyScheduled { .. }));

    // Once retention expires and the reaper runs, the key is free again.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fx.outbox.reap().await.unwrap(), 1);

    let outbox = fx.outbox.clone();
    fx.outbox
        .in_transaction(move |tx| {
            outbox
                .schedule("counter")
                .unique_request_id("req-2")
                .invoke(tx, "bump", vec![])?;
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_scheduled_event_reports_capture() {
    let (instantiator, _target) = counter_instantiator();
    let fx = build_outbox(instantiator, |b| b).await;

    let outbox = fx.outbox.clone();
    let entry = fx
        .outbox
        .in_transaction_returns(move |tx| {
            outbox.schedule("counter").invoke(
                tx,
                "bump",
                vec![InvocationArg::Text("payload".to_string())],
            )
        })
        .await
        .unwrap();

    assert_eq!(entry.invocation.target, "counter");
    assert_eq!(entry.invocation.method, "bump");
    assert_eq!(entry.attempts, 0);
    assert_eq!(entry.version, 1);
    assert!(!entry.processed);
    assert!(!entry.blocklisted);

    let recorded = match &fx.listener.events()[0] {
        crate::fixtures::Event::Scheduled(e) => e.clone(),
        other => panic!("expected scheduled event, got {:?}", other),
    };
    assert_eq!(recorded.id, entry.id);
}

#[tokio::test]
async fn test_process_now_runs_a_pending_entry() {
    let (instantiator, target) = counter_instantiator();
    let fx = build_outbox(instantiator, |b| b).await;

    let outbox = fx.outbox.clone();
    let entry = fx
        .outbox
        .in_transaction_returns(move |tx| outbox.schedule("counter").invoke(tx, "bump", vec![]))
        .await
        .unwrap();

    fx.outbox.process_now(entry).await;
    assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.listener.successes().len(), 1);

    // The entry is gone; a second direct run finds nothing to lock.
    let stale = fx.listener.successes()[0].clone();
    fx.outbox.process_now(stale).await;
    assert_eq!(target.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.listener.successes().len(), 1);
}

#[tokio::test]
async fn test_listener_is_isolated_from_panics() {
    struct PanickyListener(Arc<RecordingListener>);

    impl outpost::OutboxListener for PanickyListener {
        fn scheduled(&self, entry: &outpost::OutboxEntry) {
            self.0.scheduled(entry);
            panic!("listener bug");
        }

        fn success(&self, entry: &outpost::OutboxEntry) {
            self.0.success(entry);
            panic!("listener bug");
        }
    }

    let (instantiator, target) = counter_instantiator();
    let recorder = Arc::new(RecordingListener::default());
    let panicky = Arc::new(PanickyListener(recorder.clone()));

    let fx = build_outbox(instantiator, move |b| {
        b.listener(panicky).submit_immediately(true)
    })
    .await;

    let outbox = fx.outbox.clone();
    fx.outbox
        .in_transaction(move |tx| {
            outbox.schedule("counter").invoke(tx, "bump", vec![])?;
            Ok(())
        })
        .await
        .unwrap();

    let recorder_poll = recorder.clone();
    assert!(wait_for(Duration::from_secs(2), || recorder_poll.successes().len() == 1).await);
    assert_eq!(target.calls.load(Ordering::SeqCst), 1);
}
