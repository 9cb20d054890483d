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

//! Concurrency properties: optimistic versioning and exactly-one-success
//! accounting under parallel schedulers, an unreliable target, and a
//! backend without skip-lock support.

use crate::fixtures::{build_outbox, wait_for, RandomFailingTarget};
use outpost::{Instantiator, InvocationArg, OutboxError};
use serial_test::serial;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn test_stale_version_update_is_an_optimistic_lock_failure() {
    let fx = build_outbox(Instantiator::new(), |b| b).await;

    let outbox = fx.outbox.clone();
    let entry = fx
        .outbox
        .in_transaction_returns(move |tx| outbox.schedule("nobody").invoke(tx, "noop", vec![]))
        .await
        .unwrap();

    // First update wins and bumps the row to version 2.
    let persistor = fx.outbox.persistor();
    let winner = entry.clone();
    let winner = fx
        .outbox
        .in_transaction_returns(move |tx| {
            let mut winner = winner;
            winner.attempts += 1;
            persistor.update(tx, &mut winner)?;
            Ok(winner)
        })
        .await
        .unwrap();
    assert_eq!(winner.version, 2);

    // A competitor still holding version 1 must lose without touching the row.
    let persistor = fx.outbox.persistor();
    let loser = entry.clone();
    let err = fx
        .outbox
        .in_transaction(move |tx| {
            let mut loser = loser;
            loser.attempts += 5;
            persistor.update(tx, &mut loser)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::OptimisticLock));

    // Same for a stale delete.
    let persistor = fx.outbox.persistor();
    let stale = entry.clone();
    let err = fx
        .outbox
        .in_transaction(move |tx| persistor.delete(tx, &stale))
        .await
        .unwrap_err();
    assert!(matches!(err, OutboxError::OptimisticLock));
}

#[tokio::test]
async fn test_lock_reports_unavailable_for_stale_or_missing_rows() {
    let fx = build_outbox(Instantiator::new(), |b| b).await;

    let outbox = fx.outbox.clone();
    let entry = fx
        .outbox
        .in_transaction_returns(move |tx| outbox.schedule("nobody").invoke(tx, "noop", vec![]))
        .await
        .unwrap();

    // Current version: lockable.
    let persistor = fx.outbox.persistor();
    let current = entry.clone();
    assert!(fx
        .outbox
        .in_transaction_returns(move |tx| persistor.lock(tx, &current))
        .await
        .unwrap());

    // Stale version: reported unavailable, not an error.
    let persistor = fx.outbox.persistor();
    let mut stale = entry.clone();
    stale.version = 99;
    assert!(!fx
        .outbox
        .in_transaction_returns(move |tx| persistor.lock(tx, &stale))
        .await
        .unwrap());
}

/// High-volume end-to-end drain on a backend without skip-lock support:
/// forty entries scheduled from eight parallel transactions, a target that
/// fails at random, immediate submission racing the background flusher.
/// Every payload must be observed successfully exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_high_volume_drain_has_no_duplicates() {
    const WRITERS: i64 = 8;
    const PER_WRITER: i64 = 5;

    let mut instantiator = Instantiator::new();
    instantiator.register("unreliable", std::sync::Arc::new(RandomFailingTarget));

    let fx = build_outbox(instantiator, |b| {
        b.submit_immediately(true)
            .enable_background_flush(true)
            .attempt_frequency(Duration::from_millis(30))
            .blocklist_after_attempts(1000)
            .max_concurrent_invocations(8)
    })
    .await;

    let mut writers = Vec::new();
    for w in 0..WRITERS {
        let outbox = fx.outbox.clone();
        writers.push(tokio::spawn(async move {
            let scheduler = outbox.clone();
            outbox
                .in_transaction(move |tx| {
                    for i in 0..PER_WRITER {
                        scheduler.schedule("unreliable").invoke(
                            tx,
                            "process",
                            vec![InvocationArg::Int(w * PER_WRITER + i)],
                        )?;
                    }
                    Ok(())
                })
                .await
        }));
    }
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    let expected = (WRITERS * PER_WRITER) as usize;
    let listener = fx.listener.clone();
    assert!(
        wait_for(Duration::from_secs(30), || listener.successes().len() >= expected).await,
        "only {}/{} entries succeeded",
        fx.listener.successes().len(),
        expected
    );

    // Give any stragglers a moment, then check the exactly-once accounting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let successes = fx.listener.successes();
    assert_eq!(successes.len(), expected, "duplicate success events");

    let mut seen = HashSet::new();
    for entry in &successes {
        match &entry.invocation.args[0] {
            InvocationArg::Int(i) => assert!(seen.insert(*i), "payload {} observed twice", i),
            other => panic!("unexpected argument: {:?}", other),
        }
    }
    assert_eq!(seen.len(), expected);
    assert!((0..(WRITERS * PER_WRITER)).all(|i| seen.contains(&i)));

    fx.outbox.shutdown().await;
}
