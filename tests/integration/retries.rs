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

//! Retry, blocklist, and whitelist behavior.

use crate::fixtures::{build_outbox, drive_until, wait_for, FlakyTarget, PanickingTarget, TogglingTarget};
use outpost::Instantiator;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_transient_failures_recover_with_exactly_one_success() {
    let target = Arc::new(FlakyTarget::failing_first(2));
    let mut instantiator = Instantiator::new();
    instantiator.register("flaky", target.clone());

    let fx = build_outbox(instantiator, |b| {
        b.attempt_frequency(Duration::from_millis(50))
            .blocklist_after_attempts(5)
    })
    .await;

    let outbox = fx.outbox.clone();
    fx.outbox
        .in_transaction(move |tx| {
            outbox.schedule("flaky").invoke(tx, "work", vec![])?;
            Ok(())
        })
        .await
        .unwrap();

    let listener = fx.listener.clone();
    drive_until(&fx.outbox, Duration::from_secs(15), || {
        listener.successes().len() == 1
    })
    .await;

    // Keep flushing; nothing further may happen once the entry succeeded.
    for _ in 0..5 {
        fx.outbox.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    assert_eq!(fx.listener.successes().len(), 1, "exactly one success event");
    assert_eq!(fx.listener.failure_count(), 2);
    assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    assert!(fx.listener.blocklisted().is_empty());
}

#[tokio::test]
async fn test_entry_is_blocklisted_after_budget_and_whitelist_recovers_it() {
    let target = Arc::new(TogglingTarget::default());
    target.failing.store(true, Ordering::SeqCst);
    let mut instantiator = Instantiator::new();
    instantiator.register("toggle", target.clone());

    let fx = build_outbox(instantiator, |b| {
        b.attempt_frequency(Duration::from_millis(30))
            .blocklist_after_attempts(3)
    })
    .await;

    let outbox = fx.outbox.clone();
    let entry = fx
        .outbox
        .in_transaction_returns(move |tx| outbox.schedule("toggle").invoke(tx, "work", vec![]))
        .await
        .unwrap();

    // Third failure crosses the budget: the listener sees two plain
    // failures and then the blocklisted notification.
    let listener = fx.listener.clone();
    drive_until(&fx.outbox, Duration::from_secs(10), || {
        !listener.blocklisted().is_empty()
    })
    .await;

    let quarantined = &fx.listener.blocklisted()[0];
    assert_eq!(quarantined.id, entry.id);
    assert_eq!(quarantined.attempts, 3);
    assert!(quarantined.blocklisted);
    assert_eq!(fx.listener.failure_count(), 2);

    // Quarantined entries are not selectable: further flushes do nothing.
    let events_before = fx.listener.events().len();
    for _ in 0..5 {
        assert!(!fx.outbox.flush().await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert_eq!(fx.listener.events().len(), events_before);

    // Fix the target and whitelist the entry; the next flush runs it.
    target.failing.store(false, Ordering::SeqCst);
    assert!(fx.outbox.whitelist(&entry.id).await.unwrap());

    let listener = fx.listener.clone();
    drive_until(&fx.outbox, Duration::from_secs(5), || {
        listener.successes().len() == 1
    })
    .await;
    assert_eq!(fx.listener.successes()[0].id, entry.id);
}

#[tokio::test]
async fn test_whitelist_is_idempotent_and_scoped() {
    let target = Arc::new(TogglingTarget::default());
    target.failing.store(true, Ordering::SeqCst);
    let mut instantiator = Instantiator::new();
    instantiator.register("toggle", target.clone());

    let fx = build_outbox(instantiator, |b| {
        b.attempt_frequency(Duration::from_millis(30))
            .blocklist_after_attempts(2)
    })
    .await;

    let outbox = fx.outbox.clone();
    let entry = fx
        .outbox
        .in_transaction_returns(move |tx| outbox.schedule("toggle").invoke(tx, "work", vec![]))
        .await
        .unwrap();

    // Whitelisting an entry that is not blocklisted changes nothing.
    assert!(!fx.outbox.whitelist(&entry.id).await.unwrap());
    assert!(!fx.outbox.whitelist("no-such-entry").await.unwrap());

    let listener = fx.listener.clone();
    drive_until(&fx.outbox, Duration::from_secs(10), || {
        !listener.blocklisted().is_empty()
    })
    .await;

    assert!(fx.outbox.whitelist(&entry.id).await.unwrap());
    // Second whitelist after the first success is a no-op.
    assert!(!fx.outbox.whitelist(&entry.id).await.unwrap());
}

#[tokio::test]
async fn test_panicking_target_goes_through_retry_path() {
    let mut instantiator = Instantiator::new();
    instantiator.register("bomb", Arc::new(PanickingTarget));

    let fx = build_outbox(instantiator, |b| {
        b.attempt_frequency(Duration::from_millis(30))
            .blocklist_after_attempts(2)
    })
    .await;

    let outbox = fx.outbox.clone();
    let entry = fx
        .outbox
        .in_transaction_returns(move |tx| outbox.schedule("bomb").invoke(tx, "detonate", vec![]))
        .await
        .unwrap();

    // A panic in the target must count as a failed attempt: one plain
    // failure, then quarantine at the threshold, never an unwinding task.
    let listener = fx.listener.clone();
    drive_until(&fx.outbox, Duration::from_secs(10), || {
        !listener.blocklisted().is_empty()
    })
    .await;

    let quarantined = &fx.listener.blocklisted()[0];
    assert_eq!(quarantined.id, entry.id);
    assert_eq!(quarantined.attempts, 2);
    assert_eq!(fx.listener.failure_count(), 1);
}

#[tokio::test]
async fn test_unknown_target_goes_through_retry_path() {
    // Nothing registered: dispatch fails, which must count as an ordinary
    // transient failure rather than an enqueue error.
    let fx = build_outbox(Instantiator::new(), |b| {
        b.attempt_frequency(Duration::from_millis(30))
            .blocklist_after_attempts(2)
    })
    .await;

    let outbox = fx.outbox.clone();
    fx.outbox
        .in_transaction(move |tx| {
            outbox.schedule("ghost").invoke(tx, "walk", vec![])?;
            Ok(())
        })
        .await
        .unwrap();

    let listener = fx.listener.clone();
    drive_until(&fx.outbox, Duration::from_secs(10), || {
        !listener.blocklisted().is_empty()
    })
    .await;
    assert!(wait_for(Duration::from_secs(1), || {
        fx.listener.failure_count() == 1
    })
    .await);
}
