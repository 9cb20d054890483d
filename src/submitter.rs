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

//! Submission and running of entries.
//!
//! The [`Submitter`] hands committed entries to the executor; the default
//! implementation spawns each run as a bounded tokio task, so submission
//! never blocks the committing thread.
//!
//! The runner performs one attempt: take the row lock in a fresh
//! transaction, release it, run the invocation, then record the outcome in
//! another transaction guarded by the entry's version. A lost version race
//! means another worker owns the outcome; the run is abandoned silently.

use crate::clock::Clock;
use crate::error::{InvocationError, OutboxError};
use crate::instantiator::Instantiator;
use crate::listener::{self, OutboxListener};
use crate::models::entry::OutboxEntry;
use crate::persistor::Persistor;
use crate::retry::RetryPolicy;
use crate::transaction::TransactionManager;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// Hands entries whose transaction has committed to the executor.
///
/// Implementations must not run the entry on the calling thread; the
/// commit path relies on `submit` returning promptly. Custom
/// implementations typically delegate to
/// [`crate::outbox::TransactionOutbox::process_now`].
pub trait Submitter: Send + Sync {
    fn submit(&self, entry: OutboxEntry);
}

/// Default submitter: a semaphore-bounded pool of spawned tasks.
pub(crate) struct ExecutorSubmitter {
    runner: Arc<Runner>,
    semaphore: Arc<Semaphore>,
    handle: tokio::runtime::Handle,
}

impl ExecutorSubmitter {
    /// Captures the current runtime handle; must be constructed inside a
    /// tokio runtime.
    pub(crate) fn new(runner: Arc<Runner>, max_concurrent_invocations: usize) -> Self {
        Self {
            runner,
            semaphore: Arc::new(Semaphore::new(max_concurrent_invocations.max(1))),
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Submitter for ExecutorSubmitter {
    fn submit(&self, entry: OutboxEntry) {
        let runner = Arc::clone(&self.runner);
        let semaphore = Arc::clone(&self.semaphore);
        self.handle.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            runner.process(entry).await;
        });
    }
}

/// Runs one attempt of one entry and records the outcome.
pub(crate) struct Runner {
    transaction_manager: TransactionManager,
    persistor: Arc<Persistor>,
    instantiator: Arc<Instantiator>,
    listener: Arc<dyn OutboxListener>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Runner {
    pub(crate) fn new(
        transaction_manager: TransactionManager,
        persistor: Arc<Persistor>,
        instantiator: Arc<Instantiator>,
        listener: Arc<dyn OutboxListener>,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transaction_manager,
            persistor,
            instantiator,
            listener,
            retry_policy,
            clock,
        }
    }

    /// One attempt: lock, invoke, record.
    pub(crate) async fn process(&self, entry: OutboxEntry) {
        match self.try_lock(&entry).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "Entry {} is locked elsewhere or already advanced; leaving it for the flusher",
                    entry.description()
                );
                return;
            }
            Err(e) => {
                warn!("Failed to lock {}: {}", entry.description(), e);
                return;
            }
        }

        // The lock transaction has ended; the invocation runs without any
        // database transaction held. The version check on the terminal
        // write rejects whichever of two racing workers finishes second.
        //
        // The call gets its own task so a panicking target surfaces as a
        // joined error and lands in the retry state machine instead of
        // unwinding through the worker.
        let instantiator = Arc::clone(&self.instantiator);
        let invocation = entry.invocation.clone();
        let outcome = match tokio::spawn(async move { instantiator.invoke(&invocation).await })
            .await
        {
            Ok(outcome) => outcome,
            Err(abort) => Err(InvocationError::Aborted(abort.to_string())),
        };

        match outcome {
            Ok(()) => self.record_success(entry).await,
            Err(cause) => self.record_failure(entry, cause).await,
        }
    }

    async fn try_lock(&self, entry: &OutboxEntry) -> Result<bool, OutboxError> {
        let persistor = Arc::clone(&self.persistor);
        let entry = entry.clone();
        self.transaction_manager
            .in_transaction_returns(move |tx| persistor.lock(tx, &entry))
            .await
    }

    async fn record_success(&self, entry: OutboxEntry) {
        let persistor = Arc::clone(&self.persistor);
        let retention_deadline = self.retry_policy.retention_deadline(self.clock.now());

        let result = self
            .transaction_manager
            .in_transaction_returns(move |tx| {
                let mut entry = entry;
                if entry.unique_request_id.is_some() {
                    // Keep the row so the unique request id stays reserved
                    // until the reaper removes it after retention.
                    entry.processed = true;
                    entry.attempts += 1;
                    entry.next_attempt_time = retention_deadline;
                    persistor.update(tx, &mut entry)?;
                } else {
                    persistor.delete(tx, &entry)?;
                }
                Ok(entry)
            })
            .await;

        match result {
            Ok(entry) => {
                debug!("Processed {}", entry.description());
                let sink = Arc::clone(&self.listener);
                listener::notify("success", || sink.success(&entry));
            }
            Err(OutboxError::OptimisticLock) => {
                debug!("Another worker recorded the outcome first; abandoning this run");
            }
            Err(e) => {
                warn!("Failed to record success: {}", e);
            }
        }
    }

    async fn record_failure(&self, entry: OutboxEntry, cause: InvocationError) {
        let persistor = Arc::clone(&self.persistor);
        let policy = self.retry_policy.clone();
        let now = self.clock.now();

        let result = self
            .transaction_manager
            .in_transaction_returns(move |tx| {
                let mut entry = entry;
                entry.attempts += 1;
                if policy.should_blocklist(entry.attempts) {
                    entry.blocklisted = true;
                }
                entry.next_attempt_time = policy.next_attempt_time(now, entry.attempts);
                persistor.update(tx, &mut entry)?;
                Ok(entry)
            })
            .await;

        match result {
            Ok(entry) if entry.blocklisted => {
                error!(
                    "Blocklisting {} after {} attempts: {}",
                    entry.description(),
                    entry.attempts,
                    cause
                );
                let sink = Arc::clone(&self.listener);
                listener::notify("blocklisted", || sink.blocklisted(&entry, &cause));
            }
            Ok(entry) => {
                warn!(
                    "Attempt {} failed for {}: {}",
                    entry.attempts,
                    entry.description(),
                    cause
                );
                let sink = Arc::clone(&self.listener);
                listener::notify("failure", || sink.failure(&entry, &cause));
            }
            Err(OutboxError::OptimisticLock) => {
                debug!("Another worker recorded the outcome first; abandoning this run");
            }
            Err(e) => {
                warn!("Failed to record failure: {}", e);
            }
        }
    }
}
