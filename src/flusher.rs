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

//! Background flushing and expired-record reaping.
//!
//! The flusher is the safety net behind the optimistic post-commit submit:
//! on a fixed cadence it selects due entries under row locks and hands each
//! one to the submitter through a post-commit hook, so dispatch happens the
//! moment the selection transaction commits. It never waits on invocation
//! completion.
//!
//! A second, slower loop reaps processed entries whose dedup retention has
//! expired. Loop-body errors are logged and the loops keep running.

use crate::clock::Clock;
use crate::error::OutboxError;
use crate::persistor::Persistor;
use crate::submitter::Submitter;
use crate::transaction::TransactionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub(crate) struct Flusher {
    transaction_manager: TransactionManager,
    persistor: Arc<Persistor>,
    submitter: Arc<dyn Submitter>,
    clock: Arc<dyn Clock>,
    flush_batch_size: usize,
}

impl Flusher {
    pub(crate) fn new(
        transaction_manager: TransactionManager,
        persistor: Arc<Persistor>,
        submitter: Arc<dyn Submitter>,
        clock: Arc<dyn Clock>,
        flush_batch_size: usize,
    ) -> Self {
        Self {
            transaction_manager,
            persistor,
            submitter,
            clock,
            flush_batch_size,
        }
    }

    /// Selects one due batch and dispatches it. Returns whether any entry
    /// was dispatched, so callers can drain a backlog with a tight loop.
    pub(crate) async fn flush(&self) -> Result<bool, OutboxError> {
        let now = self.clock.now();
        let persistor = Arc::clone(&self.persistor);
        let submitter = Arc::clone(&self.submitter);
        let batch_size = self.flush_batch_size;

        let dispatched = self
            .transaction_manager
            .in_transaction_returns(move |tx| {
                let batch = persistor.select_batch(tx, batch_size, now)?;
                let count = batch.len();
                for entry in batch {
                    let submitter = Arc::clone(&submitter);
                    tx.add_post_commit_hook(entry, move |staged| submitter.submit(staged));
                }
                Ok(count)
            })
            .await?;

        if dispatched > 0 {
            debug!("Flushed {} due entries", dispatched);
        }
        Ok(dispatched > 0)
    }

    /// Deletes one batch of processed entries past their retention.
    pub(crate) async fn reap(&self) -> Result<usize, OutboxError> {
        let now = self.clock.now();
        let persistor = Arc::clone(&self.persistor);
        let batch_size = self.flush_batch_size;

        self.transaction_manager
            .in_transaction_returns(move |tx| {
                persistor.delete_processed_and_expired(tx, batch_size, now)
            })
            .await
    }

    /// Periodic flush loop. Exits when the shutdown signal fires.
    pub(crate) async fn run_flush_loop(
        self: Arc<Self>,
        frequency: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Outbox flusher started (every {:?})", frequency);
        let mut interval = tokio::time::interval(frequency);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.flush().await {
                        error!("Outbox flush failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Outbox flusher shutting down");
                    break;
                }
            }
        }
    }

    /// Periodic reap loop for retained dedup records.
    pub(crate) async fn run_reap_loop(
        self: Arc<Self>,
        frequency: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Outbox reaper started (every {:?})", frequency);
        let mut interval = tokio::time::interval(frequency);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reap().await {
                        Ok(0) => {}
                        Ok(n) => debug!("Reaped {} expired entries", n),
                        Err(e) => error!("Expired-entry reap failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Outbox reaper shutting down");
                    break;
                }
            }
        }
    }
}
