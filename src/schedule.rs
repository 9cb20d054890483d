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

//! Schedule front-end.
//!
//! [`ScheduleBuilder`] captures one deferred call as an
//! [`crate::invocation::Invocation`] and persists it inside the caller's
//! business transaction. The builder is consumed by
//! [`ScheduleBuilder::invoke`], so each use schedules exactly one call.
//!
//! When immediate submission is enabled and the call carries no delay, a
//! post-commit hook hands the entry straight to the submitter for an
//! optimistic first run; otherwise the flusher picks it up once due.

use crate::clock::Clock;
use crate::error::OutboxError;
use crate::invocation::{Invocation, InvocationArg};
use crate::listener::{self, OutboxListener};
use crate::models::entry::OutboxEntry;
use crate::persistor::Persistor;
use crate::submitter::Submitter;
use crate::transaction::OutboxTransaction;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Per-call schedule options, created by
/// [`crate::outbox::TransactionOutbox::schedule`].
pub struct ScheduleBuilder {
    pub(crate) persistor: Arc<Persistor>,
    pub(crate) listener: Arc<dyn OutboxListener>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) submitter: Arc<dyn Submitter>,
    pub(crate) submit_immediately: bool,
    pub(crate) target: String,
    pub(crate) unique_request_id: Option<String>,
    pub(crate) delay: Option<Duration>,
}

impl ScheduleBuilder {
    /// Makes this schedule call idempotent: a second call with the same id
    /// fails with [`OutboxError::AlreadyScheduled`] until the first entry
    /// is reaped after its retention period.
    pub fn unique_request_id(mut self, id: impl Into<String>) -> Self {
        self.unique_request_id = Some(id.into());
        self
    }

    /// Delays the first attempt; the entry becomes eligible at
    /// `now + delay` and is picked up by the flusher rather than run
    /// immediately on commit.
    pub fn delay_for(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Captures the call and persists it in the caller's transaction.
    ///
    /// Returns the persisted entry; its id can be kept for later
    /// [`crate::outbox::TransactionOutbox::whitelist`] calls.
    pub fn invoke(
        self,
        tx: &mut OutboxTransaction<'_>,
        method: &str,
        args: Vec<InvocationArg>,
    ) -> Result<OutboxEntry, OutboxError> {
        let now = self.clock.now();
        let next_attempt_time = match self.delay {
            Some(delay) => {
                now + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::days(3650))
            }
            None => now,
        };

        let entry = OutboxEntry::new(
            Uuid::new_v4().to_string(),
            self.unique_request_id,
            Invocation::new(self.target, method, args),
            next_attempt_time,
        );

        self.persistor.save(tx, &entry)?;
        debug!("Scheduled {}", entry.description());

        let sink = Arc::clone(&self.listener);
        listener::notify("scheduled", || sink.scheduled(&entry));

        if self.submit_immediately && self.delay.is_none() {
            let submitter = Arc::clone(&self.submitter);
            tx.add_post_commit_hook(entry.clone(), move |staged| submitter.submit(staged));
        }

        Ok(entry)
    }
}
