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

//! Lifecycle event sink.
//!
//! Delivery is synchronous and best-effort, on the thread that performed the
//! state change. A panicking listener is caught and logged; it never
//! interrupts the engine.

use crate::error::InvocationError;
use crate::models::entry::OutboxEntry;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Observes outbox entry lifecycle events.
///
/// All methods default to no-ops, so implementors override only what they
/// care about.
pub trait OutboxListener: Send + Sync {
    /// An entry was persisted inside a business transaction. Fires before
    /// that transaction commits; a rollback discards the entry.
    fn scheduled(&self, entry: &OutboxEntry) {
        let _ = entry;
    }

    /// An entry ran to completion and its terminal state was recorded.
    fn success(&self, entry: &OutboxEntry) {
        let _ = entry;
    }

    /// An attempt failed and the entry was rescheduled.
    fn failure(&self, entry: &OutboxEntry, cause: &InvocationError) {
        let _ = (entry, cause);
    }

    /// The entry exhausted its retry budget and was quarantined.
    fn blocklisted(&self, entry: &OutboxEntry, cause: &InvocationError) {
        let _ = (entry, cause);
    }
}

/// The default listener: ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl OutboxListener for NoopListener {}

/// Runs a listener callback, isolating panics from the engine.
pub(crate) fn notify(event: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("outbox listener panicked during `{}` notification", event);
    }
}
