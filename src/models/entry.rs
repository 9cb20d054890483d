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

//! Outbox Entry Model
//!
//! One [`OutboxEntry`] is one row in the outbox table: a pending invocation
//! plus the state the retry machine needs. State transitions always go
//! through the persistor, which matches on `version` and bumps it, so at
//! most one of any set of competing writers wins.
//!
//! An entry is *selectable* while `processed` and `blocklisted` are both
//! false and `next_attempt_time` has passed. A processed entry is retained
//! only when it carries a unique request id, to block duplicate scheduling
//! until the reaper removes it.

use crate::invocation::Invocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A durable work item in the outbox table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Opaque unique id (UUID string). Primary key.
    pub id: String,
    /// Optional caller-supplied deduplication key, UNIQUE when present.
    pub unique_request_id: Option<String>,
    /// The deferred call.
    pub invocation: Invocation,
    /// Earliest moment the entry is eligible for selection.
    pub next_attempt_time: DateTime<Utc>,
    /// Completed failed attempts.
    pub attempts: i32,
    /// Quarantined after exhausting the retry budget; needs explicit
    /// whitelisting to resume.
    pub blocklisted: bool,
    /// Ran to completion; retained only for deduplication.
    pub processed: bool,
    /// Optimistic concurrency version, incremented by every write.
    pub version: i32,
}

impl OutboxEntry {
    /// Creates a fresh entry as `schedule()` persists it.
    pub fn new(
        id: String,
        unique_request_id: Option<String>,
        invocation: Invocation,
        next_attempt_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            unique_request_id,
            invocation,
            next_attempt_time,
            attempts: 0,
            blocklisted: false,
            processed: false,
            version: 1,
        }
    }

    /// Awaiting execution (possibly in the future).
    pub fn is_pending(&self) -> bool {
        !self.processed && !self.blocklisted
    }

    /// Eligible for selection at `now`.
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_attempt_time < now
    }

    /// Short human-readable identity for logs.
    pub fn description(&self) -> String {
        match &self.unique_request_id {
            Some(key) => format!("{} [{}, uid={}]", self.invocation, self.id, key),
            None => format!("{} [{}]", self.invocation, self.id),
        }
    }
}

impl fmt::Display for OutboxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
