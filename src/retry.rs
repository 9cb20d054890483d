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

//! Retry policy.
//!
//! On failure an entry is rescheduled to `now + attempt_frequency *
//! backoff(attempts)`. The default backoff is linear; supply a custom
//! [`Backoff`] for exponential or capped schedules. Once `attempts` reaches
//! `blocklist_after_attempts` the entry is quarantined and no further
//! automatic retries occur.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Maps the completed attempt count to a multiplier of the base frequency.
pub trait Backoff: Send + Sync + std::fmt::Debug {
    fn factor(&self, attempts: i32) -> u32;
}

/// Identity backoff: the n-th retry waits `n * attempt_frequency`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearBackoff;

impl Backoff for LinearBackoff {
    fn factor(&self, attempts: i32) -> u32 {
        attempts.max(1) as u32
    }
}

/// Retry and retention configuration for the outbox.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempt_frequency: Duration,
    blocklist_after_attempts: i32,
    retention: Duration,
    backoff: Arc<dyn Backoff>,
}

impl RetryPolicy {
    pub fn new(
        attempt_frequency: Duration,
        blocklist_after_attempts: i32,
        retention: Duration,
        backoff: Arc<dyn Backoff>,
    ) -> Self {
        Self {
            attempt_frequency,
            blocklist_after_attempts,
            retention,
            backoff,
        }
    }

    /// Interval between flusher passes and the base unit of backoff.
    pub fn attempt_frequency(&self) -> Duration {
        self.attempt_frequency
    }

    /// Number of failed attempts after which an entry is blocklisted.
    pub fn blocklist_after_attempts(&self) -> i32 {
        self.blocklist_after_attempts
    }

    /// How long a processed entry with a unique request id is retained
    /// to block duplicate scheduling.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Computes when the entry should next become eligible, given the
    /// attempt count after the failure being recorded.
    pub fn next_attempt_time(&self, now: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
        let factor = self.backoff.factor(attempts);
        let delay = self
            .attempt_frequency
            .checked_mul(factor)
            .unwrap_or(self.attempt_frequency);
        now + chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::days(3650))
    }

    /// True once the attempt count has exhausted the retry budget.
    pub fn should_blocklist(&self, attempts: i32) -> bool {
        attempts >= self.blocklist_after_attempts
    }

    /// When a processed entry becomes eligible for the expired-record reaper.
    pub fn retention_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(3650))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(2),
            5,
            Duration::from_secs(7 * 24 * 60 * 60),
            Arc::new(LinearBackoff),
        )
    }
}
