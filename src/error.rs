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

//! Error types for the outbox engine.
//!
//! Errors fall into three tiers:
//!
//! 1. User-visible at enqueue time: [`OutboxError::AlreadyScheduled`] and
//!    [`OutboxError::Serialization`], propagated out of `schedule()`.
//! 2. Internal and recoverable: [`OutboxError::OptimisticLock`] and lock-wait
//!    timeouts. The engine swallows these; another worker or the next flush
//!    retries the entry.
//! 3. Invocation failures: anything a target returns or panics with is a
//!    transient failure handled by the retry state machine.

use thiserror::Error;

/// Top-level error type for outbox operations.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// An entry with the same unique request id already exists.
    ///
    /// Raised when `schedule()` hits the UNIQUE constraint on
    /// `uniqueRequestId`. The original entry (pending or processed-but-
    /// retained) blocks re-scheduling until it is reaped.
    #[error("request with unique id `{unique_request_id}` is already scheduled")]
    AlreadyScheduled { unique_request_id: String },

    /// The entry was modified by another worker between read and write.
    ///
    /// Internal: callers inside the engine log and abandon the current run;
    /// this never reaches application code through `schedule()`.
    #[error("entry was modified concurrently (optimistic lock failure)")]
    OptimisticLock,

    /// The invocation could not be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// An invocation target reported a failure.
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// A database statement failed.
    #[error("database error: {0}")]
    Database(diesel::result::Error),

    /// A connection could not be obtained from the pool, or the pooled
    /// worker thread failed.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Invalid configuration passed to the builder.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<diesel::result::Error> for OutboxError {
    fn from(e: diesel::result::Error) -> Self {
        OutboxError::Database(e)
    }
}

/// Errors raised while converting an [`crate::invocation::Invocation`]
/// to or from its persisted text form.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The argument value is outside the supported whitelist (for example a
    /// non-finite floating point number, which JSON cannot represent).
    #[error("unsupported invocation argument: {0}")]
    Unsupported(String),

    /// The persisted text could not be parsed.
    #[error("invalid invocation payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure reported by an invocation target, or by dispatch itself.
///
/// All variants are treated as transient by the retry state machine.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// No target is registered under the requested name.
    #[error("no invocation target registered under `{0}`")]
    UnknownTarget(String),

    /// The target does not understand the requested method.
    #[error("target `{target}` has no method `{method}`")]
    UnknownMethod { target: String, method: String },

    /// The target ran and failed.
    #[error("invocation failed: {0}")]
    Failed(String),

    /// The target panicked or its task was cancelled.
    #[error("invocation aborted: {0}")]
    Aborted(String),
}

impl InvocationError {
    /// Shorthand for a target-reported failure.
    pub fn failed(message: impl Into<String>) -> Self {
        InvocationError::Failed(message.into())
    }
}
