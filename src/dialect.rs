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

//! SQL dialect catalog.
//!
//! The dialect captures everything backend-specific that the persistor and
//! migration runner need: placeholder syntax, locking clauses, lock-timeout
//! statements, column types, and the bulk-reap statement template.
//!
//! Absence of `SKIP LOCKED` is a performance downgrade, not a correctness
//! problem: workers contend on row locks bounded by the write lock timeout
//! and back off, and optimistic version checks reject the loser of any race.

use crate::database::BackendType;
use std::time::Duration;

/// Broad backend family, for diagnostics and feature checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialectFamily {
    Postgres,
    Sqlite,
}

/// A supported SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL 9.5+ with `FOR UPDATE SKIP LOCKED`.
    Postgres,
    /// PostgreSQL with skip-lock disabled. Exists to exercise the
    /// contended locking path; not intended for production.
    PostgresNoSkipLock,
    /// SQLite. No row-level `FOR UPDATE`; writers serialize on the
    /// database write lock, bounded by `PRAGMA busy_timeout`.
    Sqlite,
}

impl Dialect {
    /// Picks the production dialect for a connection URL, using the same
    /// detection rules as [`BackendType::from_url`].
    pub fn from_url(url: &str) -> Self {
        match BackendType::from_url(url) {
            #[cfg(feature = "postgres")]
            BackendType::Postgres => Dialect::Postgres,
            #[cfg(feature = "sqlite")]
            BackendType::Sqlite => Dialect::Sqlite,
        }
    }

    pub fn family(&self) -> DialectFamily {
        match self {
            Dialect::Postgres | Dialect::PostgresNoSkipLock => DialectFamily::Postgres,
            Dialect::Sqlite => DialectFamily::Sqlite,
        }
    }

    /// The backend this dialect must run against.
    pub fn backend(&self) -> BackendType {
        match self.family() {
            #[cfg(feature = "postgres")]
            DialectFamily::Postgres => BackendType::Postgres,
            #[cfg(feature = "sqlite")]
            DialectFamily::Sqlite => BackendType::Sqlite,
            #[allow(unreachable_patterns)]
            _ => panic!("dialect requires a backend feature that is not enabled"),
        }
    }

    /// True if hot-row support (`SKIP LOCKED`) is available, letting
    /// competing workers pass over locked rows instead of waiting.
    pub fn supports_skip_lock(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }

    /// Positional bind placeholder for the n-th parameter (1-based).
    pub fn placeholder(&self, n: usize) -> String {
        match self.family() {
            DialectFamily::Postgres => format!("${}", n),
            DialectFamily::Sqlite => "?".to_string(),
        }
    }

    /// Locking clause for the single-row `lock()` select.
    pub fn row_lock_clause(&self) -> &'static str {
        match self {
            Dialect::Postgres => " FOR UPDATE SKIP LOCKED",
            Dialect::PostgresNoSkipLock => " FOR UPDATE",
            Dialect::Sqlite => "",
        }
    }

    /// Locking clause for the batch select. Dialects without skip-lock
    /// select without locks and rely on `lock()` during processing.
    pub fn batch_lock_clause(&self) -> &'static str {
        if self.supports_skip_lock() {
            " FOR UPDATE SKIP LOCKED"
        } else {
            ""
        }
    }

    /// Statements to run on a session before opening a transaction.
    ///
    /// SQLite gets WAL mode, so readers do not block the single writer, and
    /// a busy timeout bounding waits on the database write lock.
    pub fn session_preface(&self, write_lock_timeout: Duration) -> Vec<String> {
        match self.family() {
            DialectFamily::Postgres => Vec::new(),
            DialectFamily::Sqlite => vec![
                "PRAGMA journal_mode = WAL".to_string(),
                format!("PRAGMA busy_timeout = {}", write_lock_timeout.as_millis()),
            ],
        }
    }

    /// Statement bounding the wait of the next lock attempt, run inside the
    /// active transaction immediately before the locking select.
    pub fn lock_timeout_preface(&self, write_lock_timeout: Duration) -> Option<String> {
        match self.family() {
            DialectFamily::Postgres => Some(format!(
                "SET LOCAL lock_timeout = '{}s'",
                write_lock_timeout.as_secs().max(1)
            )),
            DialectFamily::Sqlite => None,
        }
    }

    /// Undoes [`Dialect::lock_timeout_preface`] for the rest of the
    /// transaction, so user statements are not bounded by it.
    pub fn lock_timeout_reset(&self) -> Option<&'static str> {
        match self.family() {
            DialectFamily::Postgres => Some("SET LOCAL lock_timeout = DEFAULT"),
            DialectFamily::Sqlite => None,
        }
    }

    /// Column type holding timestamps with at least microsecond precision.
    pub fn timestamp_type(&self) -> &'static str {
        match self.family() {
            DialectFamily::Postgres => "TIMESTAMP(6)",
            DialectFamily::Sqlite => "TEXT",
        }
    }

    /// Keyword for an integer cast, used in generated DDL.
    pub fn integer_type(&self) -> &'static str {
        "INTEGER"
    }

    /// Template for the bulk delete of processed, expired entries.
    ///
    /// `{{table}}` is substituted with the outbox table name; the two bind
    /// parameters are the cutoff timestamp and the row cap. Both families
    /// need the id-subquery form because plain `DELETE ... LIMIT` is not
    /// available.
    pub fn delete_expired_template(&self) -> String {
        format!(
            "DELETE FROM {{{{table}}}} WHERE id IN (\
             SELECT id FROM {{{{table}}}} \
             WHERE nextAttemptTime < {} AND processed = TRUE AND blocklisted = FALSE \
             LIMIT {})",
            self.placeholder(1),
            self.placeholder(2)
        )
    }
}
