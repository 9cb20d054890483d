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

//! The SQL core.
//!
//! All outbox statements are rendered once at construction from the dialect
//! and table name, then executed through `diesel::sql_query` inside the
//! caller's transaction. Every state-mutating statement matches on the
//! current `version` and writes `version + 1`; zero affected rows means
//! another worker got there first and surfaces as
//! [`OutboxError::OptimisticLock`].
//!
//! Lock-wait timeouts on `lock()` are not errors: the statement is bounded
//! by the write lock timeout and a timeout simply reports the row as
//! unavailable, leaving it for the next flush.

use crate::clock::truncate_to_micros;
use crate::dialect::Dialect;
use crate::error::OutboxError;
use crate::models::entry::OutboxEntry;
use crate::serializer::InvocationSerializer;
use crate::transaction::OutboxTransaction;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::sql_types::{BigInt, Bool, Integer, Nullable, Text, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default outbox table name.
pub const DEFAULT_TABLE_NAME: &str = "TXNO_OUTBOX";

/// Row shape returned by the batch select.
#[derive(QueryableByName)]
struct EntryRow {
    #[diesel(sql_type = Text)]
    id: String,
    #[diesel(sql_type = Nullable<Text>)]
    unique_request_id: Option<String>,
    #[diesel(sql_type = Text)]
    invocation: String,
    #[diesel(sql_type = Timestamp)]
    next_attempt_time: NaiveDateTime,
    #[diesel(sql_type = Integer)]
    attempts: i32,
    #[diesel(sql_type = Bool)]
    blocklisted: bool,
    #[diesel(sql_type = Bool)]
    processed: bool,
    #[diesel(sql_type = Integer)]
    version: i32,
}

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = Text)]
    #[allow(dead_code)]
    id: String,
}

/// Pre-rendered SQL for one table/dialect combination.
#[derive(Debug, Clone)]
struct Statements {
    insert: String,
    update: String,
    delete: String,
    lock: String,
    whitelist: String,
    select_batch: String,
    delete_expired: String,
    clear: String,
}

impl Statements {
    fn render(dialect: Dialect, table: &str) -> Self {
        let p = |n| dialect.placeholder(n);
        Self {
            insert: format!(
                "INSERT INTO {table} (id, uniqueRequestId, invocation, nextAttemptTime, \
                 attempts, blocklisted, processed, version) \
                 VALUES ({}, {}, {}, {}, {}, {}, {}, {})",
                p(1), p(2), p(3), p(4), p(5), p(6), p(7), p(8)
            ),
            update: format!(
                "UPDATE {table} SET nextAttemptTime = {}, attempts = {}, blocklisted = {}, \
                 processed = {}, version = {} WHERE id = {} AND version = {}",
                p(1), p(2), p(3), p(4), p(5), p(6), p(7)
            ),
            delete: format!(
                "DELETE FROM {table} WHERE id = {} AND version = {}",
                p(1), p(2)
            ),
            lock: format!(
                "SELECT id FROM {table} WHERE id = {} AND version = {}{}",
                p(1), p(2), dialect.row_lock_clause()
            ),
            whitelist: format!(
                "UPDATE {table} SET attempts = 0, blocklisted = FALSE, version = version + 1 \
                 WHERE blocklisted = TRUE AND processed = FALSE AND id = {}",
                p(1)
            ),
            select_batch: format!(
                "SELECT id, uniqueRequestId AS unique_request_id, invocation, \
                 nextAttemptTime AS next_attempt_time, attempts, blocklisted, processed, version \
                 FROM {table} WHERE nextAttemptTime < {} AND blocklisted = FALSE \
                 AND processed = FALSE LIMIT {}{}",
                p(1), p(2), dialect.batch_lock_clause()
            ),
            delete_expired: dialect.delete_expired_template().replace("{{table}}", table),
            clear: format!("DELETE FROM {table}"),
        }
    }
}

/// Persists outbox entries to the relational store.
///
/// Holds no mutable state; safe to share across workers. All methods are
/// blocking database calls and must run inside an active
/// [`OutboxTransaction`].
#[derive(Clone)]
pub struct Persistor {
    dialect: Dialect,
    table_name: String,
    write_lock_timeout: Duration,
    serializer: Arc<dyn InvocationSerializer>,
    sql: Statements,
}

impl Persistor {
    pub fn new(
        dialect: Dialect,
        table_name: impl Into<String>,
        write_lock_timeout: Duration,
        serializer: Arc<dyn InvocationSerializer>,
    ) -> Result<Self, OutboxError> {
        let table_name = table_name.into();
        if table_name.is_empty()
            || !table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(OutboxError::Configuration(format!(
                "table name `{}` must be non-empty and contain only alphanumeric \
                 characters and underscores",
                table_name
            )));
        }

        let sql = Statements::render(dialect, &table_name);
        Ok(Self {
            dialect,
            table_name,
            write_lock_timeout,
            serializer,
            sql,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Applies the append-only schema migration sequence for this
    /// persistor's table. Idempotent; see [`crate::migrations`].
    pub async fn migrate(
        &self,
        transaction_manager: &crate::transaction::TransactionManager,
    ) -> Result<(), OutboxError> {
        let conn = transaction_manager.database().get().await?;
        let dialect = self.dialect;
        let table = self.table_name.clone();
        conn.interact(move |conn| crate::migrations::run_migrations(conn, dialect, &table))
            .await
            .map_err(|e| OutboxError::Pool(e.to_string()))??;
        Ok(())
    }

    /// Inserts a new entry in the caller's transaction.
    ///
    /// A UNIQUE violation on `uniqueRequestId` maps to
    /// [`OutboxError::AlreadyScheduled`]; such a request must not be
    /// retried until the blocking entry is reaped.
    pub fn save(&self, tx: &mut OutboxTransaction<'_>, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let invocation_text = self.serializer.serialize(&entry.invocation)?;

        let result = diesel::sql_query(&self.sql.insert)
            .bind::<Text, _>(entry.id.clone())
            .bind::<Nullable<Text>, _>(entry.unique_request_id.clone())
            .bind::<Text, _>(invocation_text)
            .bind::<Timestamp, _>(entry.next_attempt_time.naive_utc())
            .bind::<Integer, _>(entry.attempts)
            .bind::<Bool, _>(entry.blocklisted)
            .bind::<Bool, _>(entry.processed)
            .bind::<Integer, _>(entry.version)
            .execute(tx.connection());

        match result {
            Ok(_) => {
                debug!("Inserted {}", entry.description());
                Ok(())
            }
            Err(e) => {
                let unique_violation = matches!(
                    e,
                    diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
                );
                match (&entry.unique_request_id, unique_violation) {
                    (Some(uid), true) => Err(OutboxError::AlreadyScheduled {
                        unique_request_id: uid.clone(),
                    }),
                    _ => Err(e.into()),
                }
            }
        }
    }

    /// Writes the entry's current state, guarded by its version.
    ///
    /// On success the in-memory version is bumped to match the row.
    pub fn update(
        &self,
        tx: &mut OutboxTransaction<'_>,
        entry: &mut OutboxEntry,
    ) -> Result<(), OutboxError> {
        let affected = diesel::sql_query(&self.sql.update)
            .bind::<Timestamp, _>(entry.next_attempt_time.naive_utc())
            .bind::<Integer, _>(entry.attempts)
            .bind::<Bool, _>(entry.blocklisted)
            .bind::<Bool, _>(entry.processed)
            .bind::<Integer, _>(entry.version + 1)
            .bind::<Text, _>(entry.id.clone())
            .bind::<Integer, _>(entry.version)
            .execute(tx.connection())?;

        if affected != 1 {
            return Err(OutboxError::OptimisticLock);
        }
        entry.version += 1;
        debug!("Updated {}", entry.description());
        Ok(())
    }

    /// Deletes the entry, guarded by its version.
    pub fn delete(
        &self,
        tx: &mut OutboxTransaction<'_>,
        entry: &OutboxEntry,
    ) -> Result<(), OutboxError> {
        let affected = diesel::sql_query(&self.sql.delete)
            .bind::<Text, _>(entry.id.clone())
            .bind::<Integer, _>(entry.version)
            .execute(tx.connection())?;

        if affected != 1 {
            return Err(OutboxError::OptimisticLock);
        }
        debug!("Deleted {}", entry.description());
        Ok(())
    }

    /// Attempts to take the row lock for this entry at its current version.
    ///
    /// Returns `false` when the row is gone, has moved on to another
    /// version, is locked by another worker (`SKIP LOCKED`), or the wait
    /// exceeded the write lock timeout. Only real statement failures are
    /// errors.
    pub fn lock(
        &self,
        tx: &mut OutboxTransaction<'_>,
        entry: &OutboxEntry,
    ) -> Result<bool, OutboxError> {
        if let Some(sql) = self.dialect.lock_timeout_preface(self.write_lock_timeout) {
            diesel::sql_query(sql).execute(tx.connection())?;
        }

        let result = diesel::sql_query(&self.sql.lock)
            .bind::<Text, _>(entry.id.clone())
            .bind::<Integer, _>(entry.version)
            .get_results::<IdRow>(tx.connection());

        match result {
            Ok(rows) => {
                if let Some(sql) = self.dialect.lock_timeout_reset() {
                    diesel::sql_query(sql).execute(tx.connection())?;
                }
                Ok(!rows.is_empty())
            }
            // Lock-wait timeouts surface as backend-specific errors that
            // Diesel does not classify. The transaction is only used for
            // this lock attempt, so report the row as unavailable.
            Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::Unknown, info)) => {
                debug!(
                    "Lock attempt timed out on {}: {}",
                    entry.description(),
                    info.message()
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Un-blocklists an entry, resetting its attempt count.
    ///
    /// Only touches rows with `blocklisted = true AND processed = false`;
    /// returns whether a row changed. Repeated calls after the first
    /// success change nothing and return `false`.
    pub fn whitelist(
        &self,
        tx: &mut OutboxTransaction<'_>,
        entry_id: &str,
    ) -> Result<bool, OutboxError> {
        let affected = diesel::sql_query(&self.sql.whitelist)
            .bind::<Text, _>(entry_id.to_string())
            .execute(tx.connection())?;
        Ok(affected != 0)
    }

    /// Selects up to `batch_size` due entries, locking them where the
    /// dialect supports it.
    pub fn select_batch(
        &self,
        tx: &mut OutboxTransaction<'_>,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let rows: Vec<EntryRow> = diesel::sql_query(&self.sql.select_batch)
            .bind::<Timestamp, _>(now.naive_utc())
            .bind::<BigInt, _>(batch_size as i64)
            .get_results(tx.connection())?;

        debug!("Found {} due entries", rows.len());
        rows.into_iter().map(|row| self.map_row(row)).collect()
    }

    /// Bulk-deletes processed entries whose retention has expired, capped
    /// at `batch_size` rows. Never touches unprocessed or blocklisted rows.
    pub fn delete_processed_and_expired(
        &self,
        tx: &mut OutboxTransaction<'_>,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxError> {
        let deleted = diesel::sql_query(&self.sql.delete_expired)
            .bind::<Timestamp, _>(now.naive_utc())
            .bind::<BigInt, _>(batch_size as i64)
            .execute(tx.connection())?;
        if deleted > 0 {
            debug!("Reaped {} expired entries", deleted);
        }
        Ok(deleted)
    }

    /// Deletes every row. Test support; assumed low volume.
    pub fn clear(&self, tx: &mut OutboxTransaction<'_>) -> Result<(), OutboxError> {
        diesel::sql_query(&self.sql.clear).execute(tx.connection())?;
        Ok(())
    }

    fn map_row(&self, row: EntryRow) -> Result<OutboxEntry, OutboxError> {
        let invocation = self.serializer.deserialize(&row.invocation)?;
        Ok(OutboxEntry {
            id: row.id,
            unique_request_id: row.unique_request_id,
            invocation,
            next_attempt_time: truncate_to_micros(Utc.from_utc_datetime(&row.next_attempt_time)),
            attempts: row.attempts,
            blocklisted: row.blocklisted,
            processed: row.processed,
            version: row.version,
        })
    }
}

impl std::fmt::Debug for Persistor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistor")
            .field("dialect", &self.dialect)
            .field("table_name", &self.table_name)
            .field("write_lock_timeout", &self.write_lock_timeout)
            .finish()
    }
}
