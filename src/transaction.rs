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

//! Transaction management.
//!
//! [`TransactionManager::in_transaction_returns`] checks a connection out of
//! the pool, runs the caller's work inside a database transaction on the
//! pool's worker thread, and drains post-commit hooks after a successful
//! commit, before control returns to the caller. A rollback discards the
//! hooks along with the staged rows.
//!
//! Every hook carries the entry it submits. A panicking hook never reaches
//! the application: the panic is caught and reported to the listener as a
//! submission failure for that entry, which stays in the table for the
//! flusher.
//!
//! Savepoints opened inside the work closure (nested `conn.transaction`
//! calls) commit with the outermost transaction; hooks registered anywhere
//! inside fire once, after the outermost commit.

use crate::database::{AnyConnection, Database};
use crate::dialect::Dialect;
use crate::error::InvocationError;
use crate::listener::{self, OutboxListener};
use crate::models::entry::OutboxEntry;
use diesel::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

type SubmissionHook = Box<dyn FnOnce(OutboxEntry) + Send + 'static>;

/// A live outbox-aware transaction handed to work closures.
///
/// Wraps the raw connection (available for business SQL through
/// [`OutboxTransaction::connection`]) and collects post-commit hooks.
pub struct OutboxTransaction<'a> {
    conn: &'a mut AnyConnection,
    hooks: Vec<(OutboxEntry, SubmissionHook)>,
}

impl<'a> OutboxTransaction<'a> {
    pub(crate) fn new(conn: &'a mut AnyConnection) -> Self {
        Self {
            conn,
            hooks: Vec::new(),
        }
    }

    /// The underlying connection, inside the active transaction.
    pub fn connection(&mut self) -> &mut AnyConnection {
        self.conn
    }

    /// Registers `hook` to run with `entry` immediately after the
    /// transaction commits, in the committing context. Hooks must not
    /// assume they run at all: a rollback drops them.
    pub fn add_post_commit_hook(
        &mut self,
        entry: OutboxEntry,
        hook: impl FnOnce(OutboxEntry) + Send + 'static,
    ) {
        self.hooks.push((entry, Box::new(hook)));
    }
}

/// Starts transactions against the pooled database and owns the
/// post-commit hook protocol.
#[derive(Clone)]
pub struct TransactionManager {
    database: Database,
    dialect: Dialect,
    write_lock_timeout: Duration,
    listener: Arc<dyn OutboxListener>,
}

impl TransactionManager {
    pub fn new(
        database: Database,
        dialect: Dialect,
        write_lock_timeout: Duration,
        listener: Arc<dyn OutboxListener>,
    ) -> Self {
        Self {
            database,
            dialect,
            write_lock_timeout,
            listener,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Runs `work` inside a transaction and returns its result.
    ///
    /// On commit, hooks registered through
    /// [`OutboxTransaction::add_post_commit_hook`] run in registration
    /// order. A panicking hook is caught and reported to the listener as a
    /// submission failure; it never propagates into the caller.
    pub async fn in_transaction_returns<F, R>(&self, work: F) -> Result<R, crate::OutboxError>
    where
        F: FnOnce(&mut OutboxTransaction<'_>) -> Result<R, crate::OutboxError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.database.get().await?;
        let session_preface = self.dialect.session_preface(self.write_lock_timeout);

        let (result, hooks) = conn
            .interact(
                move |conn| -> Result<(R, Vec<(OutboxEntry, SubmissionHook)>), crate::OutboxError> {
                    for sql in session_preface {
                        diesel::sql_query(sql).execute(conn)?;
                    }

                    let mut hooks: Vec<(OutboxEntry, SubmissionHook)> = Vec::new();
                    let result = conn.transaction::<R, crate::OutboxError, _>(|conn| {
                        let mut tx = OutboxTransaction::new(conn);
                        let result = work(&mut tx)?;
                        hooks = tx.hooks;
                        Ok(result)
                    })?;

                    Ok((result, hooks))
                },
            )
            .await
            .map_err(|e| crate::OutboxError::Pool(e.to_string()))??;

        drain_hooks(&self.listener, hooks);

        Ok(result)
    }

    /// Runs `work` inside a transaction, discarding its result.
    pub async fn in_transaction<F>(&self, work: F) -> Result<(), crate::OutboxError>
    where
        F: FnOnce(&mut OutboxTransaction<'_>) -> Result<(), crate::OutboxError> + Send + 'static,
    {
        self.in_transaction_returns(work).await
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("dialect", &self.dialect)
            .field("write_lock_timeout", &self.write_lock_timeout)
            .finish()
    }
}

/// Runs the staged hooks after a successful commit. A panic in one hook is
/// reported to the listener as a submission failure for the entry the hook
/// carried; the remaining hooks still run.
fn drain_hooks(sink: &Arc<dyn OutboxListener>, hooks: Vec<(OutboxEntry, SubmissionHook)>) {
    for (entry, hook) in hooks {
        let staged = entry.clone();
        if catch_unwind(AssertUnwindSafe(move || hook(staged))).is_err() {
            warn!(
                "Post-commit hook panicked for {}; the flusher will pick the entry up",
                entry.description()
            );
            let cause =
                InvocationError::Aborted("post-commit submission hook panicked".to_string());
            listener::notify("submission failure", || sink.failure(&entry, &cause));
        }
    }
}
