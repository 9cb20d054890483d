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

//! Schema migration.
//!
//! The schema is managed as an append-only sequence of versioned steps,
//! tracked in the `TXNO_VERSION` side table. Running migrations is
//! idempotent: steps at or below the recorded version are skipped, and the
//! whole catch-up runs in one transaction. Deployments that manage DDL
//! externally can disable this through the builder and apply equivalent
//! statements themselves.

use crate::database::AnyConnection;
use crate::dialect::Dialect;
use crate::error::OutboxError;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use tracing::info;

/// Side table recording the applied schema version.
pub const VERSION_TABLE: &str = "TXNO_VERSION";

#[derive(QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = Integer)]
    version: i32,
}

struct MigrationStep {
    version: i32,
    name: &'static str,
    statements: Vec<String>,
}

fn steps(dialect: Dialect, table: &str) -> Vec<MigrationStep> {
    let ts = dialect.timestamp_type();
    let int = dialect.integer_type();
    vec![
        MigrationStep {
            version: 1,
            name: "create outbox table",
            statements: vec![format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id VARCHAR(36) PRIMARY KEY, \
                 uniqueRequestId VARCHAR(250), \
                 invocation TEXT NOT NULL, \
                 nextAttemptTime {ts} NOT NULL, \
                 attempts {int} NOT NULL, \
                 blocklisted BOOLEAN NOT NULL, \
                 processed BOOLEAN NOT NULL, \
                 version {int} NOT NULL)"
            )],
        },
        MigrationStep {
            version: 2,
            name: "unique index for request deduplication",
            statements: vec![format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS IX_{table}_uniqueRequestId \
                 ON {table} (uniqueRequestId)"
            )],
        },
        MigrationStep {
            version: 3,
            name: "covering index for the flush scan",
            statements: vec![format!(
                "CREATE INDEX IF NOT EXISTS IX_{table}_flush \
                 ON {table} (processed, blocklisted, nextAttemptTime)"
            )],
        },
    ]
}

/// Applies any unapplied migration steps for `table`.
pub(crate) fn run_migrations(
    conn: &mut AnyConnection,
    dialect: Dialect,
    table: &str,
) -> Result<(), OutboxError> {
    diesel::sql_query(format!(
        "CREATE TABLE IF NOT EXISTS {VERSION_TABLE} (version INTEGER PRIMARY KEY)"
    ))
    .execute(conn)?;

    conn.transaction::<(), OutboxError, _>(|conn| {
        diesel::sql_query(format!(
            "INSERT INTO {VERSION_TABLE} (version) \
             SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {VERSION_TABLE})"
        ))
        .execute(conn)?;

        let current: i32 = diesel::sql_query(format!("SELECT version FROM {VERSION_TABLE}"))
            .get_result::<VersionRow>(conn)?
            .version;

        for step in steps(dialect, table) {
            if step.version <= current {
                continue;
            }
            for statement in &step.statements {
                diesel::sql_query(statement).execute(conn)?;
            }
            diesel::sql_query(format!(
                "UPDATE {VERSION_TABLE} SET version = {}",
                step.version
            ))
            .execute(conn)?;
            info!("Applied outbox migration {}: {}", step.version, step.name);
        }

        Ok(())
    })
}
