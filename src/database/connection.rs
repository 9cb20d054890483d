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

//! Database connection management supporting both PostgreSQL and SQLite.
//!
//! A single async connection pool (`deadpool-diesel`) hands out
//! [`AnyConnection`] values; the actual backend is selected at runtime from
//! the connection URL via Diesel's `MultiConnection` derive. All database
//! work runs on the pool's blocking worker threads through `interact`.

use crate::error::OutboxError;
use tracing::info;

#[cfg(feature = "postgres")]
use diesel::PgConnection;
#[cfg(feature = "sqlite")]
use diesel::SqliteConnection;

/// URL schemes that name a PostgreSQL server.
#[cfg(feature = "postgres")]
const POSTGRES_SCHEMES: [&str; 2] = ["postgres://", "postgresql://"];

/// Which database engine a connection URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    #[cfg(feature = "postgres")]
    Postgres,
    #[cfg(feature = "sqlite")]
    Sqlite,
}

impl BackendType {
    /// Classifies a connection URL as one of the enabled backends.
    ///
    /// # Panics
    /// Panics when no enabled backend claims the URL.
    pub fn from_url(url: &str) -> Self {
        #[cfg(feature = "postgres")]
        if POSTGRES_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            return BackendType::Postgres;
        }

        #[cfg(feature = "sqlite")]
        if is_sqlite_url(url) {
            return BackendType::Sqlite;
        }

        panic!(
            "cannot infer a database backend from `{url}`; pass a postgres:// \
             or postgresql:// server URL, an sqlite:// URL, the :memory: \
             marker, or a path to a database file"
        );
    }
}

/// A URL is taken for SQLite when it carries the explicit scheme, names the
/// in-memory database, looks like a filesystem path, or is a bare file name
/// with a database extension.
#[cfg(feature = "sqlite")]
fn is_sqlite_url(url: &str) -> bool {
    const SQLITE_PREFIXES: [&str; 4] = ["sqlite://", "/", "./", "../"];
    const SQLITE_EXTENSIONS: [&str; 3] = [".db", ".sqlite", ".sqlite3"];

    url == ":memory:"
        || SQLITE_PREFIXES.iter().any(|prefix| url.starts_with(prefix))
        || SQLITE_EXTENSIONS.iter().any(|ext| url.ends_with(ext))
}

/// The connection type handed out by the pool.
///
/// Diesel's `MultiConnection` derive turns the enum into a full
/// `Connection` whose active variant is fixed when `establish` opens the
/// URL; every statement afterwards dispatches to that variant. PostgreSQL
/// is listed first so server URLs are tried before the SQLite fallback.
#[derive(diesel::MultiConnection)]
pub enum AnyConnection {
    #[cfg(feature = "postgres")]
    Postgres(PgConnection),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteConnection),
}

/// The async connection pool type.
pub type DbPool = deadpool::managed::Pool<deadpool_diesel::Manager<AnyConnection>>;

/// A connection checked out of the pool. Database work is submitted with
/// `conn.interact(|conn| ...)`.
pub type PooledConnection = deadpool::managed::Object<deadpool_diesel::Manager<AnyConnection>>;

/// A pool of database connections with runtime backend selection.
///
/// `Database` is `Clone`; each clone references the same underlying pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    backend: BackendType,
    url: String,
}

impl Database {
    /// Builds the pool for `connection_string`, classifying the backend
    /// from the URL shape (see [`BackendType::from_url`]).
    ///
    /// # Panics
    /// Panics on an unrecognized URL or when the pool cannot be
    /// constructed.
    pub fn new(connection_string: &str, max_size: usize) -> Self {
        let backend = BackendType::from_url(connection_string);
        let connection_url = Self::normalize_url(connection_string, backend);

        let manager = deadpool_diesel::Manager::<AnyConnection>::new(
            connection_url.clone(),
            deadpool_diesel::Runtime::Tokio1,
        );
        let pool = DbPool::builder(manager)
            .max_size(max_size)
            .build()
            .expect("Failed to create database connection pool");

        info!("Connection pool initialized ({:?}, max_size={})", backend, max_size);

        Self {
            pool,
            backend,
            url: connection_url,
        }
    }

    /// Returns the detected backend type.
    pub fn backend(&self) -> BackendType {
        self.backend
    }

    /// Returns the normalized connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Checks a connection out of the pool.
    pub async fn get(&self) -> Result<PooledConnection, OutboxError> {
        self.pool
            .get()
            .await
            .map_err(|e| OutboxError::Pool(e.to_string()))
    }

    fn normalize_url(connection_string: &str, backend: BackendType) -> String {
        match backend {
            #[cfg(feature = "postgres")]
            BackendType::Postgres => connection_string.to_string(),
            #[cfg(feature = "sqlite")]
            BackendType::Sqlite => {
                // Diesel opens SQLite databases by bare path, not by URL.
                connection_string
                    .strip_prefix("sqlite://")
                    .unwrap_or(connection_string)
                    .to_string()
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend)
            .finish()
    }
}
