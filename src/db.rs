//! SQLite persistence gateway
//!
//! Owns the connection configuration for the single writer and the
//! read-only pool, the forward-only migration runner, and the backup
//! mechanism. The database lives in a single file; WAL journaling lets the
//! read-only pool run concurrently with the one writer.

use std::path::Path;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use crate::error::Result;

/// Database filename inside the data directory.
pub(crate) const DB_FILENAME: &str = "db.sqlite";

/// Maximum number of read-only connections kept in the pool.
pub(crate) const READ_POOL_SIZE: u32 = 16;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered, forward-only migrations. Never reorder or edit an entry that
/// has shipped; append a new numbered file instead.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: include_str!("../migrations/0001_initial.sql"),
    },
    Migration {
        version: 2,
        name: "blocks_and_transactions",
        sql: include_str!("../migrations/0002_blocks_and_transactions.sql"),
    },
    Migration {
        version: 3,
        name: "query_indexes",
        sql: include_str!("../migrations/0003_query_indexes.sql"),
    },
];

/// Open the single read-write connection.
///
/// SQLite supports only one concurrent writer, so the caller must keep this
/// connection behind the block lock. WAL journaling allows the read-only
/// pool to keep serving queries while a block transaction is open.
pub(crate) fn open_read_write(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.set_prepared_statement_cache_capacity(64);
    Ok(conn)
}

/// Build the read-only connection pool over the same database file.
pub(crate) fn open_read_pool(path: &Path) -> Result<r2d2::Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .with_init(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.set_prepared_statement_cache_capacity(64);
            Ok(())
        });
    let pool = r2d2::Pool::builder()
        .max_size(READ_POOL_SIZE)
        .min_idle(Some(4))
        .build(manager)?;
    Ok(pool)
}

/// Whether any migration beyond the stored schema version is pending.
pub(crate) fn migrations_pending(conn: &Connection) -> Result<bool> {
    let version = schema_version(conn)?;
    Ok(MIGRATIONS.iter().any(|m| m.version > version))
}

/// Apply all pending migrations in order, each inside its own transaction.
/// Returns the number of migrations applied.
pub(crate) fn run_migrations(conn: &Connection) -> Result<usize> {
    let mut applied = 0;
    for migration in MIGRATIONS {
        if migration.version <= schema_version(conn)? {
            continue;
        }
        info!(
            version = migration.version,
            name = migration.name,
            "applying schema migration"
        );
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = conn.execute_batch(migration.sql).and_then(|()| {
            conn.pragma_update(None, "user_version", migration.version)
        });
        match result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
        }
        applied += 1;
    }
    debug!(applied, "schema migrations up to date");
    Ok(applied)
}

/// Refresh the query planner statistics.
pub(crate) fn analyze(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA analysis_limit=1000; ANALYZE")?;
    Ok(())
}

/// Write a consistent snapshot of the database to `path`.
///
/// Uses `VACUUM INTO`, so the output is itself a valid database file and
/// in-flight writes are fenced by SQLite before the copy starts.
pub(crate) fn vacuum_into(conn: &Connection, path: &Path) -> Result<()> {
    let dest = path.to_string_lossy();
    conn.execute("VACUUM INTO ?1", [dest.as_ref()])?;
    Ok(())
}

fn schema_version(conn: &Connection) -> Result<i64> {
    let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}
