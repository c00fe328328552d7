//! Trust store schema migrations.
//!
//! The schema ships as SQL files compiled into the binary and applied in
//! order when a store opens. `_bindery_migrations` records what has run, so
//! reopening an existing database only applies the files added since.

use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

const TRACKING_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS _bindery_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// Schema history, oldest first. Append only.
const SCHEMA: &[Migration] = &[
    Migration {
        name: "000_init",
        sql: include_str!("migrations/000_init.sql"),
    },
    Migration {
        name: "001_trust_groups",
        sql: include_str!("migrations/001_trust_groups.sql"),
    },
    Migration {
        name: "002_trusted_devices",
        sql: include_str!("migrations/002_trusted_devices.sql"),
    },
    Migration {
        name: "003_save_checkpoints",
        sql: include_str!("migrations/003_save_checkpoints.sql"),
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

impl MigrationError {
    fn failed(name: &str) -> impl FnOnce(rusqlite::Error) -> Self + '_ {
        move |source| Self::ExecutionFailed {
            name: name.to_string(),
            source,
        }
    }
}

/// Brings the trust store schema up to date and returns how many
/// migrations were applied.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply_pending(conn, SCHEMA)
}

fn apply_pending(conn: &Connection, schema: &[Migration]) -> Result<usize, MigrationError> {
    conn.execute_batch(TRACKING_TABLE_SQL)
        .map_err(MigrationError::failed("_bindery_migrations"))?;

    let mut applied = 0;
    for migration in schema {
        if is_applied(conn, migration.name)? {
            continue;
        }
        apply(conn, migration)?;
        applied += 1;
    }
    if applied > 0 {
        tracing::info!(applied, total = schema.len(), "trust store schema updated");
    }
    Ok(applied)
}

fn is_applied(conn: &Connection, name: &str) -> Result<bool, MigrationError> {
    conn.query_row(
        "SELECT 1 FROM _bindery_migrations WHERE name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(MigrationError::StateQuery)
}

/// Runs one migration and its tracking row in a single transaction.
fn apply(conn: &Connection, migration: &Migration) -> Result<(), MigrationError> {
    tracing::info!(migration = migration.name, "applying migration");
    let tx = conn
        .unchecked_transaction()
        .map_err(MigrationError::failed(migration.name))?;
    tx.execute_batch(migration.sql)
        .map_err(MigrationError::failed(migration.name))?;
    tx.execute(
        "INSERT INTO _bindery_migrations (name) VALUES (?1)",
        [migration.name],
    )
    .map_err(MigrationError::failed(migration.name))?;
    tx.commit().map_err(MigrationError::failed(migration.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM _bindery_migrations ORDER BY id")
            .expect("prepare");
        let names = stmt
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<Vec<String>, _>>()
            .expect("rows");
        names
    }

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )
        .expect("query sqlite_master")
    }

    #[test]
    fn fresh_store_gets_the_whole_schema_once() {
        let conn = Connection::open_in_memory().expect("open");
        assert_eq!(run_migrations(&conn).expect("first run"), SCHEMA.len());
        assert_eq!(run_migrations(&conn).expect("second run"), 0);

        let expected: Vec<&str> = SCHEMA.iter().map(|m| m.name).collect();
        assert_eq!(applied_names(&conn), expected);
        assert!(table_exists(&conn, "trust_groups"));
        assert!(table_exists(&conn, "trusted_devices"));
    }

    #[test]
    fn older_store_only_gets_newer_migrations() {
        let conn = Connection::open_in_memory().expect("open");
        assert_eq!(apply_pending(&conn, &SCHEMA[..2]).expect("old schema"), 2);
        assert!(!table_exists(&conn, "trusted_devices"));

        assert_eq!(run_migrations(&conn).expect("upgrade"), SCHEMA.len() - 2);
        assert!(table_exists(&conn, "trusted_devices"));
    }

    #[test]
    fn broken_migration_is_not_recorded() {
        let conn = Connection::open_in_memory().expect("open");
        let schema = [
            Migration {
                name: "000_devices",
                sql: "CREATE TABLE devices (udid TEXT PRIMARY KEY);",
            },
            Migration {
                name: "001_half_done",
                sql: "CREATE TABLE groups_v2 (id TEXT); INSERT INTO missing_table VALUES (1);",
            },
        ];

        match apply_pending(&conn, &schema).unwrap_err() {
            MigrationError::ExecutionFailed { name, .. } => assert_eq!(name, "001_half_done"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(applied_names(&conn), vec!["000_devices"]);
        assert!(table_exists(&conn, "devices"));
        assert!(!table_exists(&conn, "groups_v2"));
    }

    #[test]
    fn trusted_devices_cascade_with_group() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("enable foreign keys");
        run_migrations(&conn).expect("migrate");

        conn.execute(
            "INSERT INTO trust_groups (os_account_id, group_id, group_name, group_type, owner)
             VALUES (100, 'G1', 'home', 256, 'app')",
            [],
        )
        .expect("insert group");
        conn.execute(
            "INSERT INTO trusted_devices
             (os_account_id, group_id, udid, auth_id, user_type, service_type, updated_at)
             VALUES (100, 'G1', 'D1', 'D1', 0, 'G1', '2026-01-01T00:00:00Z')",
            [],
        )
        .expect("insert device");
        conn.execute("DELETE FROM trust_groups WHERE group_id = 'G1'", [])
            .expect("delete group");

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM trusted_devices", [], |row| row.get(0))
            .expect("count devices");
        assert_eq!(remaining, 0);
    }
}
