//! Schema versioning for the history database.
//!
//! The schema version is SQLite's `user_version` pragma. Pending migrations
//! run in order, each inside its own transaction together with the version
//! bump. Migrations are additive: they create the collection and its indexes
//! when absent and never rewrite existing rows.

use rusqlite::Connection;
use tracing::info;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "create_extraction_history",
    sql: include_str!("sql/001_create_extraction_history.sql"),
}];

/// Schema version a fully migrated database reports.
pub const SCHEMA_VERSION: u32 = 1;

/// Current `user_version` of the database.
pub fn schema_version(conn: &Connection) -> Result<u32, rusqlite::Error> {
    conn.query_row("PRAGMA user_version", [], |r| r.get(0))
}

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    let current = schema_version(conn)?;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }

        info!(
            "Running migration v{}: {}",
            migration.version, migration.description
        );

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'index' AND tbl_name = 'extraction_history'
                 ORDER BY name",
            )
            .unwrap();
        stmt.query_map([], |r| r.get::<_, String>(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn migrations_run_on_fresh_db() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_all(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let names = index_names(&conn);
        assert!(names.contains(&"idx_extraction_history_state".to_string()));
        assert!(names.contains(&"idx_extraction_history_upload_date".to_string()));
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_all(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO extraction_history (state, upload_date) VALUES ('uploaded', '2024-01-01')",
            [],
        )
        .unwrap();

        // Running again must not touch existing data.
        run_all(&mut conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM extraction_history", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn existing_table_without_indexes_gains_them() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE extraction_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                state TEXT NOT NULL,
                upload_date TEXT NOT NULL,
                pdf_data TEXT,
                fields_data TEXT,
                attributes TEXT NOT NULL DEFAULT '{}'
            );",
        )
        .unwrap();

        run_all(&mut conn).unwrap();
        assert_eq!(index_names(&conn).len(), 2);
    }
}
