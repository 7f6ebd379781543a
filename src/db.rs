use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "catalog database ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

/// Private in-memory database with the full schema applied.
pub fn open_in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    configure(&connection)?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn configure(connection: &Connection) -> AppResult<()> {
    // journal_mode returns a row, so it cannot go through execute().
    connection.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    connection.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_places (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider TEXT,
            external_id TEXT,
            name TEXT NOT NULL,
            formatted_address TEXT,
            lat REAL NOT NULL,
            lng REAL NOT NULL,
            categories TEXT NOT NULL DEFAULT '[]',
            rating REAL,
            rating_count INTEGER NOT NULL DEFAULT 0,
            price_level INTEGER,
            operational_status TEXT,
            photo_urls TEXT NOT NULL DEFAULT '[]',
            source TEXT NOT NULL CHECK (source IN ('provider_import', 'manual')),
            imported_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            ownership_status TEXT NOT NULL DEFAULT 'imported' CHECK (
                ownership_status IN ('imported', 'claimed', 'pending_verification', 'verified', 'rejected')
            ),
            claim_email TEXT,
            claim_phone TEXT,
            claim_justification TEXT,
            claimed_at TEXT,
            verified_by TEXT,
            decision_notes TEXT,
            decided_at TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            CHECK ((ownership_status = 'imported') = (claimed_at IS NULL)),
            CHECK ((external_id IS NULL) = (provider IS NULL))
        );

        CREATE TABLE IF NOT EXISTS import_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            location TEXT NOT NULL,
            radius_meters INTEGER NOT NULL,
            category TEXT,
            max_results INTEGER NOT NULL,
            dry_run INTEGER NOT NULL DEFAULT 0 CHECK (dry_run IN (0, 1)),
            status TEXT NOT NULL DEFAULT 'running' CHECK (status IN ('running', 'completed', 'failed')),
            total_found INTEGER NOT NULL DEFAULT 0,
            new_places INTEGER NOT NULL DEFAULT 0,
            updated_places INTEGER NOT NULL DEFAULT 0,
            skipped_places INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS import_job_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER NOT NULL,
            message TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES import_jobs(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS claim_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            place_id INTEGER NOT NULL,
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            actor TEXT NOT NULL,
            notes TEXT,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (place_id) REFERENCES catalog_places(id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_catalog_provider_external
            ON catalog_places(provider, external_id) WHERE external_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_catalog_lat_lng ON catalog_places(lat, lng);
        CREATE INDEX IF NOT EXISTS idx_job_errors_job ON import_job_errors(job_id);
        CREATE INDEX IF NOT EXISTS idx_claim_events_place ON claim_events(place_id);
        "#,
    )?;

    ensure_column(connection, "import_jobs", "provider TEXT")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "test.db").unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('catalog_places','import_jobs','import_job_errors','claim_events')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 4);
        assert!(ctx.path.ends_with("test.db"));
        assert!(column_exists(&ctx.connection, "import_jobs", "provider").unwrap());
    }

    #[test]
    fn migrations_are_repeatable() {
        let dir = tempdir().unwrap();
        drop(bootstrap(dir.path(), "again.db").unwrap());
        let ctx = bootstrap(dir.path(), "again.db").unwrap();
        run_migrations(&ctx.connection).unwrap();
    }

    #[test]
    fn rejects_claim_metadata_on_imported_rows() {
        let conn = open_in_memory().unwrap();
        let result = conn.execute(
            "INSERT INTO catalog_places (name, lat, lng, source, imported_at, updated_at, ownership_status, claimed_at)
             VALUES ('Bar', 1.0, 2.0, 'manual', DATETIME('now'), DATETIME('now'), 'imported', DATETIME('now'))",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn enforces_unique_external_ids() {
        let conn = open_in_memory().unwrap();
        let insert = "INSERT INTO catalog_places (provider, external_id, name, lat, lng, source, imported_at, updated_at)
             VALUES ('google_places', 'A', 'Bar', 1.0, 2.0, 'provider_import', DATETIME('now'), DATETIME('now'))";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
