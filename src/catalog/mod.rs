//! Local persistence for installed caves, install locations and queued
//! downloads. One SQLite file per daemon instance.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::config::DaemonConfig;
use crate::errors::{CoreError, Result};

pub mod queries;

#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Catalog {
    pub fn new(path: PathBuf) -> Result<Self> {
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = 100000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;",
        )?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)), path })
    }

    pub fn run_migrations(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(include_str!("../../migrations/001_initial.sql"))?;
        Ok(())
    }

    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Config("catalog lock poisoned".to_string()))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Opens (creating if needed) the catalog database under `config`'s data
/// directory and brings its schema up to date.
pub fn init(config: &DaemonConfig) -> Result<Catalog> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let catalog = Catalog::new(config.db_path())?;
    catalog.run_migrations()?;
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_catalog_applies_migrations_and_accepts_a_cave() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("caved.db")).unwrap();
        catalog.run_migrations().unwrap();

        let conn = catalog.connection().unwrap();
        conn.execute(
            "INSERT INTO install_locations (id, path, is_default, size_bytes) VALUES ('loc1', '/tmp/x', 1, 0)",
            [],
        )
        .unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM install_locations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("caved.db")).unwrap();
        catalog.run_migrations().unwrap();
        catalog.run_migrations().unwrap();
    }
}
