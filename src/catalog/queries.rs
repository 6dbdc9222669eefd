//! Typed row access for the catalog tables. Each entity gets its own trait
//! implemented for `Catalog`, a trait-per-entity shape rather than a single
//! reflective object-graph save.

use rusqlite::{params, OptionalExtension};

use crate::catalog::Catalog;
use crate::errors::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallLocationRow {
    pub id: String,
    pub path: String,
    pub is_default: bool,
    pub size_bytes: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaveRow {
    pub id: String,
    pub game_id: String,
    pub install_location_id: String,
    pub folder_name: String,
    pub upload_id: String,
    pub build_id: String,
    pub last_launched_at: Option<i64>,
    pub seconds_run: i64,
    pub pinned: bool,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadRow {
    pub id: String,
    pub cave_id: String,
    pub status: String,
    pub total_bytes: i64,
    pub done_bytes: i64,
    pub queue_position: i64,
    pub queued_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointRow {
    pub install_id: String,
    pub cave_id: Option<String>,
    pub staging_folder: String,
    pub strategy: Option<String>,
    pub checkpoint_json: String,
    pub updated_at: i64,
}

pub trait InstallLocationQueries {
    fn upsert_install_location(&self, location: &InstallLocationRow) -> Result<()>;
    fn get_install_locations(&self) -> Result<Vec<InstallLocationRow>>;
    fn get_default_install_location(&self) -> Result<Option<InstallLocationRow>>;
}

pub trait CaveQueries {
    fn upsert_cave(&self, cave: &CaveRow) -> Result<()>;
    fn get_cave(&self, cave_id: &str) -> Result<Option<CaveRow>>;
    fn get_caves_for_game(&self, game_id: &str) -> Result<Vec<CaveRow>>;
    fn list_caves(&self) -> Result<Vec<CaveRow>>;
    fn record_launch(&self, cave_id: &str, launched_at: i64, seconds_run_delta: i64) -> Result<()>;
    fn remove_cave(&self, cave_id: &str) -> Result<()>;
}

pub trait DownloadQueries {
    fn upsert_download(&self, download: &DownloadRow) -> Result<()>;
    fn get_downloads(&self) -> Result<Vec<DownloadRow>>;
    fn remove_download(&self, download_id: &str) -> Result<()>;
}

pub trait CheckpointQueries {
    fn upsert_checkpoint(&self, checkpoint: &CheckpointRow) -> Result<()>;
    fn get_checkpoint(&self, install_id: &str) -> Result<Option<CheckpointRow>>;
    fn remove_checkpoint(&self, install_id: &str) -> Result<()>;
}

pub trait SettingsQueries {
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn delete_setting(&self, key: &str) -> Result<()>;
}

impl InstallLocationQueries for Catalog {
    fn upsert_install_location(&self, location: &InstallLocationRow) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO install_locations (id, path, is_default, size_bytes)
             VALUES (?1, ?2, ?3, ?4)",
            params![location.id, location.path, location.is_default as i64, location.size_bytes],
        )?;
        Ok(())
    }

    fn get_install_locations(&self) -> Result<Vec<InstallLocationRow>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, path, is_default, size_bytes FROM install_locations ORDER BY path",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(InstallLocationRow {
                id: row.get(0)?,
                path: row.get(1)?,
                is_default: row.get::<_, i64>(2)? > 0,
                size_bytes: row.get(3)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_default_install_location(&self) -> Result<Option<InstallLocationRow>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT id, path, is_default, size_bytes FROM install_locations WHERE is_default = 1 LIMIT 1",
            [],
            |row| {
                Ok(InstallLocationRow {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    is_default: row.get::<_, i64>(2)? > 0,
                    size_bytes: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }
}

impl CaveQueries for Catalog {
    fn upsert_cave(&self, cave: &CaveRow) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO caves (
                id, game_id, install_location_id, folder_name, upload_id, build_id,
                last_launched_at, seconds_run, pinned, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                cave.id,
                cave.game_id,
                cave.install_location_id,
                cave.folder_name,
                cave.upload_id,
                cave.build_id,
                cave.last_launched_at,
                cave.seconds_run,
                cave.pinned as i64,
                cave.created_at,
            ],
        )?;
        Ok(())
    }

    fn get_cave(&self, cave_id: &str) -> Result<Option<CaveRow>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT id, game_id, install_location_id, folder_name, upload_id, build_id,
                    last_launched_at, seconds_run, pinned, created_at
             FROM caves WHERE id = ?1",
            params![cave_id],
            row_to_cave,
        )
        .optional()
        .map_err(Into::into)
    }

    fn get_caves_for_game(&self, game_id: &str) -> Result<Vec<CaveRow>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, game_id, install_location_id, folder_name, upload_id, build_id,
                    last_launched_at, seconds_run, pinned, created_at
             FROM caves WHERE game_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![game_id], row_to_cave)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn list_caves(&self) -> Result<Vec<CaveRow>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, game_id, install_location_id, folder_name, upload_id, build_id,
                    last_launched_at, seconds_run, pinned, created_at
             FROM caves ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_cave)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn record_launch(&self, cave_id: &str, launched_at: i64, seconds_run_delta: i64) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE caves SET last_launched_at = ?1, seconds_run = seconds_run + ?2 WHERE id = ?3",
            params![launched_at, seconds_run_delta, cave_id],
        )?;
        Ok(())
    }

    fn remove_cave(&self, cave_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM caves WHERE id = ?1", params![cave_id])?;
        Ok(())
    }
}

fn row_to_cave(row: &rusqlite::Row) -> rusqlite::Result<CaveRow> {
    Ok(CaveRow {
        id: row.get(0)?,
        game_id: row.get(1)?,
        install_location_id: row.get(2)?,
        folder_name: row.get(3)?,
        upload_id: row.get(4)?,
        build_id: row.get(5)?,
        last_launched_at: row.get(6)?,
        seconds_run: row.get(7)?,
        pinned: row.get::<_, i64>(8)? > 0,
        created_at: row.get(9)?,
    })
}

impl DownloadQueries for Catalog {
    fn upsert_download(&self, download: &DownloadRow) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO downloads (
                id, cave_id, status, total_bytes, done_bytes, queue_position, queued_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                download.id,
                download.cave_id,
                download.status,
                download.total_bytes,
                download.done_bytes,
                download.queue_position,
                download.queued_at,
            ],
        )?;
        Ok(())
    }

    fn get_downloads(&self) -> Result<Vec<DownloadRow>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, cave_id, status, total_bytes, done_bytes, queue_position, queued_at
             FROM downloads ORDER BY queue_position ASC, queued_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DownloadRow {
                id: row.get(0)?,
                cave_id: row.get(1)?,
                status: row.get(2)?,
                total_bytes: row.get(3)?,
                done_bytes: row.get(4)?,
                queue_position: row.get(5)?,
                queued_at: row.get(6)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn remove_download(&self, download_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM downloads WHERE id = ?1", params![download_id])?;
        Ok(())
    }
}

impl CheckpointQueries for Catalog {
    fn upsert_checkpoint(&self, checkpoint: &CheckpointRow) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO install_checkpoints (
                install_id, cave_id, staging_folder, strategy, checkpoint_json, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkpoint.install_id,
                checkpoint.cave_id,
                checkpoint.staging_folder,
                checkpoint.strategy,
                checkpoint.checkpoint_json,
                checkpoint.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_checkpoint(&self, install_id: &str) -> Result<Option<CheckpointRow>> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT install_id, cave_id, staging_folder, strategy, checkpoint_json, updated_at
             FROM install_checkpoints WHERE install_id = ?1",
            params![install_id],
            |row| {
                Ok(CheckpointRow {
                    install_id: row.get(0)?,
                    cave_id: row.get(1)?,
                    staging_folder: row.get(2)?,
                    strategy: row.get(3)?,
                    checkpoint_json: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    fn remove_checkpoint(&self, install_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM install_checkpoints WHERE install_id = ?1", params![install_id])?;
        Ok(())
    }
}

impl SettingsQueries for Catalog {
    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(Into::into)
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn open() -> Catalog {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(dir.path().join("caved.db")).unwrap();
        catalog.run_migrations().unwrap();
        std::mem::forget(dir);
        catalog
    }

    #[test]
    fn cave_round_trips_through_upsert_and_get() {
        let catalog = open();
        catalog
            .upsert_install_location(&InstallLocationRow {
                id: "loc1".into(),
                path: "/games".into(),
                is_default: true,
                size_bytes: 0,
            })
            .unwrap();
        let cave = CaveRow {
            id: "cave1".into(),
            game_id: "game1".into(),
            install_location_id: "loc1".into(),
            folder_name: "my-game".into(),
            upload_id: "u1".into(),
            build_id: "b1".into(),
            last_launched_at: None,
            seconds_run: 0,
            pinned: false,
            created_at: 1000,
        };
        catalog.upsert_cave(&cave).unwrap();
        let fetched = catalog.get_cave("cave1").unwrap().unwrap();
        assert_eq!(fetched, cave);

        catalog.record_launch("cave1", 2000, 30).unwrap();
        let after = catalog.get_cave("cave1").unwrap().unwrap();
        assert_eq!(after.last_launched_at, Some(2000));
        assert_eq!(after.seconds_run, 30);
    }

    #[test]
    fn settings_delete_removes_the_key() {
        let catalog = open();
        catalog.set_setting("theme", "dark").unwrap();
        assert_eq!(catalog.get_setting("theme").unwrap(), Some("dark".to_string()));
        catalog.delete_setting("theme").unwrap();
        assert_eq!(catalog.get_setting("theme").unwrap(), None);
    }

    #[test]
    fn checkpoint_round_trips() {
        let catalog = open();
        let checkpoint = CheckpointRow {
            install_id: "install1".into(),
            cave_id: Some("cave1".into()),
            staging_folder: "/tmp/staging/install1".into(),
            strategy: Some("fresh-install".into()),
            checkpoint_json: "{}".into(),
            updated_at: 42,
        };
        catalog.upsert_checkpoint(&checkpoint).unwrap();
        assert_eq!(catalog.get_checkpoint("install1").unwrap(), Some(checkpoint));
        catalog.remove_checkpoint("install1").unwrap();
        assert_eq!(catalog.get_checkpoint("install1").unwrap(), None);
    }
}
