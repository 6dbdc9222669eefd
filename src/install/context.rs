//! Per-operation workspace: a staging folder holding the meta/install
//! subcontexts and a cooperative lock over the install folder.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, Result};
use crate::install::events::Event;
use crate::upload::Host;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStrategy {
    FreshInstall,
    Upgrade,
    Heal,
}

impl InstallStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            InstallStrategy::FreshInstall => "fresh-install",
            InstallStrategy::Upgrade => "upgrade",
            InstallStrategy::Heal => "heal",
        }
    }
}

/// Input params fixed for the lifetime of one install operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetaSubcontext {
    pub game_id: String,
    pub upload_id: String,
    pub build_id: String,
    pub install_folder: PathBuf,
    pub from_build: Option<String>,
    pub host: Host,
}

/// Resumable state, persisted at every transition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstallSubcontext {
    pub has_listed: bool,
    pub refreshed_game: bool,
    pub is_available_locally: bool,
    pub first_install_result: Option<String>,
    pub using_heal_fallback: bool,
    pub events: Vec<Event>,
}

impl InstallSubcontext {
    pub fn push_event(&mut self, event: Event) {
        self.events.push(event);
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallContext {
    pub id: String,
    pub staging_folder: PathBuf,
    pub meta: MetaSubcontext,
    pub install: InstallSubcontext,
    pub strategy: Option<InstallStrategy>,
}

impl InstallContext {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.staging_folder.join("install-checkpoint.json")
    }

    /// Persists the context before any side effect that cannot be undone.
    pub fn checkpoint(&self) -> Result<()> {
        fs::create_dir_all(&self.staging_folder)?;
        let body = serde_json::to_vec_pretty(self)?;
        crate::utils::file::write_atomic(&self.checkpoint_path(), &body)?;
        Ok(())
    }

    pub fn load(staging_folder: &Path) -> Result<Option<Self>> {
        let path = staging_folder.join("install-checkpoint.json");
        if !path.exists() {
            return Ok(None);
        }
        let body = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    pub fn retire(&self) -> Result<()> {
        if self.staging_folder.exists() {
            fs::remove_dir_all(&self.staging_folder)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub reason: String,
}

fn lock_path(install_folder: &Path) -> PathBuf {
    install_folder.join(".cave-lock")
}

/// Acquires the cooperative lock over `install_folder`, failing with
/// `CoreError::LockHeld` if another live process holds it. A lock held by a
/// dead pid can be stolen.
pub fn acquire_lock(install_folder: &Path, pid: u32, reason: &str) -> Result<()> {
    let path = lock_path(install_folder);
    if let Some(existing) = read_lock(&path)? {
        if existing.pid != pid && pid_is_alive(existing.pid) {
            return Err(CoreError::LockHeld { pid: existing.pid, reason: existing.reason });
        }
    }
    fs::create_dir_all(install_folder)?;
    let body = serde_json::to_vec(&LockInfo { pid, reason: reason.to_string() })?;
    crate::utils::file::write_atomic(&path, &body)?;
    Ok(())
}

pub fn release_lock(install_folder: &Path) -> Result<()> {
    let path = lock_path(install_folder);
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

fn read_lock(path: &Path) -> Result<Option<LockInfo>> {
    if !path.exists() {
        return Ok(None);
    }
    let body = fs::read(path)?;
    Ok(serde_json::from_slice(&body).ok())
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    // No portable liveness probe without an extra dependency; assume alive
    // so a concurrent install is never silently overwritten on these
    // platforms.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = InstallContext {
            id: "install-1".into(),
            staging_folder: dir.path().join("staging"),
            meta: MetaSubcontext {
                game_id: "g1".into(),
                upload_id: "u1".into(),
                build_id: "b1".into(),
                install_folder: dir.path().join("installed"),
                from_build: None,
                host: Host { os: crate::upload::Os::Linux, is64: true },
            },
            install: InstallSubcontext::default(),
            strategy: Some(InstallStrategy::FreshInstall),
        };
        ctx.checkpoint().unwrap();
        let loaded = InstallContext::load(&ctx.staging_folder).unwrap().unwrap();
        assert_eq!(loaded.id, "install-1");
        assert_eq!(loaded.strategy, Some(InstallStrategy::FreshInstall));
    }

    #[test]
    fn lock_blocks_a_second_live_pid_but_allows_the_same_pid() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("installed");
        acquire_lock(&folder, std::process::id(), "install").unwrap();
        assert!(acquire_lock(&folder, std::process::id(), "install").is_ok());
        release_lock(&folder).unwrap();
    }
}
