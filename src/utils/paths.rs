//! Directory resolution backing [`crate::config::DaemonConfig`]'s
//! `root_dir`/`data_dir`/`cache_dir`/`log_dir`/`staging_root` accessors. A
//! GUI front-end would resolve these against an app handle; a daemon has
//! none, so resolution runs off `DaemonConfig::configured_root()` plus
//! `CAVED_ROOT_DIR`/portable-root detection, an env-override-then-fallback
//! chain.

use std::path::{Path, PathBuf};

use crate::config::DaemonConfig;

fn ensure_dir(path: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() {
        return None;
    }
    if std::fs::create_dir_all(path).is_ok() {
        return Some(path.to_path_buf());
    }
    None
}

fn is_portable_root(path: &Path) -> bool {
    path.join("portable.config.json").exists()
}

pub fn resolve_root_dir(config: &DaemonConfig) -> PathBuf {
    let configured = config.configured_root();
    if let Some(dir) = ensure_dir(&configured) {
        return dir;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if is_portable_root(dir) {
                return dir.to_path_buf();
            }
        }
    }

    PathBuf::from(".")
}

pub fn resolve_data_dir(config: &DaemonConfig) -> PathBuf {
    let root = resolve_root_dir(config);
    ensure_dir(&root.join("data")).unwrap_or(root)
}

pub fn resolve_cache_dir(config: &DaemonConfig) -> PathBuf {
    let root = resolve_root_dir(config);
    if is_portable_root(&root) {
        let candidates = [root.join("caved").join("cached"), root.join("cached"), root.join("cache")];
        for candidate in candidates {
            if let Some(dir) = ensure_dir(&candidate) {
                return dir;
            }
        }
    }
    ensure_dir(&root.join("cache")).unwrap_or_else(|| PathBuf::from("cache"))
}

pub fn resolve_staging_dir(config: &DaemonConfig) -> PathBuf {
    let cache = resolve_cache_dir(config);
    ensure_dir(&cache.join("staging")).unwrap_or_else(|| cache.join("staging"))
}

pub fn resolve_log_dir(config: &DaemonConfig) -> PathBuf {
    let root = resolve_root_dir(config);
    if let Some(found) = ensure_dir(&root.join("logs")) {
        return found;
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let fallback = dir.join("logs");
            if let Some(found) = ensure_dir(&fallback) {
                return found;
            }
        }
    }

    PathBuf::from("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;

    fn config_with_root(root: PathBuf) -> DaemonConfig {
        DaemonConfig {
            json: false,
            transport: Transport::Tcp,
            address: "127.0.0.1:0".into(),
            keep_alive: false,
            dbpath: None,
            destiny_pids: vec![],
            root_dir: Some(root),
        }
    }

    #[test]
    fn resolves_nested_dirs_under_a_custom_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_root(dir.path().to_path_buf());
        assert_eq!(resolve_root_dir(&config), dir.path());
        assert!(resolve_data_dir(&config).starts_with(dir.path()));
        assert!(resolve_cache_dir(&config).starts_with(dir.path()));
        assert!(resolve_staging_dir(&config).ends_with("staging"));
    }
}
