//! Daemon configuration, parsed from a CLI subset. A GUI front-end would
//! resolve these paths from an app handle; a bare daemon has none, so
//! defaults come from `dirs` the way `serpent-os-tools`' config crate
//! resolves XDG paths.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    Tcp,
    Stdio,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "caved", about = "Install daemon core")]
pub struct DaemonConfig {
    /// Emit structured JSON lifecycle lines on stdout instead of human text.
    #[arg(long)]
    pub json: bool,

    /// Transport the RPC duplex listens on.
    #[arg(long, value_enum, default_value = "tcp")]
    pub transport: Transport,

    /// Address to bind for the `tcp` transport.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub address: String,

    /// Keep serving after the last client disconnects.
    #[arg(long)]
    pub keep_alive: bool,

    /// Path to the SQLite catalog. Defaults to `<data-dir>/caved.db`.
    #[arg(long)]
    pub dbpath: Option<PathBuf>,

    /// PID(s) whose death should terminate the daemon. Repeatable.
    #[arg(long = "destiny-pid")]
    pub destiny_pids: Vec<u32>,

    /// Directory used for logs, the catalog default, and staging folders.
    #[arg(long)]
    pub root_dir: Option<PathBuf>,
}

impl DaemonConfig {
    /// The configured root, falling back to `CAVED_ROOT_DIR` and finally a
    /// platform data directory. Used by [`crate::utils::paths`] as the first
    /// candidate in its portable-root/exe-relative fallback chain.
    pub fn configured_root(&self) -> PathBuf {
        if let Some(root) = &self.root_dir {
            return root.clone();
        }
        if let Ok(value) = std::env::var("CAVED_ROOT_DIR") {
            if !value.trim().is_empty() {
                return PathBuf::from(value);
            }
        }
        dirs::data_dir()
            .map(|d| d.join("caved"))
            .unwrap_or_else(|| PathBuf::from(".caved"))
    }

    pub fn root_dir(&self) -> PathBuf {
        crate::utils::paths::resolve_root_dir(self)
    }

    pub fn data_dir(&self) -> PathBuf {
        crate::utils::paths::resolve_data_dir(self)
    }

    pub fn cache_dir(&self) -> PathBuf {
        crate::utils::paths::resolve_cache_dir(self)
    }

    pub fn log_dir(&self) -> PathBuf {
        crate::utils::paths::resolve_log_dir(self)
    }

    pub fn staging_root(&self) -> PathBuf {
        crate::utils::paths::resolve_staging_dir(self)
    }

    pub fn db_path(&self) -> PathBuf {
        self.dbpath.clone().unwrap_or_else(|| self.cache_dir().join("caved.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_root_is_under_cache_dir() {
        let config = DaemonConfig {
            json: false,
            transport: Transport::Tcp,
            address: "127.0.0.1:0".into(),
            keep_alive: false,
            dbpath: None,
            destiny_pids: vec![],
            root_dir: Some(PathBuf::from("/tmp/caved-test-root")),
        };
        assert_eq!(
            config.staging_root(),
            PathBuf::from("/tmp/caved-test-root/cache/staging")
        );
        assert_eq!(config.db_path(), PathBuf::from("/tmp/caved-test-root/cache/caved.db"));
    }
}
