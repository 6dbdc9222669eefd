//! Filesystem helpers shared by the install, patch and heal engines. The
//! teacher wrapped these in a `FileManager` bound to one app/install dir
//! pair; the daemon touches many install locations per process, so these are
//! free functions instead (`memmap2` dropped with it — nothing here needs
//! mapped reads, see DESIGN.md).

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Writes `contents` to `path` via a sibling temp file, `fsync`, then
/// rename, so a crash mid-write never leaves a half-written file at `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)?;
    Ok(())
}

pub fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}
