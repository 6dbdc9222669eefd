//! Canonical description of a payload tree.
//!
//! A `Container` never touches the filesystem after it is built; it is an
//! immutable value that gives every file, directory and symlink a stable,
//! sorted position. Block numbering for signatures/patches is derived purely
//! from this order, so two independent walks of the same tree must agree.

pub mod pool;

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, Result};

pub use pool::{read_range, FsPool, Pool, StreamPool};

/// Block size is fixed in the wire format; changing it breaks interop with
/// previously-produced signatures and patches.
pub const BLOCK_SIZE: u64 = 64 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub mode: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub mode: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SymlinkEntry {
    pub path: String,
    pub dest: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub dirs: Vec<DirEntry>,
    pub files: Vec<FileEntry>,
    pub symlinks: Vec<SymlinkEntry>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `BLOCK_SIZE` blocks a file occupies, counting a short final
    /// block.
    pub fn block_count_for(size: u64) -> u64 {
        if size == 0 {
            return 0;
        }
        size.div_ceil(BLOCK_SIZE)
    }

    pub fn total_blocks(&self) -> u64 {
        self.files.iter().map(|f| Self::block_count_for(f.size)).sum()
    }

    pub fn total_bytes(&self) -> Result<u64> {
        let mut total: u64 = 0;
        for file in &self.files {
            total = total
                .checked_add(file.size)
                .ok_or_else(|| CoreError::Config("container size overflow".into()))?;
        }
        Ok(total)
    }

    pub fn file_index(&self, path: &str) -> Option<usize> {
        self.files.iter().position(|f| f.path == path)
    }
}

/// Options controlling a filesystem walk.
pub struct WalkOpts<F: Fn(&Path) -> bool> {
    pub filter: F,
    pub dereference_symlinks: bool,
    pub auto_wrap: bool,
}

impl Default for WalkOpts<fn(&Path) -> bool> {
    fn default() -> Self {
        Self {
            filter: |_| true,
            dereference_symlinks: false,
            auto_wrap: true,
        }
    }
}

/// Depth-first walk of `root`, producing a `Container` with stably-sorted
/// entries. Symlinks whose target escapes `root` are rejected outright.
pub fn walk<F: Fn(&Path) -> bool>(root: &Path, opts: &WalkOpts<F>) -> Result<Container> {
    let effective_root = if opts.auto_wrap {
        auto_wrap_root(root)?
    } else {
        root.to_path_buf()
    };

    if !effective_root.is_dir() {
        return Err(CoreError::Config(format!(
            "walk root is not a directory: {}",
            effective_root.display()
        )));
    }

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut symlinks = Vec::new();
    walk_into(&effective_root, &effective_root, opts, &mut dirs, &mut files, &mut symlinks)?;

    dirs.sort_by(|a, b| a.path.cmp(&b.path));
    files.sort_by(|a, b| a.path.cmp(&b.path));
    symlinks.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(Container { dirs, files, symlinks })
}

/// If `root` contains exactly one subdirectory and no files, treat that
/// subdirectory as the effective install root (common for archives that wrap
/// their payload in a single top-level folder).
fn auto_wrap_root(root: &Path) -> Result<PathBuf> {
    let mut entries = std::fs::read_dir(root)?;
    let mut only_dir: Option<PathBuf> = None;
    let mut count = 0usize;
    for entry in entries.by_ref() {
        let entry = entry?;
        count += 1;
        let file_type = entry.file_type()?;
        if file_type.is_dir() && only_dir.is_none() {
            only_dir = Some(entry.path());
        } else {
            return Ok(root.to_path_buf());
        }
    }
    if count == 1 {
        if let Some(dir) = only_dir {
            return Ok(dir);
        }
    }
    Ok(root.to_path_buf())
}

fn walk_into<F: Fn(&Path) -> bool>(
    root: &Path,
    current: &Path,
    opts: &WalkOpts<F>,
    dirs: &mut Vec<DirEntry>,
    files: &mut Vec<FileEntry>,
    symlinks: &mut Vec<SymlinkEntry>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let relative = relative_slash_path(root, &path)?;
        if !(opts.filter)(Path::new(&relative)) {
            continue;
        }

        let metadata = entry.metadata()?;
        if metadata.is_symlink() && !opts.dereference_symlinks {
            let target = std::fs::read_link(&path)?;
            let resolved = if target.is_absolute() {
                target.clone()
            } else {
                path.parent().unwrap_or(root).join(&target)
            };
            let canonical = normalize_path(&resolved);
            if !canonical.starts_with(&normalize_path(root)) {
                return Err(CoreError::Config(format!(
                    "symlink escapes root: {} -> {}",
                    relative,
                    target.display()
                )));
            }
            symlinks.push(SymlinkEntry {
                path: relative,
                dest: target.to_string_lossy().replace('\\', "/"),
            });
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() || (metadata.is_symlink() && opts.dereference_symlinks && path.is_dir()) {
            dirs.push(DirEntry {
                path: relative,
                mode: unix_mode(&metadata),
            });
            walk_into(root, &path, opts, dirs, files, symlinks)?;
        } else {
            files.push(FileEntry {
                path: relative,
                size: metadata.len(),
                mode: unix_mode(&metadata),
            });
        }
    }
    Ok(())
}

#[cfg(unix)]
fn unix_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn unix_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

fn relative_slash_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| CoreError::Config(format!("path {} escapes root {}", path.display(), root.display())))?;
    Ok(relative.to_string_lossy().replace('\\', "/"))
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Rejects a container that violates any structural invariant: absolute
/// paths, `..` traversal, empty paths, duplicates, a file whose parent
/// directory isn't listed, or file-size overflow.
pub fn validate(container: &Container) -> Result<()> {
    let mut seen = HashSet::new();
    let mut dir_paths = HashSet::new();

    for dir in &container.dirs {
        check_path(&dir.path)?;
        if !dir_paths.insert(dir.path.clone()) || !seen.insert(dir.path.clone()) {
            return Err(CoreError::Config(format!("duplicate path: {}", dir.path)));
        }
    }
    for file in &container.files {
        check_path(&file.path)?;
        if !seen.insert(file.path.clone()) {
            return Err(CoreError::Config(format!("duplicate path: {}", file.path)));
        }
        if let Some(parent) = parent_of(&file.path) {
            if !parent.is_empty() && !dir_paths.contains(&parent) {
                return Err(CoreError::Config(format!(
                    "file {} has no listed parent directory {}",
                    file.path, parent
                )));
            }
        }
    }
    for link in &container.symlinks {
        check_path(&link.path)?;
        if !seen.insert(link.path.clone()) {
            return Err(CoreError::Config(format!("duplicate path: {}", link.path)));
        }
    }

    container.total_bytes()?;
    Ok(())
}

fn check_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(CoreError::Config("empty path in container".into()));
    }
    if Path::new(path).is_absolute() || path.starts_with('/') {
        return Err(CoreError::Config(format!("absolute path in container: {path}")));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(CoreError::Config(format!("path escapes root: {path}")));
    }
    Ok(())
}

fn parent_of(path: &str) -> Option<String> {
    path.rfind('/').map(|idx| path[..idx].to_string())
}

const ELF_MAGIC: &[u8] = b"\x7fELF";
const MACHO_MAGICS: &[[u8; 4]] = &[
    [0xfe, 0xed, 0xfa, 0xce],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xfe, 0xed, 0xfa, 0xcf],
    [0xcf, 0xfa, 0xed, 0xfe],
    [0xca, 0xfe, 0xba, 0xbe],
];

fn looks_executable(prefix: &[u8]) -> bool {
    if prefix.starts_with(ELF_MAGIC) {
        return true;
    }
    if prefix.len() >= 4 && MACHO_MAGICS.iter().any(|magic| prefix.starts_with(magic)) {
        return true;
    }
    if prefix.starts_with(b"#!") {
        return true;
    }
    false
}

/// Inspects the first bytes of each file to detect executables and sets the
/// executable bit in the container's in-memory mode. Never touches disk
/// beyond reading; I/O errors here are warned, not fatal.
pub fn fix_permissions(container: &mut Container, pool: &dyn Pool) {
    for (index, file) in container.files.iter_mut().enumerate() {
        let mut reader = match pool.open(index) {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(path = %file.path, error = %err, "fix_permissions: open failed");
                continue;
            }
        };
        let mut prefix = [0u8; 64];
        let read = match std::io::Read::read(&mut reader, &mut prefix) {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(path = %file.path, error = %err, "fix_permissions: read failed");
                continue;
            }
        };
        let _ = pool.close(index);
        if looks_executable(&prefix[..read]) {
            file.mode |= 0o111;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walk_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("b_dir")).unwrap();
        fs::create_dir(dir.path().join("a_dir")).unwrap();
        fs::write(dir.path().join("root.txt"), b"hello").unwrap();
        fs::write(dir.path().join("a_dir").join("nested.txt"), b"world").unwrap();

        let opts = WalkOpts {
            filter: |_: &Path| true,
            dereference_symlinks: false,
            auto_wrap: false,
        };
        let first = walk(dir.path(), &opts).unwrap();
        let second = walk(dir.path(), &opts).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(first.dirs[0].path, "a_dir");
        assert_eq!(first.dirs[1].path, "b_dir");
    }

    #[test]
    fn auto_wrap_descends_single_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let wrapped = dir.path().join("GameName-v1");
        fs::create_dir(&wrapped).unwrap();
        fs::write(wrapped.join("game.bin"), b"payload").unwrap();

        let container = walk(dir.path(), &WalkOpts::default()).unwrap();
        assert_eq!(container.files.len(), 1);
        assert_eq!(container.files[0].path, "game.bin");
    }

    #[test]
    fn validate_rejects_absolute_and_dotdot() {
        let mut container = Container::new();
        container.files.push(FileEntry {
            path: "/etc/passwd".into(),
            size: 0,
            mode: 0,
        });
        assert!(validate(&container).is_err());

        let mut container = Container::new();
        container.files.push(FileEntry {
            path: "../escape".into(),
            size: 0,
            mode: 0,
        });
        assert!(validate(&container).is_err());
    }

    #[test]
    fn validate_requires_parent_dir_listed() {
        let mut container = Container::new();
        container.files.push(FileEntry {
            path: "sub/file.txt".into(),
            size: 0,
            mode: 0,
        });
        assert!(validate(&container).is_err());

        container.dirs.push(DirEntry {
            path: "sub".into(),
            mode: 0o755,
        });
        assert!(validate(&container).is_ok());
    }

    #[test]
    fn looks_executable_detects_elf_and_shebang() {
        assert!(looks_executable(b"\x7fELF\x02\x01\x01"));
        assert!(looks_executable(b"#!/bin/sh\n"));
        assert!(!looks_executable(b"PK\x03\x04"));
    }
}
