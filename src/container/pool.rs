//! Seekable byte sources for files addressed by container index.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errors::{CoreError, Result};

use super::Container;

/// A reader that can also report how many bytes remain to be read for the
/// current file, used by the patch engine to clip trailing `BlockRange` reads.
pub trait SeekableRead: Read + Seek + Send {}
impl<T: Read + Seek + Send> SeekableRead for T {}

/// Yields a seekable byte stream for file index `i` in a container. `close`
/// is mandatory once a caller is done with a given index.
pub trait Pool: Send + Sync {
    fn open(&self, file_index: usize) -> Result<Box<dyn SeekableRead>>;
    fn close(&self, file_index: usize) -> Result<()>;
}

/// A pool rooted at a directory on disk; `file_index` is resolved against the
/// container's file list.
pub struct FsPool {
    root: PathBuf,
    container: Container,
}

impl FsPool {
    pub fn new(root: PathBuf, container: Container) -> Self {
        Self { root, container }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn path_for(&self, file_index: usize) -> Result<PathBuf> {
        let entry = self
            .container
            .files
            .get(file_index)
            .ok_or_else(|| CoreError::Config(format!("no such file index: {file_index}")))?;
        Ok(self.root.join(&entry.path))
    }
}

impl Pool for FsPool {
    fn open(&self, file_index: usize) -> Result<Box<dyn SeekableRead>> {
        let path = self.path_for(file_index)?;
        let file = File::open(&path)
            .map_err(|err| CoreError::Io(io::Error::new(err.kind(), format!("{}: {err}", path.display()))))?;
        Ok(Box::new(file))
    }

    fn close(&self, _file_index: usize) -> Result<()> {
        Ok(())
    }
}

/// A pool reading sequentially from a decompressed patch or archive stream.
/// Files must be requested in ascending index order exactly once; each `open`
/// advances past the previous file's declared size.
pub struct StreamPool<R: Read + Send> {
    container: Container,
    inner: Mutex<StreamPoolState<R>>,
}

struct StreamPoolState<R: Read + Send> {
    reader: R,
    next_index: usize,
}

impl<R: Read + Send> StreamPool<R> {
    pub fn new(reader: R, container: Container) -> Self {
        Self {
            container,
            inner: Mutex::new(StreamPoolState { reader, next_index: 0 }),
        }
    }
}

impl<R: Read + Send> Pool for StreamPool<R> {
    fn open(&self, file_index: usize) -> Result<Box<dyn SeekableRead>> {
        let entry = self
            .container
            .files
            .get(file_index)
            .ok_or_else(|| CoreError::Config(format!("no such file index: {file_index}")))?;
        let mut state = self
            .inner
            .lock()
            .map_err(|_| CoreError::Config("stream pool lock poisoned".into()))?;
        if file_index != state.next_index {
            return Err(CoreError::Config(format!(
                "stream pool must be consumed in order: wanted {}, got {}",
                state.next_index, file_index
            )));
        }
        let mut buf = vec![0u8; entry.size as usize];
        state.reader.read_exact(&mut buf)?;
        state.next_index += 1;
        Ok(Box::new(io::Cursor::new(buf)))
    }

    fn close(&self, _file_index: usize) -> Result<()> {
        Ok(())
    }
}

/// Reads exactly `len` bytes at `offset` from the file at `file_index`,
/// clipped to the file's declared size. Used by the patch engine to resolve
/// `BlockRange` operations against a target pool.
pub fn read_range(pool: &dyn Pool, file_index: usize, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut reader = pool.open(file_index)?;
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    pool.close(file_index)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::FileEntry;
    use std::fs;

    #[test]
    fn fs_pool_length_matches_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), vec![7u8; 200]).unwrap();
        let container = Container {
            dirs: vec![],
            files: vec![FileEntry {
                path: "a.bin".into(),
                size: 200,
                mode: 0o644,
            }],
            symlinks: vec![],
        };
        let pool = FsPool::new(dir.path().to_path_buf(), container);
        let mut reader = pool.open(0).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 200);
    }

    #[test]
    fn stream_pool_enforces_order() {
        let container = Container {
            dirs: vec![],
            files: vec![
                FileEntry { path: "a".into(), size: 3, mode: 0 },
                FileEntry { path: "b".into(), size: 2, mode: 0 },
            ],
            symlinks: vec![],
        };
        let data = io::Cursor::new(vec![1, 2, 3, 4, 5]);
        let pool = StreamPool::new(data, container);
        assert!(pool.open(1).is_err());
        let mut first = pool.open(0).unwrap();
        let mut buf = Vec::new();
        first.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
        let mut second = pool.open(1).unwrap();
        buf.clear();
        second.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![4, 5]);
    }
}
