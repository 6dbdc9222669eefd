//! Repairs a (possibly corrupt) pool by re-fetching only wounded blocks.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::container::{Container, FsPool, Pool, BLOCK_SIZE};
use crate::errors::Result;
use crate::signature::{block_strong_hash, SignatureInfo};

/// A corrupted or missing block. `block_index = None` means the whole file
/// is missing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wound {
    pub file_index: usize,
    pub block_index: Option<u64>,
}

/// Abstracts an authenticated remote range-read source. Retry policy lives
/// one layer up, in the install state machine.
pub trait BlockSource: Send + Sync {
    fn fetch(&self, file_index: usize, offset: u64, length: u64) -> Result<Box<dyn Read>>;
}

/// Validates `pool` against `signature`, returning every wound found. An
/// empty result means the pool is byte-identical to what the signature
/// describes.
pub fn validate_pool_against_signature(signature: &SignatureInfo, pool: &dyn Pool) -> Result<Vec<Wound>> {
    let mut wounds = Vec::new();
    let mut cursor = 0usize;

    for (file_index, file) in signature.container.files.iter().enumerate() {
        let blocks = Container::block_count_for(file.size);
        let reader = pool.open(file_index);
        let mut reader = match reader {
            Ok(r) => r,
            Err(_) => {
                wounds.push(Wound { file_index, block_index: None });
                cursor += blocks as usize;
                continue;
            }
        };

        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        for block_index in 0..blocks {
            let offset = block_index * BLOCK_SIZE;
            let len = (file.size - offset).min(BLOCK_SIZE) as usize;
            let expected = signature.hashes[cursor];
            let ok = reader.seek(SeekFrom::Start(offset)).is_ok() && reader.read_exact(&mut buf[..len]).is_ok();
            if !ok || block_strong_hash(&buf[..len]) != expected.strong {
                wounds.push(Wound { file_index, block_index: Some(block_index) });
            }
            cursor += 1;
        }
        let _ = pool.close(file_index);
    }
    Ok(wounds)
}

struct ByteRange {
    file_index: usize,
    offset: u64,
    length: u64,
}

/// Coalesces adjacent block wounds into contiguous byte ranges per file. A
/// whole-file wound becomes a single range covering the entire declared
/// size.
fn coalesce(signature: &SignatureInfo, wounds: &[Wound]) -> Vec<ByteRange> {
    let mut ranges = Vec::new();
    let mut by_file: std::collections::BTreeMap<usize, Vec<Option<u64>>> = std::collections::BTreeMap::new();
    for wound in wounds {
        by_file.entry(wound.file_index).or_default().push(wound.block_index);
    }

    for (file_index, mut blocks) in by_file {
        let file_size = signature.container.files[file_index].size;
        if blocks.contains(&None) {
            ranges.push(ByteRange { file_index, offset: 0, length: file_size });
            continue;
        }
        let mut sorted: Vec<u64> = blocks.drain(..).map(|b| b.unwrap()).collect();
        sorted.sort_unstable();
        let mut iter = sorted.into_iter();
        if let Some(first) = iter.next() {
            let mut start = first;
            let mut end = first;
            for block in iter {
                if block == end + 1 {
                    end = block;
                } else {
                    ranges.push(range_for(file_index, start, end, file_size));
                    start = block;
                    end = block;
                }
            }
            ranges.push(range_for(file_index, start, end, file_size));
        }
    }
    ranges
}

fn range_for(file_index: usize, start_block: u64, end_block: u64, file_size: u64) -> ByteRange {
    let offset = start_block * BLOCK_SIZE;
    let length = ((end_block - start_block + 1) * BLOCK_SIZE).min(file_size.saturating_sub(offset));
    ByteRange { file_index, offset, length }
}

/// Fast whole-file digest used as a cheap pre-check before a full block
/// scan. Not part of the signature format itself; callers use it to skip
/// `validate_pool_against_signature` entirely when a cached digest from
/// the last successful check still matches.
pub fn quick_file_digest(path: &std::path::Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Fetches only the wounded byte ranges of `pool` (rooted in `install_folder`
/// via `pool.root()`) from `source`, writes them into place, then
/// re-validates. Running `heal` again with no new corruption performs zero
/// fetches.
pub fn heal(signature: &SignatureInfo, pool: &FsPool, source: &dyn BlockSource) -> Result<Vec<Wound>> {
    let wounds = validate_pool_against_signature(signature, pool)?;
    if wounds.is_empty() {
        return Ok(wounds);
    }

    for range in coalesce(signature, &wounds) {
        let mut reader = source.fetch(range.file_index, range.offset, range.length)?;
        let path = pool.path_for(range.file_index)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(range.offset))?;
        let mut buf = vec![0u8; range.length as usize];
        reader.read_exact(&mut buf)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }

    validate_pool_against_signature(signature, pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::container::{walk, WalkOpts};
    use crate::signature::{read_signature, sign, write_signature};
    use std::fs;
    use std::io::Cursor;

    struct TestSource<'a> {
        root: &'a std::path::Path,
        container: &'a Container,
    }

    impl<'a> BlockSource for TestSource<'a> {
        fn fetch(&self, file_index: usize, offset: u64, length: u64) -> Result<Box<dyn Read>> {
            let path = self.root.join(&self.container.files[file_index].path);
            let mut file = std::fs::File::open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf)?;
            Ok(Box::new(Cursor::new(buf)))
        }
    }

    fn sign_dir(dir: &std::path::Path) -> SignatureInfo {
        let container = walk(dir, &WalkOpts::default()).unwrap();
        let pool = FsPool::new(dir.to_path_buf(), container.clone());
        let mut hashes = Vec::new();
        sign(&container, &pool, &CancelToken::new(), |h| {
            hashes.push(h);
            Ok(())
        })
        .unwrap();
        let mut buf = Vec::new();
        write_signature(&mut buf, 0, &container, &hashes).unwrap();
        read_signature(&buf[..]).unwrap()
    }

    #[test]
    fn heal_repairs_a_corrupted_block_and_then_is_idempotent() {
        let good_dir = tempfile::tempdir().unwrap();
        fs::write(good_dir.path().join("a.bin"), vec![3u8; 200_000]).unwrap();
        let signature = sign_dir(good_dir.path());

        let corrupt_dir = tempfile::tempdir().unwrap();
        fs::write(corrupt_dir.path().join("a.bin"), {
            let mut data = vec![3u8; 200_000];
            data[70_000] = 0xFF;
            data
        })
        .unwrap();

        let pool = FsPool::new(corrupt_dir.path().to_path_buf(), signature.container.clone());
        let source = TestSource { root: good_dir.path(), container: &signature.container };

        let remaining = heal(&signature, &pool, &source).unwrap();
        assert!(remaining.is_empty());

        let repaired = fs::read(corrupt_dir.path().join("a.bin")).unwrap();
        let expected = fs::read(good_dir.path().join("a.bin")).unwrap();
        assert_eq!(repaired, expected);

        let second = heal(&signature, &pool, &source).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn quick_digest_changes_when_file_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"hello").unwrap();
        let first = quick_file_digest(&path).unwrap();
        fs::write(&path, b"hellp").unwrap();
        let second = quick_file_digest(&path).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn missing_file_is_reported_as_whole_file_wound() {
        let good_dir = tempfile::tempdir().unwrap();
        fs::write(good_dir.path().join("a.bin"), vec![9u8; 1000]).unwrap();
        let signature = sign_dir(good_dir.path());

        let empty_dir = tempfile::tempdir().unwrap();
        let pool = FsPool::new(empty_dir.path().to_path_buf(), signature.container.clone());
        let wounds = validate_pool_against_signature(&signature, &pool).unwrap();
        assert_eq!(wounds, vec![Wound { file_index: 0, block_index: None }]);
    }
}
