//! Per-block weak+strong hashing over a container.
//!
//! The strong hash is SHA-256, the same digest a whole-file self-heal
//! verifier would use, truncated to 16 bytes per block to match the
//! on-wire `BlockHash` format. The weak hash is an Adler-32-style rolling
//! checksum, so the diff engine can slide one byte at a time without
//! re-hashing a whole block.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cancel::CancelToken;
use crate::container::{Container, Pool, BLOCK_SIZE};
use crate::errors::{CoreError, Result};

pub mod rolling;

pub use rolling::RollingChecksum;

pub const STRONG_HASH_LEN: usize = 16;
const MAGIC: &[u8; 4] = b"CVSG";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    pub weak: u32,
    pub strong: [u8; STRONG_HASH_LEN],
}

#[derive(Clone, Debug)]
pub struct SignatureInfo {
    pub container: Container,
    pub hashes: Vec<BlockHash>,
}

/// Cryptographic per-block digest, truncated to `STRONG_HASH_LEN` bytes.
/// Exposed so the diff engine can verify a weak-hash hit against the same
/// digest.
pub fn block_strong_hash(block: &[u8]) -> [u8; STRONG_HASH_LEN] {
    let digest = Sha256::digest(block);
    let mut out = [0u8; STRONG_HASH_LEN];
    out.copy_from_slice(&digest[..STRONG_HASH_LEN]);
    out
}

/// Streams every file in `container` through `pool` in order, computing a
/// `BlockHash` per block and calling `emit` for each one as soon as it's
/// ready. Cancellable between blocks, never mid-block.
pub fn sign<E: FnMut(BlockHash) -> Result<()>>(
    container: &Container,
    pool: &dyn Pool,
    cancel: &CancelToken,
    mut emit: E,
) -> Result<()> {
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    for (index, file) in container.files.iter().enumerate() {
        let mut reader = pool.open(index)?;
        let mut remaining = file.size;
        while remaining > 0 {
            cancel.check()?;
            let want = remaining.min(BLOCK_SIZE) as usize;
            reader.read_exact(&mut buf[..want])?;
            let block = &buf[..want];
            let weak = RollingChecksum::of(block).value();
            let strong = block_strong_hash(block);
            emit(BlockHash { weak, strong })?;
            remaining -= want as u64;
        }
        pool.close(index)?;
    }
    Ok(())
}

/// Writes `magic | compression_byte | json(container) | json(hashes)` as a
/// framed, length-prefixed stream. The compression byte records zstd level
/// used, 0 meaning uncompressed.
pub fn write_signature<W: Write>(mut out: W, compression_level: i32, container: &Container, hashes: &[BlockHash]) -> Result<()> {
    out.write_all(MAGIC)?;
    out.write_all(&compression_level.to_le_bytes())?;

    let body = serde_json::to_vec(&(container, hashes))?;
    let payload = if compression_level > 0 {
        zstd::encode_all(&body[..], compression_level).map_err(CoreError::Io)?
    } else {
        body
    };
    out.write_all(&(payload.len() as u64).to_le_bytes())?;
    out.write_all(&payload)?;
    out.flush()?;
    Ok(())
}

pub fn read_signature<R: Read>(mut input: R) -> Result<SignatureInfo> {
    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CoreError::SignatureMismatch("bad magic".into()));
    }

    let mut level_buf = [0u8; 4];
    input.read_exact(&mut level_buf)?;
    let compression_level = i32::from_le_bytes(level_buf);

    let mut len_buf = [0u8; 8];
    input.read_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload)?;

    let body = if compression_level > 0 {
        zstd::decode_all(&payload[..]).map_err(CoreError::Io)?
    } else {
        payload
    };

    let (container, hashes): (Container, Vec<BlockHash>) =
        serde_json::from_slice(&body).map_err(|err| CoreError::SignatureMismatch(err.to_string()))?;

    let expected = container.total_blocks();
    if hashes.len() as u64 != expected {
        return Err(CoreError::SignatureMismatch(format!(
            "hash count {} does not match expected block count {}",
            hashes.len(),
            expected
        )));
    }

    Ok(SignatureInfo { container, hashes })
}

/// Convenience wrapper mirroring `cmd/sign`: walk a directory, sign it, write
/// the signature file in one call. No CLI surface of its own (out of scope).
pub fn sign_to_writer<W: Write>(root: &std::path::Path, out: W, compression_level: i32) -> Result<Container> {
    let container = crate::container::walk(root, &crate::container::WalkOpts::default())?;
    crate::container::validate(&container)?;
    let pool = crate::container::FsPool::new(root.to_path_buf(), container.clone());
    let mut hashes = Vec::new();
    sign(&container, &pool, &CancelToken::new(), |hash| {
        hashes.push(hash);
        Ok(())
    })?;
    write_signature(out, compression_level, &container, &hashes)?;
    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{FileEntry, FsPool, WalkOpts};
    use std::fs;

    #[test]
    fn sign_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), vec![9u8; 150_000]).unwrap();
        let container = crate::container::walk(dir.path(), &WalkOpts::default()).unwrap();
        let pool = FsPool::new(dir.path().to_path_buf(), container.clone());

        let mut hashes = Vec::new();
        sign(&container, &pool, &CancelToken::new(), |h| {
            hashes.push(h);
            Ok(())
        })
        .unwrap();
        assert_eq!(hashes.len() as u64, container.total_blocks());

        let mut buf = Vec::new();
        write_signature(&mut buf, 0, &container, &hashes).unwrap();
        let info = read_signature(&buf[..]).unwrap();
        assert_eq!(info.hashes.len(), hashes.len());
        assert_eq!(info.container.files[0].size, 150_000);
    }

    #[test]
    fn read_signature_rejects_bad_magic() {
        let err = read_signature(&b"XXXX"[..]).unwrap_err();
        assert!(matches!(err, CoreError::SignatureMismatch(_)));
    }

    #[test]
    fn empty_file_has_zero_blocks() {
        let mut container = Container::new();
        container.files.push(FileEntry {
            path: "empty.bin".into(),
            size: 0,
            mode: 0o644,
        });
        assert_eq!(container.total_blocks(), 0);
    }
}
