//! Content-defined diff against a target signature.
//!
//! "Target" is the already-signed tree the receiving end already has on
//! disk; "source" is the new tree being shipped. The diff scans each source
//! file and looks for byte ranges already present somewhere in the target,
//! emitting `BlockRange` references instead of literal bytes wherever one is
//! found, so the patch can reconstruct the source from the target plus a
//! much smaller set of fresh bytes.

use std::collections::HashMap;
use std::io::Write;

use crate::cancel::CancelToken;
use crate::container::{read_range, Container, Pool, BLOCK_SIZE};
use crate::errors::Result;
use crate::patch::format::{self, Op};
use crate::signature::{sign, BlockHash, RollingChecksum, SignatureInfo};

#[derive(Clone, Copy, Debug, Default)]
pub struct DiffStats {
    pub reused_bytes: u64,
    pub fresh_bytes: u64,
}

struct TargetIndex<'a> {
    signature: &'a SignatureInfo,
    by_weak: HashMap<u32, Vec<(usize, u64)>>,
}

impl<'a> TargetIndex<'a> {
    fn build(signature: &'a SignatureInfo) -> Self {
        let mut by_weak: HashMap<u32, Vec<(usize, u64)>> = HashMap::new();
        let mut cursor = 0usize;
        for (file_index, file) in signature.container.files.iter().enumerate() {
            let blocks = Container::block_count_for(file.size);
            for block_index in 0..blocks {
                let hash = signature.hashes[cursor];
                by_weak.entry(hash.weak).or_default().push((file_index, block_index));
                cursor += 1;
            }
        }
        Self { signature, by_weak }
    }

    fn hash_at(&self, file_index: usize, block_index: u64) -> BlockHash {
        let mut cursor = 0u64;
        for (idx, file) in self.signature.container.files.iter().enumerate() {
            let blocks = Container::block_count_for(file.size);
            if idx == file_index {
                return self.signature.hashes[(cursor + block_index) as usize];
            }
            cursor += blocks;
        }
        unreachable!("file_index out of range")
    }

    /// Finds a candidate block in the target whose weak hash matches and
    /// whose strong hash, verified against the actual target bytes,
    /// confirms the match. Ties break on the lowest `(file_index,
    /// block_index)`.
    fn confirm(&self, weak: u32, window: &[u8], target_pool: &dyn Pool) -> Result<Option<(usize, u64)>> {
        let Some(candidates) = self.by_weak.get(&weak) else {
            return Ok(None);
        };
        let mut best: Option<(usize, u64)> = None;
        for &(file_index, block_index) in candidates {
            let hash = self.hash_at(file_index, block_index);
            if hash.weak != weak {
                continue;
            }
            let offset = block_index * BLOCK_SIZE;
            let file_size = self.signature.container.files[file_index].size;
            let block_len = (file_size - offset).min(BLOCK_SIZE) as usize;
            if block_len != window.len() {
                continue;
            }
            let bytes = read_range(target_pool, file_index, offset, block_len as u64)?;
            if crate::signature::block_strong_hash(&bytes) != hash.strong {
                continue;
            }
            best = Some(match best {
                None => (file_index, block_index),
                Some(current) if (file_index, block_index) < current => (file_index, block_index),
                Some(current) => current,
            });
        }
        Ok(best)
    }
}

/// Produces a patch (written to `patch_out`) plus the source tree's own
/// signature (written to `signature_out`, computed in the same pass so a
/// receiver can validate in one go) from `source_container`/`source_pool`
/// against `target_signature`/`target_pool`.
#[allow(clippy::too_many_arguments)]
pub fn diff<W1: Write, W2: Write>(
    source_container: &Container,
    source_pool: &dyn Pool,
    target_signature: &SignatureInfo,
    target_pool: &dyn Pool,
    mut patch_out: W1,
    signature_out: W2,
    compression_level: i32,
    cancel: &CancelToken,
) -> Result<DiffStats> {
    format::write_header(&mut patch_out, compression_level, &target_signature.container, source_container)?;

    let index = TargetIndex::build(target_signature);
    let mut stats = DiffStats::default();
    let mut new_hashes = Vec::new();

    for (file_index, file) in source_container.files.iter().enumerate() {
        cancel.check()?;
        let mut reader = source_pool.open(file_index)?;
        let mut data = Vec::with_capacity(file.size as usize);
        std::io::Read::read_to_end(&mut reader, &mut data)?;
        source_pool.close(file_index)?;

        sign_file_blocks(&data, &mut new_hashes)?;

        let mut ops = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut pos = 0usize;
        let mut last_match: Option<(usize, u64, u64)> = None; // (target_file, first_block, count)
        let mut rolling: Option<(RollingChecksum, usize, usize)> = None; // (checksum, window_start, window_len)

        while pos < data.len() {
            cancel.check()?;
            let window_len = (data.len() - pos).min(BLOCK_SIZE as usize);
            let window = &data[pos..pos + window_len];

            let checksum = match rolling {
                Some((mut previous, prev_pos, prev_len)) if prev_pos + 1 == pos && prev_len == window_len => {
                    previous.roll(data[prev_pos], data[pos + window_len - 1]);
                    previous
                }
                _ => RollingChecksum::of(window),
            };
            rolling = Some((checksum, pos, window_len));
            let weak = checksum.value();

            if let Some((target_file, target_block)) = index.confirm(weak, window, target_pool)? {
                if !pending.is_empty() {
                    stats.fresh_bytes += pending.len() as u64;
                    ops.push(Op::Data(std::mem::take(&mut pending)));
                }
                stats.reused_bytes += window_len as u64;
                last_match = Some(match last_match {
                    Some((f, first, count)) if f == target_file && first + count == target_block => (f, first, count + 1),
                    _ => {
                        flush_match(&mut ops, last_match);
                        (target_file, target_block, 1)
                    }
                });
                pos += window_len;
            } else {
                pending.push(data[pos]);
                pos += 1;
                flush_match(&mut ops, last_match.take());
            }
        }
        flush_match(&mut ops, last_match.take());
        if !pending.is_empty() {
            stats.fresh_bytes += pending.len() as u64;
            ops.push(Op::Data(pending));
        }

        for op in &ops {
            format::write_op(&mut patch_out, op)?;
        }
        format::write_sync(&mut patch_out)?;
    }
    format::write_eof(&mut patch_out)?;

    crate::signature::write_signature(signature_out, compression_level, source_container, &new_hashes)?;
    Ok(stats)
}

fn flush_match(ops: &mut Vec<Op>, pending: Option<(usize, u64, u64)>) {
    if let Some((file, first, count)) = pending {
        ops.push(Op::BlockRange { file, first, count });
    }
}

fn sign_file_blocks(data: &[u8], out: &mut Vec<BlockHash>) -> Result<()> {
    let mut offset = 0usize;
    while offset < data.len() {
        let len = (data.len() - offset).min(BLOCK_SIZE as usize);
        out.push(BlockHash {
            weak: RollingChecksum::of(&data[offset..offset + len]).value(),
            strong: crate::signature::block_strong_hash(&data[offset..offset + len]),
        });
        offset += len;
    }
    Ok(())
}
