//! Patch application: `Idle -> Reading Header -> Per-File -> Committing ->
//! Done`, with a checkpoint callback between files that the install state
//! machine uses to persist resumable progress.

pub mod format;

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use crate::cancel::CancelToken;
use crate::container::{read_range, Container, Pool, BLOCK_SIZE};
use crate::errors::{CoreError, Result};
use crate::heal::Wound;
use crate::signature::SignatureInfo;

use format::{read_frame, read_header, Frame, Op};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchState {
    Idle,
    ReadingHeader,
    PerFile,
    Committing,
    Done,
}

pub struct ApplyOutcome {
    pub container: Container,
    pub wounds: Vec<Wound>,
}

/// Applies a patch read from `patch_reader` against `target_pool`,
/// materializing the source tree into a temporary tree under `tmp_tree`,
/// then atomically renaming it into `install_folder` once validation
/// against `new_signature` (if given) reports zero wounds.
///
/// `checkpoint` is called after each completed file so a caller can persist
/// `has_listed`/resume state; `cancel` is checked at the same boundary plus
/// inside each file's op loop.
pub fn apply<R: Read>(
    patch_reader: R,
    target_pool: &dyn Pool,
    tmp_tree: &Path,
    install_folder: &Path,
    new_signature: Option<&SignatureInfo>,
    cancel: &CancelToken,
    mut checkpoint: impl FnMut(usize) -> Result<()>,
) -> Result<ApplyOutcome> {
    let mut state = PatchState::Idle;
    state = advance(state, PatchState::ReadingHeader)?;

    let mut reader = patch_reader;
    let header = read_header(&mut reader)?;

    let mut decoder;
    let mut plain;
    let body: &mut dyn Read = if header.compression_level > 0 {
        decoder = zstd::stream::read::Decoder::new(reader).map_err(CoreError::Io)?;
        &mut decoder
    } else {
        plain = reader;
        &mut plain
    };

    state = advance(state, PatchState::PerFile)?;
    fs::create_dir_all(tmp_tree)?;
    for dir in &header.source.dirs {
        fs::create_dir_all(tmp_tree.join(&dir.path))?;
    }

    for (file_index, file) in header.source.files.iter().enumerate() {
        cancel.check()?;
        let dest = tmp_tree.join(&file.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if dest.is_file() && dest.metadata().map(|m| m.len()).ok() == Some(file.size) {
            // Already materialized by a prior interrupted run; skip re-writing
            // but still drain this file's frames from the stream.
            drain_file(body)?;
            tracing::debug!(file_index, ?state, "patch: file already materialized, skipping");
            checkpoint(file_index)?;
            continue;
        }

        let mut out = File::create(&dest)?;
        loop {
            cancel.check()?;
            match read_frame(body)? {
                Frame::Op(Op::BlockRange { file: target_file, first, count }) => {
                    let target_file_size = header.target.files.get(target_file).map(|f| f.size).unwrap_or(0);
                    let offset = first * BLOCK_SIZE;
                    let want = count * BLOCK_SIZE;
                    let len = want.min(target_file_size.saturating_sub(offset));
                    let bytes = read_range(target_pool, target_file, offset, len)?;
                    out.write_all(&bytes)?;
                }
                Frame::Op(Op::Data(bytes)) => {
                    out.write_all(&bytes)?;
                }
                Frame::Sync => break,
                Frame::Eof => {
                    return Err(CoreError::PatchCorrupt(format!(
                        "unexpected EOF before sync for file {}",
                        file.path
                    )))
                }
            }
        }
        out.sync_all()?;
        drop(out);
        tracing::debug!(file_index, ?state, "patch: file committed");
        checkpoint(file_index)?;
    }

    if !matches!(read_frame(body)?, Frame::Eof) {
        return Err(CoreError::PatchCorrupt("trailing data after last file".into()));
    }

    state = advance(state, PatchState::Committing)?;
    let wounds = if let Some(signature) = new_signature {
        let pool = crate::container::FsPool::new(tmp_tree.to_path_buf(), signature.container.clone());
        crate::heal::validate_pool_against_signature(signature, &pool)?
    } else {
        Vec::new()
    };

    if !wounds.is_empty() {
        return Err(CoreError::PatchCorrupt(format!("{} wounded blocks after apply", wounds.len())));
    }

    if install_folder.exists() {
        fs::remove_dir_all(install_folder)?;
    }
    if let Some(parent) = install_folder.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(tmp_tree, install_folder)?;

    state = advance(state, PatchState::Done)?;
    tracing::debug!(?state, "patch: apply complete");
    Ok(ApplyOutcome { container: header.source, wounds })
}

fn drain_file(body: &mut dyn Read) -> Result<()> {
    loop {
        match read_frame(body)? {
            Frame::Sync => return Ok(()),
            Frame::Eof => return Err(CoreError::PatchCorrupt("unexpected EOF draining skipped file".into())),
            Frame::Op(_) => continue,
        }
    }
}

/// Advances the apply state machine, rejecting any transition that isn't
/// the next step in `Idle -> ReadingHeader -> PerFile -> Committing ->
/// Done`.
fn advance(from: PatchState, to: PatchState) -> Result<PatchState> {
    let allowed = matches!(
        (from, to),
        (PatchState::Idle, PatchState::ReadingHeader)
            | (PatchState::ReadingHeader, PatchState::PerFile)
            | (PatchState::PerFile, PatchState::Committing)
            | (PatchState::Committing, PatchState::Done)
    );
    if !allowed {
        return Err(CoreError::PatchCorrupt(format!("invalid patch state transition {from:?} -> {to:?}")));
    }
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::container::{walk, FsPool, WalkOpts};
    use crate::signature::{read_signature, sign, write_signature};
    use std::fs;

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
    fn apply_reproduces_source_byte_exact() {
        let target_dir = tempfile::tempdir().unwrap();
        fs::write(target_dir.path().join("a.bin"), vec![7u8; 50_000]).unwrap();
        let target_signature = sign_dir(target_dir.path());
        let target_pool = FsPool::new(target_dir.path().to_path_buf(), target_signature.container.clone());

        let source_dir = tempfile::tempdir().unwrap();
        fs::write(source_dir.path().join("a.bin"), {
            let mut v = vec![7u8; 50_000];
            v.extend_from_slice(b"tail bytes that differ");
            v
        })
        .unwrap();
        let source_container = walk(source_dir.path(), &WalkOpts::default()).unwrap();
        let source_pool = FsPool::new(source_dir.path().to_path_buf(), source_container.clone());

        let mut patch_buf = Vec::new();
        let mut sig_buf = Vec::new();
        crate::diff::diff(
            &source_container,
            &source_pool,
            &target_signature,
            &target_pool,
            &mut patch_buf,
            &mut sig_buf,
            0,
            &CancelToken::new(),
        )
        .unwrap();
        let new_signature = read_signature(&sig_buf[..]).unwrap();

        let work = tempfile::tempdir().unwrap();
        let tmp_tree = work.path().join("tmp-tree");
        let install_folder = work.path().join("installed");

        let outcome = apply(
            &patch_buf[..],
            &target_pool,
            &tmp_tree,
            &install_folder,
            Some(&new_signature),
            &CancelToken::new(),
            |_| Ok(()),
        )
        .unwrap();

        assert!(outcome.wounds.is_empty());
        let produced = fs::read(install_folder.join("a.bin")).unwrap();
        let expected = fs::read(source_dir.path().join("a.bin")).unwrap();
        assert_eq!(produced, expected);
    }
}
