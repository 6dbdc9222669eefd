//! The install state machine: the central orchestrator that turns
//! `(game, upload, build)` into a correct on-disk installation.
//! `queue` is pure planning; `perform` drives the resumable transitions
//! (`Plan -> Prepare -> Acquire -> Install -> [Upgrade fallback] -> Commit ->
//! Retire`), persisting a checkpoint before every side effect that can't be
//! undone.

pub mod context;
pub mod events;
pub mod receipt;

use std::io::Read;
use std::path::Path;

use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::container::FsPool;
use crate::errors::{CoreError, Result};
use crate::heal::{heal, validate_pool_against_signature, BlockSource};
use crate::patch;
use crate::signature::SignatureInfo;

pub use context::{acquire_lock, release_lock, InstallContext, InstallStrategy, InstallSubcontext, MetaSubcontext};
pub use events::Event;
pub use receipt::Receipt;

/// External collaborator supplying whatever bytes the install needs: a
/// patch chain for an `Upgrade`, or a full signature plus remote block
/// source for `FreshInstall`/`Heal`. Implemented by the downloader, which
/// lives outside this daemon.
pub trait InstallSource {
    fn open_patch(&self) -> Result<Option<(Box<dyn Read + Send>, FsPool)>>;
    fn open_signature_and_source(&self) -> Result<(SignatureInfo, Box<dyn BlockSource>)>;
}

pub struct InstallOutcome {
    pub receipt: Receipt,
    pub strategy_used: InstallStrategy,
}

/// Plan step: allocates an install id and staging folder, persists the meta
/// subcontext. Pure; performs no installer I/O.
pub fn queue(meta: MetaSubcontext, staging_root: &Path) -> Result<InstallContext> {
    let id = Uuid::new_v4().to_string();
    let ctx = InstallContext {
        id: id.clone(),
        staging_folder: staging_root.join(&id),
        meta,
        install: InstallSubcontext::default(),
        strategy: None,
    };
    ctx.checkpoint()?;
    Ok(ctx)
}

/// Resumes an existing checkpoint if one is on disk for this staging root,
/// otherwise treats this as a fresh `queue`.
pub fn resume_or_queue(meta: MetaSubcontext, staging_root: &Path, install_id: &str) -> Result<InstallContext> {
    let staging_folder = staging_root.join(install_id);
    if let Some(ctx) = InstallContext::load(&staging_folder)? {
        return Ok(ctx);
    }
    let ctx = InstallContext {
        id: install_id.to_string(),
        staging_folder,
        meta,
        install: InstallSubcontext::default(),
        strategy: None,
    };
    ctx.checkpoint()?;
    Ok(ctx)
}

fn derive_strategy(ctx: &InstallContext, receipt: &Option<Receipt>, source: &dyn InstallSource) -> Result<InstallStrategy> {
    let Some(receipt) = receipt else {
        return Ok(InstallStrategy::FreshInstall);
    };
    if receipt.upload_id == ctx.meta.upload_id && receipt.build_id == ctx.meta.build_id {
        return Ok(InstallStrategy::Heal);
    }
    if receipt.upload_id == ctx.meta.upload_id && source.open_patch()?.is_some() {
        return Ok(InstallStrategy::Upgrade);
    }
    Ok(InstallStrategy::FreshInstall)
}

/// Drives `ctx` from wherever its checkpoint left off through to a committed
/// receipt. `on_commit` persists the catalog-side cave row; kept as a
/// callback so this module has no hard dependency on `catalog`.
pub fn perform(
    ctx: &mut InstallContext,
    source: &dyn InstallSource,
    cancel: &CancelToken,
    mut on_commit: impl FnMut(&Receipt) -> Result<()>,
) -> Result<InstallOutcome> {
    acquire_lock(&ctx.meta.install_folder, std::process::id(), "install")?;
    let outcome = perform_locked(ctx, source, cancel, &mut on_commit);
    let _ = release_lock(&ctx.meta.install_folder);
    outcome
}

fn perform_locked(
    ctx: &mut InstallContext,
    source: &dyn InstallSource,
    cancel: &CancelToken,
    on_commit: &mut impl FnMut(&Receipt) -> Result<()>,
) -> Result<InstallOutcome> {
    cancel.check()?;

    // Prepare
    let existing_receipt = Receipt::read(&ctx.meta.install_folder)?;
    if ctx.strategy.is_none() {
        ctx.strategy = Some(derive_strategy(ctx, &existing_receipt, source)?);
        ctx.install.push_event(Event::TaskStarted { strategy: ctx.strategy.unwrap().name().into() });
        ctx.checkpoint()?;
    }

    // Acquire + Install, with upgrade-fallback bookkeeping.
    let receipt = loop {
        cancel.check()?;
        let strategy = ctx.strategy.expect("strategy set above");
        match run_strategy(ctx, strategy, source, cancel) {
            Ok(receipt) => break receipt,
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) if strategy == InstallStrategy::Upgrade && !ctx.install.using_heal_fallback => {
                ctx.install.push_event(Event::Fallback {
                    attempted: InstallStrategy::Upgrade.name().into(),
                    now_trying: InstallStrategy::Heal.name().into(),
                    error: err.to_string(),
                });
                ctx.install.using_heal_fallback = true;
                ctx.strategy = Some(InstallStrategy::Heal);
                ctx.checkpoint()?;
                continue;
            }
            Err(err) => return Err(err),
        }
    };

    // Commit
    receipt.write(&ctx.meta.install_folder)?;
    on_commit(&receipt)?;
    if let Some(old) = &existing_receipt {
        remove_orphan_files(&ctx.meta.install_folder, old, &receipt)?;
    }
    cache_local_signature(&ctx.meta.install_folder)?;
    ctx.install.push_event(Event::TaskSucceeded);
    ctx.checkpoint()?;

    // Retire
    ctx.retire()?;

    Ok(InstallOutcome { receipt, strategy_used: ctx.strategy.unwrap() })
}

fn run_strategy(ctx: &mut InstallContext, strategy: InstallStrategy, source: &dyn InstallSource, cancel: &CancelToken) -> Result<Receipt> {
    match strategy {
        InstallStrategy::Upgrade => run_upgrade(ctx, source, cancel),
        InstallStrategy::FreshInstall | InstallStrategy::Heal => run_heal_or_fresh(ctx, source, cancel),
    }
}

fn run_upgrade(ctx: &mut InstallContext, source: &dyn InstallSource, cancel: &CancelToken) -> Result<Receipt> {
    let (patch_reader, old_pool) = source
        .open_patch()?
        .ok_or_else(|| CoreError::NeedLocal("no patch chain available for upgrade".into()))?;
    let (new_signature, _block_source) = source.open_signature_and_source()?;

    let tmp_tree = ctx.staging_folder.join("tmp-tree");
    let install_folder = ctx.meta.install_folder.clone();
    let outcome = patch::apply(
        patch_reader,
        &old_pool,
        &tmp_tree,
        &install_folder,
        Some(&new_signature),
        cancel,
        |file_index| {
            ctx.install.first_install_result = Some(format!("upgrade:file:{file_index}"));
            ctx.checkpoint()
        },
    )?;

    Ok(Receipt {
        installer_name: "patch-apply".into(),
        game_id: ctx.meta.game_id.clone(),
        upload_id: ctx.meta.upload_id.clone(),
        build_id: ctx.meta.build_id.clone(),
        files: outcome.container.files.iter().map(|f| f.path.clone()).collect(),
        manifest: None,
    })
}

fn run_heal_or_fresh(ctx: &mut InstallContext, source: &dyn InstallSource, cancel: &CancelToken) -> Result<Receipt> {
    let (signature, block_source) = source.open_signature_and_source()?;
    std::fs::create_dir_all(&ctx.meta.install_folder)?;
    let pool = FsPool::new(ctx.meta.install_folder.clone(), signature.container.clone());

    let mut remaining = validate_pool_against_signature(&signature, &pool)?;
    while !remaining.is_empty() {
        cancel.check()?;
        remaining = heal(&signature, &pool, block_source.as_ref())?;
        ctx.install.first_install_result = Some(format!("healed:{}:wounds-left", remaining.len()));
        ctx.checkpoint()?;
    }

    Ok(Receipt {
        installer_name: if ctx.strategy == Some(InstallStrategy::Heal) { "heal".into() } else { "fresh-install".into() },
        game_id: ctx.meta.game_id.clone(),
        upload_id: ctx.meta.upload_id.clone(),
        build_id: ctx.meta.build_id.clone(),
        files: signature.container.files.iter().map(|f| f.path.clone()).collect(),
        manifest: None,
    })
}

const LOCAL_SIGNATURE_RELATIVE_PATH: &str = ".cave/signature.bin";

/// Caches a signature of the freshly-committed install folder on disk, so a
/// later `Heal` can validate against it without waiting on the network round
/// trip to fetch one.
fn cache_local_signature(install_folder: &Path) -> Result<()> {
    let path = install_folder.join(LOCAL_SIGNATURE_RELATIVE_PATH);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = Vec::new();
    crate::signature::sign_to_writer(install_folder, &mut body, 1)?;
    crate::utils::file::write_atomic(&path, &body)?;
    Ok(())
}

fn remove_orphan_files(install_folder: &Path, old: &Receipt, new: &Receipt) -> Result<()> {
    let new_files: std::collections::HashSet<&str> = new.files.iter().map(String::as_str).collect();
    for path in &old.files {
        if !new_files.contains(path.as_str()) {
            let full = install_folder.join(path);
            if full.is_file() {
                let _ = std::fs::remove_file(full);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{walk, WalkOpts};
    use crate::heal::Wound;
    use crate::signature::{read_signature, sign, write_signature};
    use crate::upload::{Host, Os};
    use std::fs;
    use std::io::Cursor;
    use std::io::SeekFrom;
    use std::sync::Mutex;

    struct FakeBlockSource {
        root: std::path::PathBuf,
        container: crate::container::Container,
    }

    impl BlockSource for FakeBlockSource {
        fn fetch(&self, file_index: usize, offset: u64, length: u64) -> Result<Box<dyn Read>> {
            use std::io::{Read as _, Seek as _};
            let path = self.root.join(&self.container.files[file_index].path);
            let mut file = std::fs::File::open(path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf)?;
            Ok(Box::new(Cursor::new(buf)))
        }
    }

    struct FakeSource {
        remote_dir: std::path::PathBuf,
    }

    impl InstallSource for FakeSource {
        fn open_patch(&self) -> Result<Option<(Box<dyn Read + Send>, FsPool)>> {
            Ok(None)
        }

        fn open_signature_and_source(&self) -> Result<(SignatureInfo, Box<dyn BlockSource>)> {
            let container = walk(&self.remote_dir, &WalkOpts::default())?;
            let pool = FsPool::new(self.remote_dir.clone(), container.clone());
            let mut hashes = Vec::new();
            sign(&container, &pool, &CancelToken::new(), |h| {
                hashes.push(h);
                Ok(())
            })?;
            let mut buf = Vec::new();
            write_signature(&mut buf, 0, &container, &hashes)?;
            let info = read_signature(&buf[..])?;
            Ok((
                info.clone(),
                Box::new(FakeBlockSource { root: self.remote_dir.clone(), container: info.container }),
            ))
        }
    }

    #[test]
    fn fresh_install_materializes_every_file() {
        let remote = tempfile::tempdir().unwrap();
        fs::write(remote.path().join("game.bin"), vec![1u8; 10_000]).unwrap();

        let work = tempfile::tempdir().unwrap();
        let staging_root = work.path().join("staging");
        let install_folder = work.path().join("installed");

        let meta = MetaSubcontext {
            game_id: "g1".into(),
            upload_id: "u1".into(),
            build_id: "b1".into(),
            install_folder: install_folder.clone(),
            from_build: None,
            host: Host { os: Os::Linux, is64: true },
        };
        let mut ctx = queue(meta, &staging_root).unwrap();
        let source = FakeSource { remote_dir: remote.path().to_path_buf() };
        let committed = Mutex::new(None);

        let outcome = perform(&mut ctx, &source, &CancelToken::new(), |receipt| {
            *committed.lock().unwrap() = Some(receipt.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(outcome.strategy_used, InstallStrategy::FreshInstall);
        assert!(install_folder.join("game.bin").exists());
        assert!(committed.lock().unwrap().is_some());
        assert!(!ctx.staging_folder.exists());
    }

    #[test]
    fn validate_after_fresh_install_reports_no_wounds() {
        let remote = tempfile::tempdir().unwrap();
        fs::write(remote.path().join("a.bin"), vec![2u8; 5000]).unwrap();
        let container = walk(remote.path(), &WalkOpts::default()).unwrap();
        let pool = FsPool::new(remote.path().to_path_buf(), container.clone());
        let mut hashes = Vec::new();
        sign(&container, &pool, &CancelToken::new(), |h| {
            hashes.push(h);
            Ok(())
        })
        .unwrap();
        let mut buf = Vec::new();
        write_signature(&mut buf, 0, &container, &hashes).unwrap();
        let info = read_signature(&buf[..]).unwrap();
        let wounds: Vec<Wound> = validate_pool_against_signature(&info, &pool).unwrap();
        assert!(wounds.is_empty());
    }
}
