//! External-facing JSON-RPC 2.0 duplex. Thin by design: it authenticates a
//! connection, looks up a method in the immutable router, and dispatches
//! into the core subsystems. It never reimplements them.

pub mod notify;
pub mod router;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;

use crate::cancel::CancelRegistry;
use crate::catalog::queries::{CaveQueries, CheckpointQueries, DownloadQueries, InstallLocationQueries};
use crate::catalog::Catalog;
use crate::config::{DaemonConfig, Transport};
use crate::download::{DownloadItem, DownloadScheduler, DownloadStatus};
use crate::errors::{CoreError, Result};
use crate::launch::session::SessionTracker;
use crate::upload::{Host, Upload};

use notify::{BoxedWriter, NotificationSink};
use router::{Handler, HandlerFuture, Router};
use transport::{read_request, write_line, RpcResponse};

pub struct RpcState {
    pub catalog: Catalog,
    pub cancel_registry: CancelRegistry,
    pub downloads: DownloadScheduler,
    pub sessions: SessionTracker,
    pub config: DaemonConfig,
    pub secret: String,
}

/// Generates the per-run secret a client must echo back in
/// `Meta.Authenticate`, first handed to it in the `listen-notification` line.
pub fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:x}", rng.gen_range(0..16))).collect()
}

fn build_router() -> Router {
    let mut router = Router::new();
    router.register("Install.Queue", handlers::install_queue);
    router.register("Install.Perform", handlers::install_perform);
    router.register("Install.Cancel", handlers::install_cancel);
    router.register("Uninstall.Perform", handlers::uninstall_perform);
    router.register("Downloads.Queue", handlers::downloads_queue);
    router.register("Downloads.Prioritize", handlers::downloads_prioritize);
    router.register("Downloads.List", handlers::downloads_list);
    router.register("Downloads.Discard", handlers::downloads_discard);
    router.register("Downloads.Drive", handlers::downloads_drive);
    router.register("Downloads.ReportProgress", handlers::downloads_report_progress);
    router.register("Downloads.DriveCancel", handlers::downloads_drive_cancel);
    router.register("Downloads.ClearFinished", handlers::downloads_clear_finished);
    router.register("Downloads.Retry", handlers::downloads_retry);
    router.register("Caves.SetPinned", handlers::caves_set_pinned);
    router.register("Caves.List", handlers::caves_list);
    router.register("Caves.FilterByGame", handlers::caves_filter_by_game);
    router.register("Game.FindUploads", handlers::game_find_uploads);
    router.register("Launch", handlers::launch);
    router
}

/// Returns the catalog's default install location, creating one under the
/// daemon's root directory the first time a cave is queued.
fn default_install_location(state: &RpcState) -> Result<crate::catalog::queries::InstallLocationRow> {
    use crate::catalog::queries::InstallLocationRow;

    if let Some(location) = state.catalog.get_default_install_location()? {
        return Ok(location);
    }
    let path = state.config.root_dir().join("games");
    std::fs::create_dir_all(&path)?;
    let location = InstallLocationRow {
        id: uuid::Uuid::new_v4().to_string(),
        path: path.to_string_lossy().to_string(),
        is_default: true,
        size_bytes: 0,
    };
    state.catalog.upsert_install_location(&location)?;
    Ok(location)
}

pub async fn serve(config: DaemonConfig, state: Arc<RpcState>) -> Result<()> {
    let router = Arc::new(build_router());
    match config.transport {
        Transport::Stdio => {
            let reader = BufReader::new(Box::new(tokio::io::stdin()) as Box<dyn AsyncRead + Unpin + Send>);
            let writer: BoxedWriter = Box::new(tokio::io::stdout());
            let writer = Arc::new(AsyncMutex::new(writer));
            write_listen_notification(&writer, &state, None).await?;
            serve_connection(reader, writer, state, router).await
        }
        Transport::Tcp => {
            let listener = TcpListener::bind(&config.address).await?;
            let local_addr = listener.local_addr()?;
            tracing::info!(address = %local_addr, "rpc: listening");

            let stdout: BoxedWriter = Box::new(tokio::io::stdout());
            let stdout = Arc::new(AsyncMutex::new(stdout));
            write_listen_notification(&stdout, &state, Some(local_addr)).await?;

            loop {
                let (stream, peer) = listener.accept().await?;
                tracing::info!(%peer, "rpc: connection accepted");
                let (read_half, write_half) = stream.into_split();
                let reader = BufReader::new(Box::new(read_half) as Box<dyn AsyncRead + Unpin + Send>);
                let writer: BoxedWriter = Box::new(write_half);
                let writer = Arc::new(AsyncMutex::new(writer));
                let state = state.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(reader, writer, state, router).await {
                        tracing::warn!(%peer, error = %err, "rpc: connection ended with error");
                    }
                });
                if !config.keep_alive {
                    break;
                }
            }
            Ok(())
        }
    }
}

/// Announces the daemon's secret (and, for TCP, the bound ephemeral port)
/// to whatever process is supervising this one. Written once at startup to
/// the daemon's real stdout, since a front-end must read it there before
/// it has any other way to find the daemon.
async fn write_listen_notification(
    writer: &Arc<AsyncMutex<BoxedWriter>>,
    state: &Arc<RpcState>,
    tcp_addr: Option<std::net::SocketAddr>,
) -> Result<()> {
    let mut guard = writer.lock().await;
    let mut notification = json!({
        "type": "caved/listen-notification",
        "secret": state.secret,
    });
    if let Some(addr) = tcp_addr {
        notification["tcp"] = json!({ "address": addr.to_string() });
    }
    write_line(&mut *guard, &notification).await
}

async fn serve_connection(
    mut reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    writer: Arc<AsyncMutex<BoxedWriter>>,
    state: Arc<RpcState>,
    router: Arc<Router>,
) -> Result<()> {
    let notify = NotificationSink::new(writer.clone());
    let authenticated = AtomicBool::new(false);

    loop {
        let request = match read_request(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err) => return Err(err),
        };

        let response = if request.method == "Meta.Authenticate" {
            match authenticate(&state, &request.params) {
                Ok(()) => {
                    authenticated.store(true, Ordering::SeqCst);
                    RpcResponse::ok(request.id, json!({ "ok": true }))
                }
                Err(err) => RpcResponse::err(request.id, &err),
            }
        } else if !authenticated.load(Ordering::SeqCst) {
            RpcResponse::err(request.id, &CoreError::Unauthenticated)
        } else {
            match router.get(&request.method) {
                Some(handler) => {
                    dispatch(handler, state.clone(), notify.clone(), request.id.clone(), request.params).await
                }
                None => RpcResponse::err(request.id, &CoreError::NotFound(format!("unknown method {}", request.method))),
            }
        };

        let mut guard = writer.lock().await;
        write_line(&mut *guard, &response).await?;
    }
}

async fn dispatch(handler: Handler, state: Arc<RpcState>, notify: NotificationSink, id: Value, params: Value) -> RpcResponse {
    match handler(state, notify, params).await {
        Ok(result) => RpcResponse::ok(id, result),
        Err(err) => RpcResponse::err(id, &err),
    }
}

#[derive(Deserialize)]
struct AuthenticateParams {
    secret: String,
}

fn authenticate(state: &RpcState, params: &Value) -> Result<()> {
    let parsed: AuthenticateParams = serde_json::from_value(params.clone())?;
    if parsed.secret == state.secret {
        Ok(())
    } else {
        Err(CoreError::Unauthenticated)
    }
}

mod handlers {
    use super::*;
    use crate::install::context::MetaSubcontext;
    use crate::upload;

    pub fn install_queue(state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                id: Option<String>,
                game_id: String,
                upload_id: String,
                build_id: String,
                install_folder: std::path::PathBuf,
                from_build: Option<String>,
                host: Host,
            }
            let parsed: Params = serde_json::from_value(params)?;
            let meta = MetaSubcontext {
                game_id: parsed.game_id,
                upload_id: parsed.upload_id,
                build_id: parsed.build_id,
                install_folder: parsed.install_folder,
                from_build: parsed.from_build,
                host: parsed.host,
            };
            // A client resuming a previous `Install.Queue` passes back the id
            // it was handed, so a dropped connection never loses checkpoint
            // progress.
            let ctx = match parsed.id {
                Some(id) => crate::install::resume_or_queue(meta, &state.config.staging_root(), &id)?,
                None => crate::install::queue(meta, &state.config.staging_root())?,
            };
            state.catalog.upsert_checkpoint(&crate::catalog::queries::CheckpointRow {
                install_id: ctx.id.clone(),
                cave_id: None,
                staging_folder: ctx.staging_folder.to_string_lossy().to_string(),
                strategy: ctx.strategy.map(|s| s.name().to_string()),
                checkpoint_json: serde_json::to_string(&ctx)?,
                updated_at: chrono::Utc::now().timestamp(),
            })?;

            let location = default_install_location(&state)?;
            let folder_name = ctx
                .meta
                .install_folder
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| ctx.meta.game_id.clone());
            state.catalog.upsert_cave(&crate::catalog::queries::CaveRow {
                id: ctx.id.clone(),
                game_id: ctx.meta.game_id.clone(),
                install_location_id: location.id,
                folder_name,
                upload_id: ctx.meta.upload_id.clone(),
                build_id: ctx.meta.build_id.clone(),
                last_launched_at: None,
                seconds_run: 0,
                pinned: false,
                created_at: chrono::Utc::now().timestamp(),
            })?;

            Ok(json!({ "id": ctx.id }))
        })
    }

    pub fn install_perform(_state: Arc<RpcState>, notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                #[allow(dead_code)]
                id: String,
            }
            let _parsed: Params = serde_json::from_value(params)?;
            let _ = notify.task_started("install").await;
            // Archive/download provisioning lives outside this daemon; this
            // thin shim has no `InstallSource` to hand the state machine
            // without a registered downloader.
            let err = CoreError::NeedLocal("no local block source registered for this install".into());
            let _ = notify.log("error", &err.to_string()).await;
            Err(err)
        })
    }

    pub fn install_cancel(state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                id: String,
            }
            let parsed: Params = serde_json::from_value(params)?;
            let cancelled = state.cancel_registry.cancel(&parsed.id);
            Ok(json!({ "did_cancel": cancelled }))
        })
    }

    pub fn uninstall_perform(state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                cave_id: String,
            }
            let parsed: Params = serde_json::from_value(params)?;
            if let Some(cave) = state.catalog.get_cave(&parsed.cave_id)? {
                if let Some(location) = state
                    .catalog
                    .get_install_locations()?
                    .into_iter()
                    .find(|l| l.id == cave.install_location_id)
                {
                    let folder = std::path::Path::new(&location.path).join(&cave.folder_name);
                    if folder.exists() {
                        std::fs::remove_dir_all(&folder)?;
                    }
                }
            }
            state.catalog.remove_cave(&parsed.cave_id)?;
            Ok(json!({ "ok": true }))
        })
    }

    pub fn downloads_queue(state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                id: String,
                cave_id: String,
                total_bytes: u64,
            }
            let parsed: Params = serde_json::from_value(params)?;
            state.downloads.queue(DownloadItem {
                id: parsed.id.clone(),
                cave_id: parsed.cave_id.clone(),
                status: DownloadStatus::Queued,
                total_bytes: parsed.total_bytes,
                done_bytes: 0,
            });
            state.catalog.upsert_download(&crate::catalog::queries::DownloadRow {
                id: parsed.id,
                cave_id: parsed.cave_id,
                status: "queued".into(),
                total_bytes: parsed.total_bytes as i64,
                done_bytes: 0,
                queue_position: 0,
                queued_at: chrono::Utc::now().timestamp(),
            })?;
            Ok(Value::Null)
        })
    }

    pub fn downloads_prioritize(state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                id: String,
            }
            let parsed: Params = serde_json::from_value(params)?;
            Ok(json!({ "ok": state.downloads.prioritize(&parsed.id) }))
        })
    }

    pub fn downloads_list(state: Arc<RpcState>, _notify: NotificationSink, _params: Value) -> HandlerFuture {
        Box::pin(async move {
            let live: std::collections::HashSet<String> =
                state.downloads.snapshot().iter().map(|item| item.id.clone()).collect();
            let mut items: Vec<_> = state
                .downloads
                .snapshot()
                .into_iter()
                .map(|item| {
                    json!({
                        "id": item.id,
                        "cave_id": item.cave_id,
                        "total_bytes": item.total_bytes,
                        "done_bytes": item.done_bytes,
                    })
                })
                .collect();
            // The in-memory queue only holds this process's lifetime; fold in
            // anything the catalog still has on disk from a previous run
            // that hasn't been re-queued yet.
            for row in state.catalog.get_downloads()? {
                if !live.contains(&row.id) {
                    items.push(json!({
                        "id": row.id,
                        "cave_id": row.cave_id,
                        "total_bytes": row.total_bytes,
                        "done_bytes": row.done_bytes,
                    }));
                }
            }
            Ok(json!({ "items": items }))
        })
    }

    pub fn downloads_discard(state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                id: String,
            }
            let parsed: Params = serde_json::from_value(params)?;
            let removed = state.downloads.discard(&parsed.id);
            if removed {
                state.catalog.remove_download(&parsed.id)?;
            }
            Ok(json!({ "ok": removed }))
        })
    }

    pub fn downloads_drive(state: Arc<RpcState>, _notify: NotificationSink, _params: Value) -> HandlerFuture {
        Box::pin(async move {
            match state.downloads.start_next() {
                Some((item, _token)) => Ok(json!({ "id": item.id })),
                None => Ok(Value::Null),
            }
        })
    }

    /// Called by the external downloader collaborator as bytes land, so the
    /// daemon can forward a rate-limited `Progress` notification
    /// and retire the driver slot once the transfer is done.
    pub fn downloads_report_progress(state: Arc<RpcState>, notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                id: String,
                done_bytes: u64,
                total_bytes: u64,
                done: bool,
            }
            let parsed: Params = serde_json::from_value(params)?;
            if parsed.done {
                state.downloads.finish_driving(&parsed.id);
                notify.progress(1.0).await?;
            } else if state.downloads.should_emit_progress() {
                let fraction = if parsed.total_bytes == 0 { 0.0 } else { parsed.done_bytes as f64 / parsed.total_bytes as f64 };
                notify.progress(fraction).await?;
            }
            Ok(Value::Null)
        })
    }

    pub fn downloads_drive_cancel(state: Arc<RpcState>, _notify: NotificationSink, _params: Value) -> HandlerFuture {
        Box::pin(async move {
            state.downloads.drive_cancel();
            Ok(Value::Null)
        })
    }

    pub fn downloads_clear_finished(_state: Arc<RpcState>, _notify: NotificationSink, _params: Value) -> HandlerFuture {
        // The scheduler drops an item as soon as `finish_driving` runs, so
        // there is never a backlog of finished entries to sweep here.
        Box::pin(async move { Ok(Value::Null) })
    }

    pub fn downloads_retry(state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                id: String,
                cave_id: String,
                total_bytes: u64,
            }
            let parsed: Params = serde_json::from_value(params)?;
            state.downloads.queue(DownloadItem {
                id: parsed.id,
                cave_id: parsed.cave_id,
                status: DownloadStatus::Queued,
                total_bytes: parsed.total_bytes,
                done_bytes: 0,
            });
            Ok(Value::Null)
        })
    }

    pub fn caves_set_pinned(state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                cave_id: String,
                pinned: bool,
            }
            let parsed: Params = serde_json::from_value(params)?;
            let mut cave = state
                .catalog
                .get_cave(&parsed.cave_id)?
                .ok_or_else(|| CoreError::NotFound(format!("cave {}", parsed.cave_id)))?;
            cave.pinned = parsed.pinned;
            state.catalog.upsert_cave(&cave)?;
            Ok(Value::Null)
        })
    }

    pub fn caves_list(state: Arc<RpcState>, _notify: NotificationSink, _params: Value) -> HandlerFuture {
        Box::pin(async move {
            let caves = state.catalog.list_caves()?;
            Ok(json!({ "items": caves.into_iter().map(cave_to_json).collect::<Vec<_>>() }))
        })
    }

    pub fn caves_filter_by_game(state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                game_id: String,
            }
            let parsed: Params = serde_json::from_value(params)?;
            let caves = state.catalog.get_caves_for_game(&parsed.game_id)?;
            Ok(json!({ "items": caves.into_iter().map(cave_to_json).collect::<Vec<_>>() }))
        })
    }

    fn cave_to_json(cave: crate::catalog::queries::CaveRow) -> Value {
        json!({
            "id": cave.id,
            "gameId": cave.game_id,
            "installLocationId": cave.install_location_id,
            "folderName": cave.folder_name,
            "uploadId": cave.upload_id,
            "buildId": cave.build_id,
            "lastLaunchedAt": cave.last_launched_at,
            "secondsRun": cave.seconds_run,
            "pinned": cave.pinned,
            "createdAt": cave.created_at,
        })
    }

    pub fn game_find_uploads(_state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                uploads: Vec<Upload>,
                host: Host,
            }
            let parsed: Params = serde_json::from_value(params)?;
            let outcome = upload::select(&parsed.uploads, &parsed.host);
            Ok(serde_json::to_value(outcome)?)
        })
    }

    pub fn launch(_state: Arc<RpcState>, _notify: NotificationSink, params: Value) -> HandlerFuture {
        Box::pin(async move {
            #[derive(Deserialize)]
            struct Params {
                install_folder: std::path::PathBuf,
                manifest: Option<crate::launch::Manifest>,
                upload_type: crate::upload::UploadType,
                hosts: Vec<Host>,
            }
            let parsed: Params = serde_json::from_value(params)?;
            let targets = crate::launch::resolve(&parsed.install_folder, parsed.manifest.as_ref(), parsed.upload_type, &parsed.hosts);
            Ok(json!({ "targets": targets }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secrets_are_32_hex_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 32);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
