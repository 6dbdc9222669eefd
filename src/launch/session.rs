//! Remote play-session tracking: a registry of running games (an
//! `Arc<Mutex<HashMap<...>>>`) merged with a post-and-forget telemetry
//! channel, because a session *is* a running game's telemetry channel for
//! the duration of the launch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::remote::ApiClient;

#[derive(Clone, Debug)]
pub struct RunningLaunch {
    pub game_id: String,
    pub upload_id: String,
    pub build_id: String,
    pub platform: String,
    pub arch: String,
    pub pid: u32,
    pub session_id: String,
    pub started_at: i64,
    pub seconds_run: u64,
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    game_id: &'a str,
    upload_id: &'a str,
    build_id: &'a str,
    platform: &'a str,
    arch: &'a str,
    last_run_at: i64,
}

#[derive(serde::Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct UpdateSessionRequest {
    session_id: String,
    seconds_run: u64,
    last_run_at: i64,
    crashed: bool,
}

#[derive(Clone, Default)]
pub struct SessionTracker {
    api: Option<ApiClient>,
    running: Arc<Mutex<HashMap<String, RunningLaunch>>>,
}

impl SessionTracker {
    pub fn new(api: ApiClient) -> Self {
        Self { api: Some(api), running: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn list(&self) -> Vec<RunningLaunch> {
        self.lock().values().cloned().collect()
    }

    /// Opens a remote session for a launch. If the create call fails, the
    /// tracker silently gives up tracking this launch rather than aborting
    /// it: running the game always takes precedence over telemetry.
    pub async fn open(&self, game_id: &str, upload_id: &str, build_id: &str, platform: &str, arch: &str, pid: u32, last_run_at: i64) {
        let Some(api) = &self.api else { return };
        let request = CreateSessionRequest { game_id, upload_id, build_id, platform, arch, last_run_at };
        let response: crate::errors::Result<CreateSessionResponse> = api.post("sessions", &request).await;
        let session_id = match response {
            Ok(r) => r.session_id,
            Err(err) => {
                tracing::warn!(game_id, error = %err, "session tracker: create failed, launch proceeds untracked");
                return;
            }
        };

        self.lock().insert(
            game_id.to_string(),
            RunningLaunch {
                game_id: game_id.to_string(),
                upload_id: upload_id.to_string(),
                build_id: build_id.to_string(),
                platform: platform.to_string(),
                arch: arch.to_string(),
                pid,
                session_id,
                started_at: last_run_at,
                seconds_run: 0,
            },
        );
    }

    /// Called roughly once a minute while the launched process runs.
    /// Timeouts are logged at `warn` and never abort the launch.
    pub async fn heartbeat(&self, game_id: &str, seconds_run: u64, now: i64) {
        self.update(game_id, seconds_run, now, false).await;
    }

    pub async fn close(&self, game_id: &str, seconds_run: u64, now: i64, crashed: bool) {
        self.update(game_id, seconds_run, now, crashed).await;
        self.lock().remove(game_id);
    }

    async fn update(&self, game_id: &str, seconds_run: u64, now: i64, crashed: bool) {
        let Some(api) = &self.api else { return };
        let session_id = match self.lock().get(game_id) {
            Some(running) => running.session_id.clone(),
            None => return,
        };
        let request = UpdateSessionRequest { session_id, seconds_run, last_run_at: now, crashed };
        let response: crate::errors::Result<serde_json::Value> = api.post("sessions/update", &request).await;
        if let Err(err) = response {
            tracing::warn!(game_id, error = %err, "session tracker: heartbeat failed");
        }
        if let Some(running) = self.lock().get_mut(game_id) {
            running.seconds_run = seconds_run;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RunningLaunch>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Interval between heartbeat posts while a launch is running.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_starts_empty() {
        let tracker = SessionTracker::default();
        assert!(tracker.list().is_empty());
    }
}
