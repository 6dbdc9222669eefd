//! Events accumulated on the install subcontext and surfaced as RPC
//! notifications.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    TaskStarted { strategy: String },
    Progress { fraction: f64 },
    /// Posted when an `Upgrade` patch apply fails over to `Heal`
    /// (`cmd/operate/install_perform.go`'s `Fallback` shape).
    Fallback { attempted: String, now_trying: String, error: String },
    TaskSucceeded,
}
