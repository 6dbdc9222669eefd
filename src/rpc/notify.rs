//! One-way notification sink covering `Log`, `TaskStarted`, `TaskSucceeded`,
//! `Progress`, `LaunchRunning`, `LaunchExited`, `PrereqsStarted`,
//! `PrereqsTaskState` and `PrereqsEnded`. A notification is a JSON-RPC 2.0
//! line with a `method` and `params` but no `id`. The writer is boxed so the
//! same sink type serves both the TCP and stdio transports.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use crate::errors::Result;

use super::transport::write_line;

pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

#[derive(Clone)]
pub struct NotificationSink {
    writer: Arc<Mutex<BoxedWriter>>,
}

impl NotificationSink {
    pub fn new(writer: Arc<Mutex<BoxedWriter>>) -> Self {
        Self { writer }
    }

    pub async fn send(&self, method: &str, params: impl Serialize) -> Result<()> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let mut writer = self.writer.lock().await;
        write_line(&mut *writer, &body).await
    }

    pub async fn log(&self, level: &str, message: &str) -> Result<()> {
        self.send("Log", serde_json::json!({ "level": level, "message": message })).await
    }

    pub async fn progress(&self, fraction: f64) -> Result<()> {
        self.send("Progress", serde_json::json!({ "progress": fraction })).await
    }

    pub async fn task_started(&self, strategy: &str) -> Result<()> {
        self.send("TaskStarted", serde_json::json!({ "type": strategy })).await
    }

    pub async fn task_succeeded(&self) -> Result<()> {
        self.send("TaskSucceeded", Value::Null).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn log_notification_round_trips_as_a_json_line() {
        let (client, mut server) = tokio::io::duplex(1024);
        let boxed: BoxedWriter = Box::new(client);
        let sink = NotificationSink::new(Arc::new(Mutex::new(boxed)));
        sink.log("info", "hello").await.unwrap();

        let mut buf = vec![0u8; 1024];
        let read = server.read(&mut buf).await.unwrap();
        let line: Value = serde_json::from_slice(&buf[..read]).unwrap();
        assert_eq!(line["method"], "Log");
        assert_eq!(line["params"]["message"], "hello");
    }
}
