//! Newline-framed JSON-RPC 2.0 duplex over TCP or stdio. Each line is one
//! complete JSON value; requests carry `id`, notifications and the startup
//! `listen-notification` line do not.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::{CoreError, Result};

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    pub fn err(id: Value, error: &CoreError) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(RpcError { code: error.code(), message: error.to_string() }) }
    }
}

/// Reads one newline-framed JSON request from `reader`. Returns `Ok(None)`
/// at EOF (the client closed the connection).
pub async fn read_request<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Option<RpcRequest>> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: RpcRequest = serde_json::from_str(trimmed)?;
        return Ok(Some(request));
    }
}

/// Writes one JSON value as a single newline-terminated line, flushing
/// immediately so clients see it without buffering delay.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, value: &impl Serialize) -> Result<()> {
    let mut body = serde_json::to_vec(value)?;
    body.push(b'\n');
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub fn buffered<R: tokio::io::AsyncRead + Unpin>(reader: R) -> BufReader<R> {
    BufReader::new(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_a_single_request_line() {
        let mut reader = buffered(Cursor::new(b"{\"id\":1,\"method\":\"Meta.Authenticate\",\"params\":{}}\n".to_vec()));
        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.method, "Meta.Authenticate");
    }

    #[tokio::test]
    async fn empty_stream_yields_none() {
        let mut reader = buffered(Cursor::new(Vec::new()));
        assert!(read_request(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_blank_lines_between_requests() {
        let mut reader = buffered(Cursor::new(b"\n\n{\"id\":2,\"method\":\"X\",\"params\":null}\n".to_vec()));
        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.id, Value::from(2));
    }
}
