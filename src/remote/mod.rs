//! Thin HTTP client for the marketplace API (upload refresh, play-session
//! heartbeats, wounded-block range reads). Authenticates with a single
//! static API key rather than an access/refresh token pair, so there is no
//! 401-triggered refresh loop to manage.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{CoreError, Result};

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .connect_timeout(Duration::from_secs(6))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, base_url, api_key }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.request(Method::GET, path, Option::<()>::None).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: B) -> Result<T> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn request<T: DeserializeOwned, B: Serialize>(&self, method: Method, path: &str, body: Option<B>) -> Result<T> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        let mut request = self.client.request(method, &url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(payload) = body {
            request = request.json(&payload);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(CoreError::Unauthenticated);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::NetworkDisconnected(format!("HTTP {}: {text}", status.as_u16())));
        }
        Ok(response.json::<T>().await?)
    }

    /// Issues an HTTP range request, used by the heal engine's `BlockSource`
    /// to re-fetch wounded byte ranges from a remote archive.
    pub async fn get_range(&self, url: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let end = offset + length.saturating_sub(1);
        let response = self
            .client
            .get(url)
            .header("Range", format!("bytes={offset}-{end}"))
            .send()
            .await?;
        if !response.status().is_success() && response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(CoreError::NetworkDisconnected(format!("range request failed: {}", response.status())));
        }
        Ok(response.bytes().await?.to_vec())
    }
}
