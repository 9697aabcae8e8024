// src/transport.rs
//! `GET url -> (status, bytes)`. The fetcher owns every policy decision
//! (what counts as failure, retries, the hard per-call timeout); a
//! transport only moves bytes. `timeout` is a hint for the client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::config::FetchConfig;
use crate::error::NetworkFailure;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Any HTTP status is `Ok`; only connect failures and timeouts are `Err`.
    async fn get(&self, url: &str, timeout: Duration) -> Result<RawResponse, NetworkFailure>;
}

/// reqwest (rustls) transport.
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(cfg: &FetchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.timeout())
            .build()
            .context("building HTTP client")?;
        Ok(Self { http })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> NetworkFailure {
    if err.is_timeout() {
        NetworkFailure::Timeout(timeout)
    } else {
        NetworkFailure::Connect(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<RawResponse, NetworkFailure> {
        let call = async {
            let resp = self
                .http
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| classify(e, timeout))?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await.map_err(|e| classify(e, timeout))?;
            Ok(RawResponse {
                status,
                body: body.to_vec(),
            })
        };
        // Covers body streaming too, not only the request phase.
        match tokio::time::timeout(timeout, call).await {
            Ok(res) => res,
            Err(_) => Err(NetworkFailure::Timeout(timeout)),
        }
    }
}
