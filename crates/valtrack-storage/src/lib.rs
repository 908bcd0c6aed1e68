//! Concurrent HTTP fetch dispatch + match store for valtrack.

use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info_span, warn, Instrument};

mod store;

pub use store::{MatchStore, MemoryMatchStore, PgMatchStore, StoreError};

pub const CRATE_NAME: &str = "valtrack-storage";

/// One outbound request in a dispatch batch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<JsonValue>,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            body: Some(body),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Response payload: parsed JSON when possible, raw text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Json(JsonValue),
    Text(String),
}

/// Outcome of exactly one request. Transport failures land in `error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub status: Option<u16>,
    pub data: Option<ResponseBody>,
    pub url: String,
    pub error: Option<String>,
}

impl FetchResult {
    fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: None,
            data: None,
            url: url.into(),
            error: Some(error.into()),
        }
    }

    pub fn json(&self) -> Option<&JsonValue> {
        match &self.data {
            Some(ResponseBody::Json(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// Scatter/gather HTTP dispatcher: one task per request, results in input order.
#[derive(Debug, Clone)]
pub struct FetchDispatcher {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl FetchDispatcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            default_timeout: config.timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run every request concurrently and wait for all of them to settle.
    ///
    /// Never fails: timeouts, connection errors and panicked tasks all come
    /// back as a [`FetchResult`] with `error` set, at the request's index.
    pub async fn dispatch(&self, requests: Vec<FetchRequest>, timeout: Duration) -> Vec<FetchResult> {
        if requests.is_empty() {
            return Vec::new();
        }

        let urls: Vec<String> = requests.iter().map(|r| r.url.clone()).collect();
        let handles = requests
            .into_iter()
            .map(|request| {
                let client = self.client.clone();
                let span = info_span!("http_fetch", method = %request.method, url = %request.url);
                tokio::spawn(fetch_one(client, request, timeout).instrument(span))
            })
            .collect::<Vec<_>>();

        join_all(handles)
            .await
            .into_iter()
            .zip(urls)
            .map(|(joined, url)| match joined {
                Ok(result) => result,
                Err(join_err) => {
                    warn!(%url, error = %join_err, "fetch task did not complete");
                    FetchResult::failed(url, format!("fetch task failed: {join_err}"))
                }
            })
            .collect()
    }
}

async fn fetch_one(client: reqwest::Client, request: FetchRequest, timeout: Duration) -> FetchResult {
    let FetchRequest {
        method,
        url,
        body,
        headers,
    } = request;

    let mut builder = client.request(method, &url).timeout(timeout);
    for (name, value) in &headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &body {
        builder = builder.json(body);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(%url, error = %err, timeout = err.is_timeout(), "request failed");
            return FetchResult::failed(url, err.to_string());
        }
    };

    let status = response.status().as_u16();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%url, status, error = %err, "reading response body failed");
            return FetchResult::failed(url, err.to_string());
        }
    };

    let data = match serde_json::from_slice::<JsonValue>(&bytes) {
        Ok(value) => ResponseBody::Json(value),
        Err(_) => ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
    };

    FetchResult {
        status: Some(status),
        data: Some(data),
        url,
        error: None,
    }
}
