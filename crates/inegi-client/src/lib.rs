//! Upstream catalog client: bounded-retry HTTP fetch with a TTL-bounded
//! last-good snapshot fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use inegi_core::{normalize_states, NormalizeError, StateRecord};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info_span, warn};

pub const CRATE_NAME: &str = "inegi-client";

/// Fixed sub-path for the state catalog under the configured base URL.
pub const STATES_PATH: &str = "mgee/";

/// Snapshots older than this are not served even in degraded mode.
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("INEGI no disponible (HTTP {status})")]
    Unavailable { status: u16 },
    #[error("INEGI no disponible ({0})")]
    Transport(#[source] reqwest::Error),
    #[error("Formato inesperado desde INEGI")]
    UnexpectedFormat,
}

impl From<NormalizeError> for CatalogError {
    fn from(_: NormalizeError) -> Self {
        CatalogError::UnexpectedFormat
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Transport failures are retried; anything that produced a status line is
/// not (the failure branch handles it).
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gaia.inegi.org.mx/wscatgeo/v2".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Keyed last-good snapshot store. Injected so the fetch logic stays
/// testable without a real cache backend.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns the snapshot unless expired.
    async fn get(&self) -> Option<Vec<StateRecord>>;
    /// Overwrites the snapshot and resets its TTL.
    async fn put(&self, records: Vec<StateRecord>);
}

#[derive(Debug)]
struct SnapshotEntry {
    records: Vec<StateRecord>,
    stored_at: Instant,
}

/// Process-local snapshot store with atomic single-key get/put semantics.
#[derive(Debug)]
pub struct InMemorySnapshotStore {
    ttl: Duration,
    slot: RwLock<Option<SnapshotEntry>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::with_ttl(SNAPSHOT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn get(&self) -> Option<Vec<StateRecord>> {
        let slot = self.slot.read().await;
        let entry = slot.as_ref()?;
        if entry.stored_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.records.clone())
    }

    async fn put(&self, records: Vec<StateRecord>) {
        let mut slot = self.slot.write().await;
        *slot = Some(SnapshotEntry {
            records,
            stored_at: Instant::now(),
        });
    }
}

/// Seam between the sync pipeline and the live catalog, so handlers and
/// reconciliation can run against a stub source in tests.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_all(&self, allow_stale: bool) -> Result<Vec<StateRecord>, CatalogError>;
}

pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    snapshot: Arc<dyn SnapshotStore>,
}

impl CatalogClient {
    pub fn new(config: ClientConfig, snapshot: Arc<dyn SnapshotStore>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let http = builder.build().context("building reqwest client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: config.retry,
            snapshot,
        })
    }

    fn states_url(&self) -> String {
        format!("{}/{}", self.base_url, STATES_PATH)
    }

    async fn fetch_live(&self) -> Result<Vec<StateRecord>, CatalogError> {
        let url = self.states_url();
        let mut last_transport: Option<reqwest::Error> = None;

        for attempt in 0..=self.retry.max_retries {
            match self
                .http
                .get(&url)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success() {
                        return Err(CatalogError::Unavailable {
                            status: status.as_u16(),
                        });
                    }
                    let payload: JsonValue = resp
                        .json()
                        .await
                        .map_err(|_| CatalogError::UnexpectedFormat)?;
                    return Ok(normalize_states(&payload, Utc::now())?);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.retry.max_retries
                    {
                        last_transport = Some(err);
                        tokio::time::sleep(self.retry.delay).await;
                        continue;
                    }
                    return Err(CatalogError::Transport(err));
                }
            }
        }

        Err(CatalogError::Transport(
            last_transport.expect("retry loop should capture a transport error"),
        ))
    }
}

#[async_trait]
impl CatalogSource for CatalogClient {
    async fn fetch_all(&self, allow_stale: bool) -> Result<Vec<StateRecord>, CatalogError> {
        let span = info_span!("catalog_fetch", allow_stale);
        let _guard = span.enter();

        match self.fetch_live().await {
            Ok(records) => {
                // Every successful fetch overwrites the snapshot, even when
                // the caller did not ask for stale fallback.
                self.snapshot.put(records.clone()).await;
                Ok(records)
            }
            Err(err @ (CatalogError::Unavailable { .. } | CatalogError::Transport(_)))
                if allow_stale =>
            {
                if let Some(records) = self.snapshot.get().await {
                    warn!("INEGI fetch failed, serving last-good snapshot: {err}");
                    return Ok(records);
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
