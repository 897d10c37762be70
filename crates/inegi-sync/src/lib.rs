//! Sync reconciliation: classify incoming records against stored rows and
//! persist the keyed upsert.

use std::collections::HashMap;
use std::time::Duration;

use inegi_client::{CatalogError, CatalogSource, ClientConfig, RetryPolicy};
use inegi_core::StateRecord;
use inegi_store::{StateRow, StateStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "inegi-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub inegi_base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://inegi_states.db".to_string()),
            inegi_base_url: std::env::var("INEGI_BASE_URL")
                .unwrap_or_else(|_| "https://gaia.inegi.org.mx/wscatgeo/v2".to_string()),
            http_timeout_secs: std::env::var("INEGI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("INEGI_USER_AGENT")
                .unwrap_or_else(|_| "inegi-sync/0.1".to_string()),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.inegi_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub counts: SyncCounts,
    pub total_received: usize,
}

/// Strict field-by-field change detection over the seven business fields.
/// Absent values compare as distinct from empty string or zero; no loose
/// coercion between numeric strings and integers.
pub fn has_changed(row: &StateRow, record: &StateRecord) -> bool {
    row.cvegeo != record.cvegeo
        || row.nomgeo != record.nomgeo
        || row.nom_abrev != record.nom_abrev
        || row.pob_total != record.pob_total.map(|v| v as i64)
        || row.pob_femenina != record.pob_femenina.map(|v| v as i64)
        || row.pob_masculina != record.pob_masculina.map(|v| v as i64)
        || row.total_viviendas_habitadas != record.total_viviendas_habitadas.map(|v| v as i64)
}

/// Informational classification, computed before the upsert; it never
/// changes which rows get written.
pub fn classify(existing: &HashMap<String, StateRow>, incoming: &[StateRecord]) -> SyncCounts {
    let mut counts = SyncCounts::default();
    for record in incoming {
        match existing.get(&record.cve_ent) {
            None => counts.inserted += 1,
            Some(row) if has_changed(row, record) => counts.updated += 1,
            Some(_) => counts.unchanged += 1,
        }
    }
    counts
}

/// Fetches the catalog (optionally falling back to a stale snapshot),
/// classifies against the current store, and writes every incoming record
/// in one transaction.
pub async fn run_sync(
    source: &dyn CatalogSource,
    store: &StateStore,
    allow_stale: bool,
) -> Result<SyncOutcome, SyncError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("state_sync", %run_id, allow_stale);
    let _guard = span.enter();

    let incoming = source.fetch_all(allow_stale).await?;
    let codes: Vec<String> = incoming.iter().map(|r| r.cve_ent.clone()).collect();
    let existing = store.fetch_by_codes(&codes).await?;
    let counts = classify(&existing, &incoming);
    store.upsert_batch(&incoming).await?;

    info!(
        inserted = counts.inserted,
        updated = counts.updated,
        unchanged = counts.unchanged,
        total_received = incoming.len(),
        "state sync finished"
    );

    Ok(SyncOutcome {
        run_id,
        counts,
        total_received: incoming.len(),
    })
}
