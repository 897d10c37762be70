//! Axum JSON API for the state catalog: list/detail reads, sync trigger,
//! and the deduplicate/clear maintenance endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use inegi_client::{CatalogError, CatalogSource};
use inegi_store::{ListParams, StateStore, StoreError};
use inegi_sync::{run_sync, SyncError};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "inegi-web";

/// Page sizes the list endpoint accepts; anything else silently falls back
/// to the default.
pub const ALLOWED_PAGE_SIZES: [u32; 4] = [10, 25, 50, 100];
pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub source: Arc<dyn CatalogSource>,
}

impl AppState {
    pub fn new(store: StateStore, source: Arc<dyn CatalogSource>) -> Self {
        Self { store, source }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("No encontrado")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Catalog(err) => ApiError::Catalog(err),
            SyncError::Store(err) => err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Catalog(CatalogError::UnexpectedFormat) => StatusCode::BAD_GATEWAY,
            ApiError::Catalog(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

/// Query surface for `GET /states`: the simple API params plus the
/// DataTables convention (`draw`/`start`/`length`/`search[value]`). Values
/// arrive as strings and parse leniently; bad numbers never 400.
#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    q: Option<String>,
    page: Option<String>,
    bloque: Option<String>,
    size: Option<String>,
    draw: Option<String>,
    start: Option<String>,
    length: Option<String>,
    #[serde(rename = "search[value]")]
    search_value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    resynchronize: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/states", get(list_states_handler))
        .route("/states/{cve_ent}", get(show_state_handler))
        .route("/states/sync", post(sync_handler))
        .route("/states/deduplicate", post(deduplicate_handler))
        .route("/states/clear", post(clear_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("INEGI_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving state catalog API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn parse_u32(value: &Option<String>) -> Option<u32> {
    value.as_deref().and_then(|s| s.trim().parse().ok())
}

/// Laravel-style boolean query flag.
fn parse_bool_flag(value: &Option<String>) -> bool {
    value
        .as_deref()
        .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}

/// An explicit `bloque` wins over `size`, which wins over the DataTables
/// `length` by presence; anything outside the allow-list falls back to 10.
fn resolve_page_size(query: &ListQuery) -> u32 {
    let requested = if query.size.is_some() {
        parse_u32(&query.size)
    } else {
        parse_u32(&query.length)
    };
    parse_u32(&query.bloque)
        .filter(|v| ALLOWED_PAGE_SIZES.contains(v))
        .or_else(|| requested.filter(|v| ALLOWED_PAGE_SIZES.contains(v)))
        .unwrap_or(DEFAULT_PAGE_SIZE)
}

async fn list_states_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let per_page = resolve_page_size(&query);
    let datatables = query.draw.is_some();
    let page = if datatables {
        parse_u32(&query.start).unwrap_or(0) / per_page + 1
    } else {
        parse_u32(&query.page).unwrap_or(1).max(1)
    };

    let search = query
        .q
        .clone()
        .or_else(|| query.search_value.clone())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let listing = state
        .store
        .list(&ListParams { search, page, per_page })
        .await?;

    let pages = (listing.filtered_total + i64::from(per_page) - 1) / i64::from(per_page);
    let meta = json!({
        "page": page,
        "bloque_aplicado": per_page,
        "bloques_permitidos": ALLOWED_PAGE_SIZES,
        "total": listing.filtered_total,
        "pages": pages.max(1),
    });

    if datatables {
        let data: Vec<JsonValue> = listing
            .rows
            .iter()
            .map(|row| {
                json!({
                    "cve_ent": row.cve_ent,
                    "nomgeo": row.nomgeo,
                    "nom_abrev": row.nom_abrev,
                    "pob_total": row.pob_total,
                    "acciones": format!("/states/{}", row.cve_ent),
                })
            })
            .collect();
        return Ok(Json(json!({
            "draw": parse_u32(&query.draw).unwrap_or(1),
            "recordsTotal": listing.overall_total,
            "recordsFiltered": listing.filtered_total,
            "data": data,
            "meta": meta,
        })));
    }

    let data: Vec<JsonValue> = listing
        .rows
        .iter()
        .map(|row| {
            json!({
                "cvegeo": row.cvegeo,
                "cve_ent": row.cve_ent,
                "nomgeo": row.nomgeo,
                "nom_abrev": row.nom_abrev,
                "pob_total": row.pob_total,
            })
        })
        .collect();
    Ok(Json(json!({ "data": data, "meta": meta })))
}

async fn show_state_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(cve_ent): AxumPath<String>,
) -> Result<Json<JsonValue>, ApiError> {
    // Numeric-only path param, auto zero-padded to two digits.
    if cve_ent.is_empty() || !cve_ent.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::NotFound);
    }
    let padded = format!("{cve_ent:0>2}");
    let row = state
        .store
        .find_by_code(&padded)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(json!({
        "cvegeo": row.cvegeo,
        "cve_ent": row.cve_ent,
        "nomgeo": row.nomgeo,
        "nom_abrev": row.nom_abrev,
        "pob_total": row.pob_total,
    })))
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let allow_stale = parse_bool_flag(&query.resynchronize);
    let outcome = run_sync(state.source.as_ref(), &state.store, allow_stale).await?;

    Ok(Json(json!({
        "insertados": outcome.counts.inserted,
        "actualizados": outcome.counts.updated,
        "sin_cambios": outcome.counts.unchanged,
        "total_recibidos": outcome.total_received,
        "resynchronize_param": allow_stale,
    })))
}

async fn deduplicate_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JsonValue>, ApiError> {
    let report = state.store.deduplicate().await?;
    Ok(Json(json!({
        "claves_duplicadas": report.duplicated_keys,
        "filas_duplicadas": report.duplicate_rows,
        "filas_eliminadas": report.deleted_rows,
        "total_final": report.final_total,
    })))
}

async fn clear_handler(State(state): State<Arc<AppState>>) -> Result<Json<JsonValue>, ApiError> {
    state.store.clear().await?;
    Ok(Json(json!({
        "ok": true,
        "mensaje": "Tabla inegi_states vaciada",
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use inegi_core::StateRecord;
    use tower::ServiceExt;

    struct StubSource {
        response: Result<Vec<StateRecord>, u16>,
    }

    #[async_trait]
    impl CatalogSource for StubSource {
        async fn fetch_all(&self, _allow_stale: bool) -> Result<Vec<StateRecord>, CatalogError> {
            match &self.response {
                Ok(records) => Ok(records.clone()),
                Err(0) => Err(CatalogError::UnexpectedFormat),
                Err(status) => Err(CatalogError::Unavailable { status: *status }),
            }
        }
    }

    fn record(cve_ent: &str, nomgeo: &str, pob_total: Option<u64>) -> StateRecord {
        let stamp = Utc.with_ymd_and_hms(2026, 8, 19, 0, 0, 0).single().unwrap();
        StateRecord {
            cve_ent: cve_ent.to_string(),
            cvegeo: cve_ent.to_string(),
            nomgeo: Some(nomgeo.to_string()),
            nom_abrev: Some(nomgeo.chars().take(4).collect()),
            pob_total,
            pob_femenina: None,
            pob_masculina: None,
            total_viviendas_habitadas: None,
            raw: json!({"cve_ent": cve_ent, "nomgeo": nomgeo}),
            created_at: stamp,
            updated_at: stamp,
        }
    }

    async fn seeded_state(records: Vec<StateRecord>) -> AppState {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        store.upsert_batch(&records).await.unwrap();
        AppState::new(store, Arc::new(StubSource { response: Ok(vec![]) }))
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, JsonValue) {
        request_json(app, "GET", uri).await
    }

    async fn post_json(app: &Router, uri: &str) -> (StatusCode, JsonValue) {
        request_json(app, "POST", uri).await
    }

    async fn request_json(app: &Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(JsonValue::Null);
        (status, value)
    }

    #[test]
    fn page_size_allow_list_with_bloque_priority() {
        let q = |bloque: Option<&str>, size: Option<&str>, length: Option<&str>| ListQuery {
            bloque: bloque.map(String::from),
            size: size.map(String::from),
            length: length.map(String::from),
            ..ListQuery::default()
        };
        assert_eq!(resolve_page_size(&q(None, None, None)), 10);
        assert_eq!(resolve_page_size(&q(Some("25"), None, None)), 25);
        assert_eq!(resolve_page_size(&q(Some("30"), Some("50"), None)), 50);
        assert_eq!(resolve_page_size(&q(Some("25"), Some("50"), None)), 25);
        assert_eq!(resolve_page_size(&q(None, None, Some("100"))), 100);
        // Present-but-invalid size shadows a valid length.
        assert_eq!(resolve_page_size(&q(None, Some("30"), Some("25"))), 10);
        assert_eq!(resolve_page_size(&q(Some("abc"), None, Some("7"))), 10);
    }

    #[test]
    fn boolean_flag_accepts_the_laravel_truthy_set() {
        let some = |s: &str| Some(s.to_string());
        assert!(parse_bool_flag(&some("1")));
        assert!(parse_bool_flag(&some("true")));
        assert!(parse_bool_flag(&some("YES")));
        assert!(!parse_bool_flag(&some("0")));
        assert!(!parse_bool_flag(&some("")));
        assert!(!parse_bool_flag(&None));
    }

    #[tokio::test]
    async fn list_simple_mode_pages_and_meta() {
        let state = seeded_state(vec![
            record("01", "Aguascalientes", Some(1_425_607)),
            record("09", "Ciudad de México", Some(9_209_944)),
            record("19", "Nuevo León", Some(5_784_442)),
        ])
        .await;
        let app = app(state);

        let (status, body) = get_json(&app, "/states?bloque=7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["bloque_aplicado"], json!(10));
        assert_eq!(body["meta"]["bloques_permitidos"], json!([10, 25, 50, 100]));
        assert_eq!(body["meta"]["total"], json!(3));
        assert_eq!(body["meta"]["pages"], json!(1));
        assert_eq!(body["data"][0]["cve_ent"], json!("01"));
        assert!(body["data"][0].get("acciones").is_none());

        let (_, filtered) = get_json(&app, "/states?q=nuevo").await;
        assert_eq!(filtered["meta"]["total"], json!(1));
        assert_eq!(filtered["data"][0]["nomgeo"], json!("Nuevo León"));
    }

    #[tokio::test]
    async fn list_empty_store_still_reports_one_page() {
        let app = app(seeded_state(vec![]).await);
        let (status, body) = get_json(&app, "/states").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["meta"]["total"], json!(0));
        assert_eq!(body["meta"]["pages"], json!(1));
    }

    #[tokio::test]
    async fn list_datatables_mode_adds_draw_counts_and_action_links() {
        let records: Vec<StateRecord> = (1..=12)
            .map(|n| record(&format!("{n:02}"), &format!("Estado {n:02}"), None))
            .collect();
        let app = app(seeded_state(records).await);

        let (status, body) =
            get_json(&app, "/states?draw=3&start=10&length=10&search%5Bvalue%5D=").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["draw"], json!(3));
        assert_eq!(body["recordsTotal"], json!(12));
        assert_eq!(body["recordsFiltered"], json!(12));
        assert_eq!(body["meta"]["page"], json!(2));
        assert_eq!(body["meta"]["pages"], json!(2));
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"][0]["acciones"], json!("/states/11"));

        let (_, searched) = get_json(&app, "/states?draw=1&start=0&length=10&search%5Bvalue%5D=Estado+03").await;
        assert_eq!(searched["recordsFiltered"], json!(1));
        assert_eq!(searched["recordsTotal"], json!(12));
    }

    #[tokio::test]
    async fn show_pads_the_code_and_404s_on_miss_or_non_numeric() {
        let app = app(seeded_state(vec![record("01", "Aguascalientes", Some(1_425_607))]).await);

        let (status, body) = get_json(&app, "/states/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cve_ent"], json!("01"));
        assert_eq!(body["cvegeo"], json!("01"));
        assert_eq!(body["nomgeo"], json!("Aguascalientes"));
        assert_eq!(body["pob_total"], json!(1_425_607));

        let (status, _) = get_json(&app, "/states/99").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(&app, "/states/ags").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn normalized_record_round_trips_through_store_and_detail() {
        let payload = json!({
            "datos": [{
                "cve_ent": "1",
                "cvegeo": "01",
                "nomgeo": "Aguascalientes",
                "nom_abrev": "Ags.",
                "pob_total": "1,425,607"
            }]
        });
        let stamp = Utc.with_ymd_and_hms(2026, 8, 19, 0, 0, 0).single().unwrap();
        let records = inegi_core::normalize_states(&payload, stamp).unwrap();

        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        store.upsert_batch(&records).await.unwrap();
        let app = app(AppState::new(store, Arc::new(StubSource { response: Ok(vec![]) })));

        let (status, body) = get_json(&app, "/states/01").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cvegeo"], json!("01"));
        assert_eq!(body["cve_ent"], json!("01"));
        assert_eq!(body["nomgeo"], json!("Aguascalientes"));
        assert_eq!(body["nom_abrev"], json!("Ags."));
        assert_eq!(body["pob_total"], json!(1_425_607));
    }

    #[tokio::test]
    async fn sync_endpoint_reports_counts_and_echoes_the_flag() {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        let source = StubSource {
            response: Ok(vec![
                record("01", "Aguascalientes", Some(1)),
                record("19", "Nuevo León", Some(2)),
            ]),
        };
        let app = app(AppState::new(store, Arc::new(source)));

        let (status, body) = post_json(&app, "/states/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["insertados"], json!(2));
        assert_eq!(body["actualizados"], json!(0));
        assert_eq!(body["sin_cambios"], json!(0));
        assert_eq!(body["total_recibidos"], json!(2));
        assert_eq!(body["resynchronize_param"], json!(false));

        let (_, again) = post_json(&app, "/states/sync?resynchronize=1").await;
        assert_eq!(again["insertados"], json!(0));
        assert_eq!(again["sin_cambios"], json!(2));
        assert_eq!(again["resynchronize_param"], json!(true));
    }

    #[tokio::test]
    async fn sync_maps_upstream_failures_to_503_and_502() {
        let store = StateStore::connect("sqlite::memory:").await.unwrap();
        let app_down = app(AppState::new(
            store.clone(),
            Arc::new(StubSource { response: Err(500) }),
        ));
        let (status, body) = post_json(&app_down, "/states/sync").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["message"].as_str().unwrap().contains("HTTP 500"));

        let app_bad_format = app(AppState::new(
            store,
            Arc::new(StubSource { response: Err(0) }),
        ));
        let (status, _) = post_json(&app_bad_format, "/states/sync").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn deduplicate_endpoint_is_idempotent_over_http() {
        let app = app(seeded_state(vec![record("01", "Aguascalientes", None)]).await);

        let (status, body) = post_json(&app, "/states/deduplicate").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["claves_duplicadas"], json!(0));
        assert_eq!(body["filas_eliminadas"], json!(0));
        assert_eq!(body["total_final"], json!(1));
    }

    #[tokio::test]
    async fn clear_endpoint_empties_the_store() {
        let app = app(seeded_state(vec![
            record("01", "Aguascalientes", None),
            record("02", "Baja California", None),
        ])
        .await);

        let (status, body) = post_json(&app, "/states/clear").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["mensaje"], json!("Tabla inegi_states vaciada"));

        let (_, listing) = get_json(&app, "/states").await;
        assert_eq!(listing["meta"]["total"], json!(0));
    }
}
