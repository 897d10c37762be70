//! Relational store for normalized state records: keyed upsert, paginated
//! search, and the deduplicate/clear maintenance operations.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use inegi_core::StateRecord;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, SqlitePool};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "inegi-store";

const TABLE: &str = "inegi_states";

const SELECT_COLUMNS: &str = "id, cvegeo, cve_ent, nomgeo, nom_abrev, pob_total, \
     pob_femenina, pob_masculina, total_viviendas_habitadas, raw, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Persisted state row: the canonical record plus surrogate id.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct StateRow {
    pub id: i64,
    pub cvegeo: String,
    pub cve_ent: String,
    pub nomgeo: Option<String>,
    pub nom_abrev: Option<String>,
    pub pob_total: Option<i64>,
    pub pob_femenina: Option<i64>,
    pub pob_masculina: Option<i64>,
    pub total_viviendas_habitadas: Option<i64>,
    pub raw: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub search: Option<String>,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone)]
pub struct ListPage {
    pub rows: Vec<StateRow>,
    pub filtered_total: i64,
    pub overall_total: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DedupReport {
    pub duplicated_keys: i64,
    pub duplicate_rows: i64,
    pub deleted_rows: u64,
    pub final_total: i64,
}

#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    /// Opens (creating if missing) the database and applies the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // In-memory databases exist per connection, so they get a pool of one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS inegi_states (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 cvegeo TEXT NOT NULL,\
                 cve_ent TEXT NOT NULL,\
                 nomgeo TEXT,\
                 nom_abrev TEXT,\
                 pob_total INTEGER,\
                 pob_femenina INTEGER,\
                 pob_masculina INTEGER,\
                 total_viviendas_habitadas INTEGER,\
                 raw TEXT,\
                 created_at TEXT NOT NULL,\
                 updated_at TEXT NOT NULL\
             )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_inegi_states_cve_ent ON inegi_states (cve_ent)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS ix_inegi_states_cvegeo ON inegi_states (cvegeo)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert-or-update keyed on `cve_ent`, all records in one transaction.
    /// Every record is written; `created_at` survives updates.
    pub async fn upsert_batch(&self, records: &[StateRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO inegi_states \
                     (cvegeo, cve_ent, nomgeo, nom_abrev, pob_total, pob_femenina, \
                      pob_masculina, total_viviendas_habitadas, raw, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(cve_ent) DO UPDATE SET \
                     cvegeo = excluded.cvegeo, \
                     nomgeo = excluded.nomgeo, \
                     nom_abrev = excluded.nom_abrev, \
                     pob_total = excluded.pob_total, \
                     pob_femenina = excluded.pob_femenina, \
                     pob_masculina = excluded.pob_masculina, \
                     total_viviendas_habitadas = excluded.total_viviendas_habitadas, \
                     raw = excluded.raw, \
                     updated_at = excluded.updated_at",
            )
            .bind(&record.cvegeo)
            .bind(&record.cve_ent)
            .bind(&record.nomgeo)
            .bind(&record.nom_abrev)
            .bind(record.pob_total.map(|v| v as i64))
            .bind(record.pob_femenina.map(|v| v as i64))
            .bind(record.pob_masculina.map(|v| v as i64))
            .bind(record.total_viviendas_habitadas.map(|v| v as i64))
            .bind(record.raw.to_string())
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Existing rows for a batch key set, keyed by `cve_ent`.
    pub async fn fetch_by_codes(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, StateRow>, StoreError> {
        if codes.is_empty() {
            return Ok(HashMap::new());
        }
        let mut builder = QueryBuilder::new(format!(
            "SELECT {SELECT_COLUMNS} FROM {TABLE} WHERE cve_ent IN ("
        ));
        let mut separated = builder.separated(", ");
        for code in codes {
            separated.push_bind(code);
        }
        builder.push(")");
        let rows: Vec<StateRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| (r.cve_ent.clone(), r)).collect())
    }

    pub async fn find_by_code(&self, cve_ent: &str) -> Result<Option<StateRow>, StoreError> {
        let row = sqlx::query_as::<_, StateRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM {TABLE} WHERE cve_ent = ?1"
        ))
        .bind(cve_ent)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {TABLE}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Substring search over name/abbreviation/code with offset pagination,
    /// ordered by entity code.
    pub async fn list(&self, params: &ListParams) -> Result<ListPage, StoreError> {
        let overall_total = self.count().await?;
        let page = params.page.max(1);
        let per_page = params.per_page.max(1);
        let offset = i64::from(page - 1) * i64::from(per_page);

        let (rows, filtered_total) = match params.search.as_deref().filter(|s| !s.is_empty()) {
            Some(term) => {
                let pattern = format!("%{term}%");
                let (filtered,): (i64,) = sqlx::query_as(&format!(
                    "SELECT COUNT(*) FROM {TABLE} \
                     WHERE nomgeo LIKE ?1 OR nom_abrev LIKE ?1 OR cve_ent LIKE ?1"
                ))
                .bind(&pattern)
                .fetch_one(&self.pool)
                .await?;
                let rows = sqlx::query_as::<_, StateRow>(&format!(
                    "SELECT {SELECT_COLUMNS} FROM {TABLE} \
                     WHERE nomgeo LIKE ?1 OR nom_abrev LIKE ?1 OR cve_ent LIKE ?1 \
                     ORDER BY cve_ent LIMIT ?2 OFFSET ?3"
                ))
                .bind(&pattern)
                .bind(i64::from(per_page))
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (rows, filtered)
            }
            None => {
                let rows = sqlx::query_as::<_, StateRow>(&format!(
                    "SELECT {SELECT_COLUMNS} FROM {TABLE} ORDER BY cve_ent LIMIT ?1 OFFSET ?2"
                ))
                .bind(i64::from(per_page))
                .bind(offset)
                .fetch_all(&self.pool)
                .await?;
                (rows, overall_total)
            }
        };

        Ok(ListPage {
            rows,
            filtered_total,
            overall_total,
        })
    }

    /// Removes duplicate rows per `cve_ent`, keeping the lowest surrogate id.
    /// A second call on a deduplicated table reports zero of everything.
    pub async fn deduplicate(&self) -> Result<DedupReport, StoreError> {
        let groups: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT cve_ent, COUNT(*) AS conteo FROM {TABLE} \
             GROUP BY cve_ent HAVING COUNT(*) > 1"
        ))
        .fetch_all(&self.pool)
        .await?;

        let duplicated_keys = groups.len() as i64;
        let duplicate_rows: i64 = groups.iter().map(|(_, count)| count - 1).sum();

        let deleted_rows = if duplicate_rows > 0 {
            let result = sqlx::query(&format!(
                "DELETE FROM {TABLE} \
                 WHERE id NOT IN (SELECT MIN(id) FROM {TABLE} GROUP BY cve_ent)"
            ))
            .execute(&self.pool)
            .await?;
            result.rows_affected()
        } else {
            0
        };

        let final_total = self.count().await?;
        info!(duplicated_keys, deleted_rows, final_total, "deduplicate pass finished");

        Ok(DedupReport {
            duplicated_keys,
            duplicate_rows,
            deleted_rows,
            final_total,
        })
    }

    /// Empties the table and resets the surrogate id sequence. Irreversible.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {TABLE}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sqlite_sequence WHERE name = ?1")
            .bind(TABLE)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
