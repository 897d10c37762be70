//! Canonical state record model + pure normalizer for the INEGI catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "inegi-core";

/// Normalized federal-state record as handed from the upstream catalog to
/// the sync pipeline. Field names follow the upstream vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Two-char zero-padded entity code, the business key.
    pub cve_ent: String,
    /// Two-char geo code, defaults to `cve_ent` when absent upstream.
    pub cvegeo: String,
    pub nomgeo: Option<String>,
    pub nom_abrev: Option<String>,
    pub pob_total: Option<u64>,
    pub pob_femenina: Option<u64>,
    pub pob_masculina: Option<u64>,
    pub total_viviendas_habitadas: Option<u64>,
    /// Original upstream properties object, kept verbatim for audit.
    pub raw: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Formato inesperado desde INEGI")]
    UnexpectedFormat,
}

/// Property lookup with null-coalescing semantics: an explicit JSON null
/// behaves like an absent key, an empty string does not.
fn prop<'a>(properties: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
    match properties.get(key) {
        None | Some(JsonValue::Null) => None,
        value => value,
    }
}

fn code_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Derives a two-digit code: first two characters, left-padded with `0`.
/// Returns `None` for absent or blank input.
pub fn two_digit_code(value: Option<&JsonValue>) -> Option<String> {
    let text = value.and_then(code_text)?;
    let head: String = text.chars().take(2).collect();
    Some(format!("{head:0>2}"))
}

/// Digits-only integer coercion. Null and empty string yield `None`, never
/// zero; strings keep only their digits (so a digit-free string collapses
/// to 0) and signed numbers lose their sign, matching the
/// upstream-tolerant behavior of the original service.
pub fn coerce_count(value: Option<&JsonValue>) -> Option<u64> {
    match value? {
        JsonValue::String(s) if s.is_empty() => None,
        JsonValue::String(s) => {
            let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
            Some(digits.parse().unwrap_or(0))
        }
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(i64::unsigned_abs))
            .or_else(|| n.as_f64().map(|f| f.abs() as u64)),
        _ => None,
    }
}

fn text_prop(properties: &JsonValue, key: &str) -> Option<String> {
    prop(properties, key)
        .and_then(JsonValue::as_str)
        .map(ToString::to_string)
}

/// Maps a raw upstream payload into canonical records. Pure, no I/O.
///
/// The record array is located by trying `datos`, then `features`, then the
/// payload itself; each element may be a GeoJSON Feature (`properties`
/// sub-object) or a flat object. Elements without a derivable entity code
/// are silently skipped: partial upstream data is expected, not an error.
pub fn normalize_states(
    payload: &JsonValue,
    stamped_at: DateTime<Utc>,
) -> Result<Vec<StateRecord>, NormalizeError> {
    let list = payload
        .get("datos")
        .or_else(|| payload.get("features"))
        .unwrap_or(payload);
    let rows = list.as_array().ok_or(NormalizeError::UnexpectedFormat)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let properties = row.get("properties").unwrap_or(row);

        // A present-but-blank cve_ent does not fall through to cvegeo.
        let code_source = prop(properties, "cve_ent").or_else(|| prop(properties, "cvegeo"));
        let Some(cve_ent) = two_digit_code(code_source) else {
            continue;
        };
        let cvegeo =
            two_digit_code(prop(properties, "cvegeo")).unwrap_or_else(|| cve_ent.clone());

        out.push(StateRecord {
            cve_ent,
            cvegeo,
            nomgeo: text_prop(properties, "nomgeo"),
            nom_abrev: text_prop(properties, "nom_abrev"),
            pob_total: coerce_count(prop(properties, "pob_total")),
            pob_femenina: coerce_count(prop(properties, "pob_femenina")),
            pob_masculina: coerce_count(prop(properties, "pob_masculina")),
            total_viviendas_habitadas: coerce_count(prop(
                properties,
                "total_viviendas_habitadas",
            )),
            raw: properties.clone(),
            created_at: stamped_at,
            updated_at: stamped_at,
        });
    }
    Ok(out)
}
