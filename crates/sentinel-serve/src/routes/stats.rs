//! Counter read endpoint.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Query parameters for `GET /stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsQuery {
    /// Only return counters whose key starts with this prefix.
    pub prefix: Option<String>,
}

/// `GET /stats`
///
/// Returns every counter as a JSON object of `key -> value`, ordered by key.
pub async fn counters(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<BTreeMap<String, i64>>, ApiError> {
    let prefix = query.prefix.as_deref().map(str::as_bytes);
    let counters = state.counters.fetch_all(prefix)?;
    tracing::debug!(count = counters.len(), prefix = ?query.prefix, "served counters");
    Ok(Json(counters))
}
