//! HTTP handlers for the enrichment surface: `/assemble` and `/stats`, in the same
//! extractor/error-mapping style as `indexer::search::search`.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use enrich_core::assembler::{AssemblerStats, EnrichmentResult, Overrides};
use serde::Deserialize;

use crate::ServerState;

#[derive(Debug, Deserialize)]
pub struct AssembleRequest {
    pub message: String,
    pub session_id: String,
    #[serde(default)]
    pub overrides: Overrides,
}

/// `POST /assemble` — the core's single entry point (§6).
pub async fn assemble(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<AssembleRequest>,
) -> Result<Json<EnrichmentResult>, (StatusCode, String)> {
    if request.message.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "message must be non-empty".to_owned(),
        ));
    }
    let result = state
        .assembler
        .assemble(&request.message, &request.session_id, request.overrides)
        .await;
    Ok(Json(result))
}

/// `GET /stats` — rolling timing averages, call counts, skip count, cache hit/miss (§4.6).
pub async fn stats(State(state): State<Arc<ServerState>>) -> Json<AssemblerStats> {
    Json(state.assembler.stats().await)
}
