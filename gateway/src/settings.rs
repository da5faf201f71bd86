//! Settings file loading and the `/settings` HTTP surface, following
//! `indexer::settings`'s `InternalSettings` flattening pattern: the bind address lives outside
//! the library's own `Settings`, which is flattened in as `other` when serialized to disk.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use enrich_core::config::Settings;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ServerState;

const SETTINGS_FILE_PATH: &str = "Settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalSettings {
    pub address: String,
    #[serde(flatten)]
    pub other: Settings,
}

impl Default for InternalSettings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:11100".to_owned(),
            other: Settings::default(),
        }
    }
}

pub async fn read_settings_file() -> InternalSettings {
    match tokio::fs::read_to_string(SETTINGS_FILE_PATH).await {
        Ok(s) => toml::from_str(&s).unwrap_or_else(|e| {
            warn!(error = %e, "malformed settings file, using defaults");
            Default::default()
        }),
        Err(e) => {
            warn!(error = %e, "settings file not found, using defaults");
            Default::default()
        }
    }
}

async fn write_settings_file(settings: &Settings) -> std::io::Result<()> {
    let internal = InternalSettings {
        address: std::env::var("ENRICH_GATEWAY_ADDRESS")
            .unwrap_or_else(|_| InternalSettings::default().address),
        other: settings.clone(),
    };
    let s = toml::to_string(&internal)
        .expect("settings serialize to TOML; no field here can fail encoding");
    tokio::fs::write(SETTINGS_FILE_PATH, s).await
}

/// `GET /settings` — the current, live configuration (§6).
pub async fn get_settings(State(state): State<Arc<ServerState>>) -> Json<Settings> {
    Json(state.assembler.settings_snapshot())
}

/// `PUT /settings` — replace the live configuration and persist it to disk.
pub async fn put_settings(
    State(state): State<Arc<ServerState>>,
    Json(new_settings): Json<Settings>,
) -> Result<(), (StatusCode, String)> {
    state.assembler.replace_settings(new_settings.clone());
    write_settings_file(&new_settings)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(())
}
