use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::chunk::Source;
use crate::router::Route;

/// Top-level configuration for the enrichment core.
///
/// Mirrors the closed key set of §6: every field below is read by exactly one component, so a
/// settings file can enable/disable features without the core reaching for ambient globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub enabled: bool,
    pub parallel_execution: bool,
    pub vector_index: VectorIndexSettings,
    pub short_term: ShortTermSettings,
    pub rag: RagSettings,
    pub routing: RoutingSettings,
    pub features: FeatureFlags,
    pub runtime_base_url: Url,
    /// Not a key named in the closed configuration set (§6) — every runtime call needs a model
    /// name and embeddings are no exception, so this fills the gap the same way `routing.model`
    /// names the classifier model. See DESIGN.md.
    pub embed_model: String,
    pub timeouts: TimeoutSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            parallel_execution: true,
            vector_index: VectorIndexSettings::default(),
            short_term: ShortTermSettings::default(),
            rag: RagSettings::default(),
            routing: RoutingSettings::default(),
            features: FeatureFlags::default(),
            runtime_base_url: Url::parse("http://127.0.0.1:11434").unwrap(),
            embed_model: "nomic-embed-text".to_owned(),
            timeouts: TimeoutSettings::default(),
        }
    }
}

/// Per-call deadlines (§5, "Cancellation and timeouts"). Not individually named in §6's closed
/// key set, which only fixes the *behavior* ("a configured deadline", "an overall budget") — these
/// are that configuration made concrete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub embed_ms: u64,
    pub classify_ms: u64,
    pub overall_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            embed_ms: 2_000,
            classify_ms: 3_000,
            overall_ms: 4_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorIndexSettings {
    pub enabled: bool,
    pub stale_after_ms: u64,
}

impl Default for VectorIndexSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_after_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortTermSettings {
    pub max_messages: usize,
    pub max_token_estimate: usize,
}

impl Default for ShortTermSettings {
    fn default() -> Self {
        Self {
            max_messages: 20,
            max_token_estimate: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagSettings {
    pub top_k: usize,
    pub min_score: f32,
    pub sources: BTreeSet<Source>,
    pub inject_as: InjectAs,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.30,
            sources: BTreeSet::from([Source::Memory, Source::Chat, Source::Telegram]),
            inject_as: InjectAs::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectAs {
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    pub model: String,
    pub fallback: Route,
    pub enforce_model: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            model: "qwen2.5:7b".to_owned(),
            fallback: Route::ClaudeSonnet,
            enforce_model: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub skip_logic: bool,
    pub embedding_cache: bool,
    pub timing_stats: bool,
    pub route_aware_sources: bool,
    pub history_compression: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            skip_logic: true,
            embedding_cache: true,
            timing_stats: true,
            route_aware_sources: true,
            history_compression: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_round_trip_through_toml() {
        let settings = Settings::default();
        let serialized = toml::to_string(&settings).expect("serialize");
        let restored: Settings = toml::from_str(&serialized).expect("deserialize");
        assert_eq!(restored.rag.top_k, settings.rag.top_k);
        assert_eq!(restored.routing.fallback, settings.routing.fallback);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let restored: Settings = toml::from_str("enabled = false\n").expect("deserialize");
        assert!(!restored.enabled);
        assert_eq!(restored.rag.top_k, RagSettings::default().top_k);
    }
}
