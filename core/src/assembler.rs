//! C6 — Assembler: skip-gate, parallel fan-out, route-aware shaping, prompt assembly, timing.
//!
//! This is the only component that touches every other one. It owns no long-lived state of its
//! own beyond the current `Settings` snapshot and the rolling stats counters; C1-C5 are injected
//! handles, constructed once by the caller (the gateway binary) and shared behind `Arc`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use crate::cache::{EmbeddingCache, Embedder};
use crate::chunk::Source;
use crate::config::Settings;
use crate::error::Result;
use crate::router::{Priority, Route, RouteDecision, Router};
use crate::runtime_client::RuntimeClient;
use crate::session::{Role, SessionStore, Turn};
use crate::vector_index::{RetrievedChunk, VectorIndex};

/// Caller-supplied per-call overrides. None of these are named in §6's closed configuration
/// set — that set describes the *settings file*, not a single call's ad-hoc adjustments — but
/// the data-flow line in §2 ("Assembler receives `(message, sessionId, overrides)`") requires
/// something fill this slot. Shaped after the fields the Assembler would otherwise read from
/// `rag`/`shortTerm`.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub rag_top_k: Option<usize>,
    pub rag_min_score: Option<f32>,
    pub rag_sources: Option<BTreeSet<Source>>,
    pub max_messages: Option<usize>,
    pub max_token_estimate: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimes {
    pub embedding_ms: f64,
    pub similarity_search_ms: f64,
    pub classification_ms: f64,
    pub assembly_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentMetadata {
    pub assembly_time_ms: f64,
    pub stage_times: StageTimes,
    pub skipped: bool,
    pub config_snapshot: Settings,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptTurn {
    pub role: Role,
    pub content: String,
}

/// The final sequence handed to the chosen downstream model: retrieval blocks, then bounded
/// history, then the user's turn (§4.6, "Prompt assembly").
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssembledPrompt {
    pub turns: Vec<PromptTurn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentResult {
    pub session_id: String,
    pub short_term_history: Vec<Turn>,
    pub rag_context: Vec<RetrievedChunk>,
    pub route_decision: RouteDecision,
    pub assembled_prompt: AssembledPrompt,
    pub metadata: EnrichmentMetadata,
}

/// A route's row in the shaping table (§4.6). `sources: None` means "no filter beyond what R
/// already applied"; here every row names an explicit set, so it is always `Some`.
struct ShapingRow {
    top_k: usize,
    sources: BTreeSet<Source>,
    min_score: f32,
}

fn shaping_row_for(route: Route) -> ShapingRow {
    match route {
        Route::LocalQwen => ShapingRow {
            top_k: 3,
            sources: BTreeSet::from([Source::Memory]),
            min_score: 0.40,
        },
        Route::ClaudeHaiku => ShapingRow {
            top_k: 0,
            sources: BTreeSet::new(),
            min_score: 1.0,
        },
        Route::ClaudeSonnet => ShapingRow {
            top_k: 5,
            sources: BTreeSet::from([Source::Memory, Source::Chat]),
            min_score: 0.30,
        },
        Route::ClaudeOpus => ShapingRow {
            top_k: 10,
            sources: BTreeSet::from([Source::Memory, Source::Chat, Source::Telegram]),
            min_score: 0.25,
        },
    }
}

fn fallback_shaping_row() -> ShapingRow {
    ShapingRow {
        top_k: 5,
        sources: BTreeSet::from([Source::Memory, Source::Chat, Source::Telegram]),
        min_score: 0.30,
    }
}

/// Filters (no re-query) and truncates R's speculative results to the route's row. A decision
/// marked `is_default` uses the broader `fallback` row instead of its nominal route's row, since
/// `route` there is itself only the configured fallback value, not a genuine classification.
fn shape(results: &[RetrievedChunk], decision: &RouteDecision) -> Vec<RetrievedChunk> {
    let row = if decision.is_default {
        fallback_shaping_row()
    } else {
        shaping_row_for(decision.route)
    };

    results
        .iter()
        .filter(|r| row.sources.contains(&r.source) && r.score >= row.min_score)
        .take(row.top_k)
        .cloned()
        .collect()
}

/// Binds a [`RuntimeClient`] to a fixed model name so it can serve as the cache's [`Embedder`].
struct ModelEmbedder<'a> {
    runtime: &'a RuntimeClient,
    model: &'a str,
}

#[async_trait]
impl Embedder for ModelEmbedder<'_> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.runtime.embed(self.model, text).await
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssemblerStats {
    pub calls: u64,
    pub skipped: u64,
    pub avg_embedding_ms: f64,
    pub avg_similarity_search_ms: f64,
    pub avg_classification_ms: f64,
    pub avg_assembly_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub session_count: usize,
    pub total_turns: usize,
}

#[derive(Default)]
struct StatsInner {
    calls: u64,
    skipped: u64,
    avg_embedding_ms: f64,
    avg_similarity_search_ms: f64,
    avg_classification_ms: f64,
    avg_assembly_ms: f64,
}

fn update_rolling_avg(avg: &mut f64, sample_ms: f64, completed_calls: f64) {
    *avg += (sample_ms - *avg) / completed_calls;
}

impl StatsInner {
    fn record_skip(&mut self) {
        self.calls += 1;
        self.skipped += 1;
    }

    fn record_full(&mut self, stage: &StageTimes) {
        self.calls += 1;
        let n = (self.calls - self.skipped) as f64;
        update_rolling_avg(&mut self.avg_embedding_ms, stage.embedding_ms, n);
        update_rolling_avg(
            &mut self.avg_similarity_search_ms,
            stage.similarity_search_ms,
            n,
        );
        update_rolling_avg(
            &mut self.avg_classification_ms,
            stage.classification_ms,
            n,
        );
        update_rolling_avg(&mut self.avg_assembly_ms, stage.assembly_ms, n);
    }
}

/// Optional append-only activity log (§1, "Non-goals" permits "an optional append-only activity
/// log"). Off unless constructed; writes never block `assemble` — each record is handed to a
/// detached task.
pub struct ActivityLog {
    path: PathBuf,
}

#[derive(Serialize)]
struct ActivityLogEntry<'a> {
    session_id: &'a str,
    skipped: bool,
    route: Option<Route>,
    priority: Option<Priority>,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn record(&self, session_id: &str, skipped: bool, decision: Option<&RouteDecision>) {
        let entry = ActivityLogEntry {
            session_id,
            skipped,
            route: decision.map(|d| d.route),
            priority: decision.map(|d| d.priority),
        };
        let line = match serde_json::to_string(&entry) {
            Ok(mut s) => {
                s.push('\n');
                s
            }
            Err(e) => {
                warn!(error = %e, "activity log entry failed to serialize");
                return;
            }
        };
        let path = self.path.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        warn!(error = %e, "activity log append failed");
                    }
                }
                Err(e) => warn!(error = %e, "activity log file could not be opened"),
            }
        });
    }
}

/// Wires C1-C5 together behind the single `assemble`/`stats` surface (§6, "To callers").
pub struct Assembler {
    cache: EmbeddingCache,
    vector_index: VectorIndex,
    session_store: SessionStore,
    router: Router,
    runtime: RuntimeClient,
    settings: RwLock<Settings>,
    stats: Mutex<StatsInner>,
    activity_log: Option<ActivityLog>,
}

impl Assembler {
    pub fn new(
        cache: EmbeddingCache,
        vector_index: VectorIndex,
        session_store: SessionStore,
        router: Router,
        runtime: RuntimeClient,
        settings: Settings,
        activity_log: Option<ActivityLog>,
    ) -> Self {
        Self {
            cache,
            vector_index,
            session_store,
            router,
            runtime,
            settings: RwLock::new(settings),
            stats: Mutex::new(StatsInner::default()),
            activity_log,
        }
    }

    pub fn settings_snapshot(&self) -> Settings {
        self.settings.read().expect("settings lock poisoned").clone()
    }

    pub fn replace_settings(&self, settings: Settings) {
        *self.settings.write().expect("settings lock poisoned") = settings;
    }

    /// `assemble(message, sessionId, overrides) -> EnrichmentResult` (§6).
    pub async fn assemble(
        &self,
        message: &str,
        session_id: &str,
        overrides: Overrides,
    ) -> EnrichmentResult {
        let settings = self.settings_snapshot();

        if settings.features.skip_logic && crate::skip_gate::should_skip(message) {
            let result = self.skipped_result(message, session_id, &settings);
            self.session_store
                .append(session_id, Turn::new(Role::User, message))
                .await;
            return result;
        }

        let result = if settings.parallel_execution {
            self.assemble_parallel(message, session_id, &overrides, &settings)
                .await
        } else {
            self.assemble_sequential(message, session_id, &overrides, &settings)
                .await
        };

        self.session_store
            .append(session_id, Turn::new(Role::User, message))
            .await;

        if let Some(log) = &self.activity_log {
            log.record(session_id, false, Some(&result.route_decision));
        }

        result
    }

    fn skipped_result(
        &self,
        message: &str,
        session_id: &str,
        settings: &Settings,
    ) -> EnrichmentResult {
        let decision = RouteDecision {
            route: settings.routing.fallback,
            reason: "skipped (simple message)".to_owned(),
            priority: Priority::Low,
            is_default: true,
        };

        let start = Instant::now();
        let prompt = AssembledPrompt {
            turns: vec![PromptTurn {
                role: Role::User,
                content: message.to_owned(),
            }],
        };
        let assembly_ms = start.elapsed().as_secs_f64() * 1000.0;

        if let Some(log) = &self.activity_log {
            log.record(session_id, true, None);
        }

        if let Ok(mut stats) = self.stats.try_lock() {
            stats.record_skip();
        }

        EnrichmentResult {
            session_id: session_id.to_owned(),
            short_term_history: Vec::new(),
            rag_context: Vec::new(),
            route_decision: decision,
            assembled_prompt: prompt,
            metadata: EnrichmentMetadata {
                assembly_time_ms: assembly_ms,
                stage_times: StageTimes::default(),
                skipped: true,
                config_snapshot: settings.clone(),
            },
        }
    }

    /// R: embed the message and search the vector index. §4.6 also has R read the recent window,
    /// but nothing downstream of this branch consumes it — the window that matters for prompt
    /// assembly is re-read once, after shaping, in [`Assembler::finish`] — so it is not
    /// re-fetched here.
    async fn retrieve_branch(
        &self,
        message: &str,
        _session_id: &str,
        overrides: &Overrides,
        settings: &Settings,
    ) -> (Vec<RetrievedChunk>, f64, f64) {
        let embedder = ModelEmbedder {
            runtime: &self.runtime,
            model: &settings.embed_model,
        };

        let embed_start = Instant::now();
        let embed_deadline = Duration::from_millis(settings.timeouts.embed_ms);
        let vector = if settings.features.embedding_cache {
            timeout(embed_deadline, self.cache.get_or_compute(&embedder, message)).await
        } else {
            timeout(embed_deadline, embedder.embed(message)).await
        };
        let embedding_ms = embed_start.elapsed().as_secs_f64() * 1000.0;

        let vector = match vector {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(error = %e, "retrieval branch: embedding failed, returning empty retrieval");
                return (Vec::new(), embedding_ms, 0.0);
            }
            Err(_) => {
                warn!("retrieval branch: embedding timed out, returning empty retrieval");
                return (Vec::new(), embedding_ms, 0.0);
            }
        };

        if !settings.vector_index.enabled {
            return (Vec::new(), embedding_ms, 0.0);
        }

        let top_k = overrides.rag_top_k.unwrap_or(settings.rag.top_k);
        let min_score = overrides.rag_min_score.unwrap_or(settings.rag.min_score);
        let sources = overrides
            .rag_sources
            .clone()
            .unwrap_or_else(|| settings.rag.sources.clone());

        let search_start = Instant::now();
        let results = self
            .vector_index
            .search(&vector, top_k, min_score, Some(&sources))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "retrieval branch: search failed, returning empty retrieval");
                Vec::new()
            });
        let search_ms = search_start.elapsed().as_secs_f64() * 1000.0;

        (results, embedding_ms, search_ms)
    }

    async fn classify_branch(
        &self,
        message: &str,
        session_id: &str,
        settings: &Settings,
    ) -> (RouteDecision, f64) {
        let window = self
            .session_store
            .recent(session_id, 2)
            .await;

        let classify_start = Instant::now();
        let deadline = Duration::from_millis(settings.timeouts.classify_ms);
        let decision = match timeout(deadline, self.router.classify(message, &window)).await {
            Ok(decision) => decision,
            Err(_) => RouteDecision::default_decision(
                settings.routing.fallback,
                "classification failed: timed out",
            ),
        };
        let classify_ms = classify_start.elapsed().as_secs_f64() * 1000.0;

        (decision, classify_ms)
    }

    async fn assemble_parallel(
        &self,
        message: &str,
        session_id: &str,
        overrides: &Overrides,
        settings: &Settings,
    ) -> EnrichmentResult {
        let overall_deadline = Duration::from_millis(settings.timeouts.overall_ms);

        let ((retrieval, embedding_ms, search_ms), (decision, classify_ms)) = match timeout(
            overall_deadline,
            async {
                tokio::join!(
                    self.retrieve_branch(message, session_id, overrides, settings),
                    self.classify_branch(message, session_id, settings),
                )
            },
        )
        .await
        {
            Ok(pair) => pair,
            Err(_) => {
                warn!("assemble: overall budget exceeded, falling back to defaults for both branches");
                (
                    (Vec::new(), 0.0, 0.0),
                    (
                        RouteDecision::default_decision(
                            settings.routing.fallback,
                            "classification failed: overall budget exceeded",
                        ),
                        0.0,
                    ),
                )
            }
        };

        self.finish(
            message,
            session_id,
            overrides,
            settings,
            retrieval,
            decision,
            embedding_ms,
            search_ms,
            classify_ms,
        )
        .await
    }

    async fn assemble_sequential(
        &self,
        message: &str,
        session_id: &str,
        overrides: &Overrides,
        settings: &Settings,
    ) -> EnrichmentResult {
        let (retrieval, embedding_ms, search_ms) = self
            .retrieve_branch(message, session_id, overrides, settings)
            .await;
        let (decision, classify_ms) = self.classify_branch(message, session_id, settings).await;

        self.finish(
            message,
            session_id,
            overrides,
            settings,
            retrieval,
            decision,
            embedding_ms,
            search_ms,
            classify_ms,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        message: &str,
        session_id: &str,
        overrides: &Overrides,
        settings: &Settings,
        retrieval: Vec<RetrievedChunk>,
        decision: RouteDecision,
        embedding_ms: f64,
        search_ms: f64,
        classify_ms: f64,
    ) -> EnrichmentResult {
        let assembly_start = Instant::now();

        let shaped = if settings.features.route_aware_sources {
            shape(&retrieval, &decision)
        } else {
            retrieval
        };

        let history = self
            .session_store
            .window(
                session_id,
                overrides.max_messages.unwrap_or(settings.short_term.max_messages),
                overrides
                    .max_token_estimate
                    .unwrap_or(settings.short_term.max_token_estimate),
                Some(&self.runtime),
                &settings.routing.model,
            )
            .await;

        let prompt = build_prompt(&shaped, &history, message);
        let assembly_ms = assembly_start.elapsed().as_secs_f64() * 1000.0;

        let stage_times = StageTimes {
            embedding_ms,
            similarity_search_ms: search_ms,
            classification_ms: classify_ms,
            assembly_ms,
        };

        if settings.features.timing_stats {
            self.stats.lock().await.record_full(&stage_times);
        }

        EnrichmentResult {
            session_id: session_id.to_owned(),
            short_term_history: history,
            rag_context: shaped,
            route_decision: decision,
            assembled_prompt: prompt,
            metadata: EnrichmentMetadata {
                assembly_time_ms: assembly_ms,
                stage_times,
                skipped: false,
                config_snapshot: settings.clone(),
            },
        }
    }

    pub async fn stats(&self) -> AssemblerStats {
        let stats = self.stats.lock().await;
        let (cache_hits, cache_misses) = self.cache.hit_miss().await;
        let session_stats = self.session_store.stats().await;

        AssemblerStats {
            calls: stats.calls,
            skipped: stats.skipped,
            avg_embedding_ms: stats.avg_embedding_ms,
            avg_similarity_search_ms: stats.avg_similarity_search_ms,
            avg_classification_ms: stats.avg_classification_ms,
            avg_assembly_ms: stats.avg_assembly_ms,
            cache_hits,
            cache_misses,
            session_count: session_stats.session_count,
            total_turns: session_stats.total_turns,
        }
    }
}

/// Builds the system retrieval blocks (ordered `memory, chat, telegram`), then history, then the
/// user's turn (§4.6, "Prompt assembly").
fn build_prompt(retrieval: &[RetrievedChunk], history: &[Turn], message: &str) -> AssembledPrompt {
    let mut turns = Vec::new();

    if !retrieval.is_empty() {
        let mut block = String::new();
        for source in Source::ORDER {
            let mut hits: Vec<&RetrievedChunk> =
                retrieval.iter().filter(|r| r.source == source).collect();
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            if hits.is_empty() {
                continue;
            }
            block.push_str(&format!("# {source}\n"));
            for hit in hits {
                block.push_str(&format!(
                    "- [{}] (score {:.3}) {}\n",
                    hit.meta.render(),
                    hit.score,
                    hit.text
                ));
            }
        }
        if !block.is_empty() {
            turns.push(PromptTurn {
                role: Role::System,
                content: block,
            });
        }
    }

    for turn in history {
        turns.push(PromptTurn {
            role: turn.role,
            content: turn.content.clone(),
        });
    }

    turns.push(PromptTurn {
        role: Role::User,
        content: message.to_owned(),
    });

    AssembledPrompt { turns }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkMeta;

    fn hit(source: Source, text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            source,
            text: text.to_owned(),
            meta: ChunkMeta::Memory {
                file: "f.rs".to_owned(),
                start_line: 1,
                end_line: 1,
            },
            score,
        }
    }

    #[test]
    fn shape_filters_by_route_sources_and_min_score_then_truncates() {
        let results = vec![
            hit(Source::Memory, "a", 0.62),
            hit(Source::Chat, "b", 0.55),
            hit(Source::Memory, "c", 0.41),
        ];
        let decision = RouteDecision {
            route: Route::LocalQwen,
            reason: "x".to_owned(),
            priority: Priority::Medium,
            is_default: false,
        };
        let shaped = shape(&results, &decision);
        assert_eq!(shaped.len(), 2);
        assert!(shaped.iter().all(|r| r.source == Source::Memory));
    }

    #[test]
    fn shape_uses_fallback_row_when_decision_is_default() {
        let results = vec![
            hit(Source::Memory, "a", 0.62),
            hit(Source::Telegram, "b", 0.30),
        ];
        let decision = RouteDecision::default_decision(Route::ClaudeSonnet, "boom");
        let shaped = shape(&results, &decision);
        // Fallback row allows all three sources at min_score 0.30, unlike ClaudeSonnet's own
        // {memory, chat} row, which would have excluded the telegram hit.
        assert_eq!(shaped.len(), 2);
    }

    #[test]
    fn shape_claude_haiku_row_yields_no_context() {
        let results = vec![hit(Source::Memory, "a", 0.99)];
        let decision = RouteDecision {
            route: Route::ClaudeHaiku,
            reason: "x".to_owned(),
            priority: Priority::Medium,
            is_default: false,
        };
        assert!(shape(&results, &decision).is_empty());
    }

    #[test]
    fn build_prompt_orders_blocks_by_source_then_history_then_user_turn() {
        let retrieval = vec![
            hit(Source::Chat, "chat-hit", 0.5),
            hit(Source::Memory, "mem-hit", 0.9),
        ];
        let history = vec![Turn::new(Role::Assistant, "previous reply")];
        let prompt = build_prompt(&retrieval, &history, "current message");

        assert_eq!(prompt.turns.len(), 3);
        assert_eq!(prompt.turns[0].role, Role::System);
        let mem_pos = prompt.turns[0].content.find("mem-hit").unwrap();
        let chat_pos = prompt.turns[0].content.find("chat-hit").unwrap();
        assert!(mem_pos < chat_pos);
        assert_eq!(prompt.turns[1].content, "previous reply");
        assert_eq!(prompt.turns[2].content, "current message");
    }

    #[test]
    fn build_prompt_with_no_retrieval_omits_system_block() {
        let prompt = build_prompt(&[], &[], "hello");
        assert_eq!(prompt.turns.len(), 1);
        assert_eq!(prompt.turns[0].role, Role::User);
    }
}
