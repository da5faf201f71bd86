//! C5 — Session Store: per-session ordered history of turns with a token-budgeted window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::runtime_client::RuntimeClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One message in a session (§3, "Session").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub model: Option<String>,
    pub token_estimate: Option<usize>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        let token_estimate = Some(estimate_tokens(&content));
        Self {
            role,
            content,
            timestamp: Utc::now(),
            model: None,
            token_estimate,
        }
    }
}

/// `⌈chars/4⌉` (§9, "Token estimation is deliberately rough"). A monotone function of content
/// length, which is all the contract requires.
pub fn estimate_tokens(content: &str) -> usize {
    content.chars().count().div_ceil(4)
}

#[derive(Default)]
struct SessionLog {
    turns: Vec<Turn>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStoreStats {
    pub session_count: usize,
    pub total_turns: usize,
}

/// Process-local, per-session append lock (§5, "Shared resources"). Cross-session operations
/// hold no locks against each other — only the single session's own `Mutex`.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionLog>>>>,
    history_compression: bool,
}

impl SessionStore {
    pub fn new(history_compression: bool) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_compression,
        }
    }

    async fn session_handle(&self, session_id: &str) -> Arc<Mutex<SessionLog>> {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(
            sessions
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(SessionLog::default()))),
        )
    }

    /// `append(sessionId, turn)`. Sessions are created lazily on first append (I6).
    pub async fn append(&self, session_id: &str, turn: Turn) {
        let handle = self.session_handle(session_id).await;
        let mut log = handle.lock().await;
        log.turns.push(turn);
    }

    /// `recent(sessionId, n) -> turns`: the last `n` messages, oldest first (I7, contiguous
    /// tail).
    pub async fn recent(&self, session_id: &str, n: usize) -> Vec<Turn> {
        let handle = self.session_handle(session_id).await;
        let log = handle.lock().await;
        tail(&log.turns, n)
    }

    /// `window(sessionId, maxMessages, maxTokens) -> turns` (§4.5).
    ///
    /// Drops oldest messages first until both the message-count and token budgets hold for the
    /// remaining tail. Returns a *view*: the underlying append-only sequence is never mutated.
    pub async fn window(
        &self,
        session_id: &str,
        max_messages: usize,
        max_tokens: usize,
        runtime: Option<&RuntimeClient>,
        summary_model: &str,
    ) -> Vec<Turn> {
        if max_messages == 0 || max_tokens == 0 {
            return Vec::new();
        }

        let handle = self.session_handle(session_id).await;
        let all_turns = {
            let log = handle.lock().await;
            log.turns.clone()
        };

        let by_count = tail(&all_turns, max_messages);
        let (kept, dropped) = shrink_to_token_budget(by_count, max_tokens);

        if dropped.is_empty() || !self.history_compression {
            return kept;
        }

        match runtime {
            Some(runtime) => match summarize_prefix(runtime, summary_model, &dropped).await {
                Ok(summary_turn) => {
                    let mut result = vec![summary_turn];
                    result.extend(kept);
                    result
                }
                Err(_) => kept,
            },
            None => kept,
        }
    }

    pub async fn stats(&self) -> SessionStoreStats {
        let sessions = self.sessions.lock().await;
        let mut total_turns = 0;
        for handle in sessions.values() {
            total_turns += handle.lock().await.turns.len();
        }
        SessionStoreStats {
            session_count: sessions.len(),
            total_turns,
        }
    }
}

fn tail(turns: &[Turn], n: usize) -> Vec<Turn> {
    if n >= turns.len() {
        turns.to_vec()
    } else {
        turns[turns.len() - n..].to_vec()
    }
}

/// Drops oldest entries from `turns` (already trimmed to `max_messages`) until the summed token
/// estimate is within `max_tokens`. Returns `(kept, dropped_prefix)`.
fn shrink_to_token_budget(turns: Vec<Turn>, max_tokens: usize) -> (Vec<Turn>, Vec<Turn>) {
    let total: usize = turns
        .iter()
        .map(|t| t.token_estimate.unwrap_or_else(|| estimate_tokens(&t.content)))
        .sum();
    if total <= max_tokens {
        return (turns, Vec::new());
    }

    let mut running = total;
    let mut split_at = 0;
    for turn in &turns {
        if running <= max_tokens {
            break;
        }
        running -= turn.token_estimate.unwrap_or_else(|| estimate_tokens(&turn.content));
        split_at += 1;
    }

    let dropped = turns[..split_at].to_vec();
    let kept = turns[split_at..].to_vec();
    (kept, dropped)
}

async fn summarize_prefix(
    runtime: &RuntimeClient,
    model: &str,
    dropped: &[Turn],
) -> crate::error::Result<Turn> {
    let joined = dropped
        .iter()
        .map(|t| format!("{:?}: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "Summarize the following conversation history in 2-3 sentences, preserving any facts \
         that later turns might reference:\n\n{joined}"
    );
    let response = runtime.generate(model, &prompt, false).await?;
    let summary = response
        .get("response")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned();
    Ok(Turn::new(Role::System, summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_recent_returns_appended_turn_last() {
        let store = SessionStore::new(false);
        store.append("s1", Turn::new(Role::User, "hi")).await;
        store.append("s1", Turn::new(Role::User, "there")).await;

        let recent = store.recent("s1", 10).await;
        assert_eq!(recent.last().unwrap().content, "there");
    }

    #[tokio::test]
    async fn recent_n_returns_contiguous_tail() {
        let store = SessionStore::new(false);
        for i in 0..5 {
            store.append("s1", Turn::new(Role::User, i.to_string())).await;
        }
        let recent = store.recent("s1", 2).await;
        assert_eq!(
            recent.iter().map(|t| t.content.clone()).collect::<Vec<_>>(),
            vec!["3".to_owned(), "4".to_owned()]
        );
    }

    #[tokio::test]
    async fn window_zero_budgets_return_empty() {
        let store = SessionStore::new(false);
        store.append("s1", Turn::new(Role::User, "hi")).await;
        assert!(store.window("s1", 0, 100, None, "m").await.is_empty());
        assert!(store.window("s1", 10, 0, None, "m").await.is_empty());
    }

    #[tokio::test]
    async fn window_drops_oldest_first_under_token_pressure() {
        let store = SessionStore::new(false);
        // Each turn is 4 chars -> 1 token estimate.
        for i in 0..10 {
            store.append("s1", Turn::new(Role::User, format!("t{i:03}"))).await;
        }
        let window = store.window("s1", 10, 3, None, "m").await;
        assert_eq!(window.len(), 3);
        assert_eq!(window.last().unwrap().content, "t009");
    }

    #[tokio::test]
    async fn window_without_compression_falls_back_to_truncation() {
        let store = SessionStore::new(true);
        for i in 0..5 {
            store.append("s1", Turn::new(Role::User, format!("t{i}"))).await;
        }
        // No runtime client supplied -> falls back even though compression is enabled.
        let window = store.window("s1", 5, 1, None, "m").await;
        assert!(window.len() <= 1);
    }

    #[test]
    fn token_estimate_is_ceil_chars_over_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let store = SessionStore::new(false);
        store.append("a", Turn::new(Role::User, "a1")).await;
        store.append("b", Turn::new(Role::User, "b1")).await;

        assert_eq!(store.recent("a", 10).await.len(), 1);
        assert_eq!(store.recent("b", 10).await.len(), 1);

        let stats = store.stats().await;
        assert_eq!(stats.session_count, 2);
        assert_eq!(stats.total_turns, 2);
    }
}
