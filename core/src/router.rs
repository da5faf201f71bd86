//! C4 — Router: classifies a message into a route and priority by asking the external runtime
//! for a JSON reply and parsing it defensively.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::runtime_client::RuntimeClient;
use crate::session::Turn;

/// The closed set of downstream model targets (§3, "Route Decision").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    ClaudeHaiku,
    ClaudeSonnet,
    ClaudeOpus,
    LocalQwen,
}

impl Route {
    fn parse(raw: &str) -> Option<Route> {
        match raw {
            "claude_haiku" => Some(Route::ClaudeHaiku),
            "claude_sonnet" => Some(Route::ClaudeSonnet),
            "claude_opus" => Some(Route::ClaudeOpus),
            "local_qwen" => Some(Route::LocalQwen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    fn parse(raw: &str) -> Option<Priority> {
        match raw {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// `{ route, reason, priority }` (§3). `is_default` is not part of the wire shape — it is the
/// Assembler's own marker (not named in spec.md) distinguishing a genuine classification from a
/// substituted default, which route-aware shaping (§4.6) treats differently; see DESIGN.md.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: Route,
    pub reason: String,
    pub priority: Priority,
    #[serde(skip)]
    pub is_default: bool,
}

impl RouteDecision {
    pub fn default_decision(fallback: Route, reason: impl Into<String>) -> Self {
        Self {
            route: fallback,
            reason: reason.into(),
            priority: Priority::Medium,
            is_default: true,
        }
    }
}

const ROUTING_RUBRIC: &str = r#"You are a routing classifier for a local-first assistant.
Given the conversation so far and the user's latest message, choose exactly one route and a
priority. Routes: "local_qwen" (simple, fast, local tasks), "claude_haiku" (quick remote tasks),
"claude_sonnet" (general-purpose default), "claude_opus" (complex, high-stakes tasks).
Priorities: "high", "medium", "low". Reply with a single JSON object of the shape
{"route": "...", "priority": "...", "reason": "..."} and nothing else."#;

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn escape_quotes(s: &str) -> String {
    s.replace('"', "\\\"")
}

/// Builds the single structured prompt sent to the runtime (§4.4).
fn build_prompt(message: &str, recent_history: &[Turn]) -> String {
    let mut prompt = String::from(ROUTING_RUBRIC);
    prompt.push_str("\n\nRecent turns:\n");
    for turn in recent_history.iter().rev().take(2).collect::<Vec<_>>().into_iter().rev() {
        prompt.push_str(&format!(
            "{:?}: {}\n",
            turn.role,
            truncate_chars(&turn.content, 200)
        ));
    }
    prompt.push_str(&format!("\nUser message: \"{}\"\n", escape_quotes(message)));
    prompt
}

/// Extracts the first balanced `{...}` object from `text`, tolerating surrounding prose.
fn first_balanced_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    route: Option<String>,
    priority: Option<String>,
    reason: Option<String>,
}

/// Router handle. `model` and `fallback` come from `routing.model` / `routing.fallback` (§6).
pub struct Router {
    runtime: RuntimeClient,
    model: String,
    fallback: Route,
}

impl Router {
    pub fn new(runtime: RuntimeClient, model: impl Into<String>, fallback: Route) -> Self {
        Self {
            runtime,
            model: model.into(),
            fallback,
        }
    }

    /// `classify(message, recentHistory) -> RouteDecision` (§4.4). Never propagates an error to
    /// the Assembler — any failure collapses to [`RouteDecision::default_decision`].
    pub async fn classify(&self, message: &str, recent_history: &[Turn]) -> RouteDecision {
        let prompt = build_prompt(message, recent_history);

        let raw_response = match self.runtime.generate(&self.model, &prompt, true).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "router: runtime call failed, using default route");
                return RouteDecision::default_decision(
                    self.fallback,
                    format!("classification failed: {e}"),
                );
            }
        };

        let response_text = raw_response
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let Some(json_slice) = first_balanced_json_object(response_text) else {
            warn!("router: no balanced JSON object in runtime response");
            return RouteDecision::default_decision(
                self.fallback,
                "classification failed: no JSON object in response",
            );
        };

        let parsed: RawDecision = match serde_json::from_str(json_slice) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "router: malformed JSON from runtime");
                return RouteDecision::default_decision(
                    self.fallback,
                    format!("classification failed: malformed JSON ({e})"),
                );
            }
        };

        let parsed_route = parsed.route.as_deref().and_then(Route::parse);
        let parsed_priority = parsed.priority.as_deref().and_then(Priority::parse);
        let route = parsed_route.unwrap_or(self.fallback);
        let priority = parsed_priority.unwrap_or(Priority::Medium);
        // Route-aware shaping (§4.6) keys only on `route`; a malformed `priority` alone must not
        // make `shape()` fall back to the broader row for an otherwise genuine classification.
        let is_default = parsed_route.is_none();

        RouteDecision {
            route,
            priority,
            reason: parsed.reason.unwrap_or_else(|| "classified".to_owned()),
            is_default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_balanced_json_object_ignores_braces_inside_strings() {
        let text = r#"sure, here: {"route": "local_qwen", "reason": "a { b }"} trailing"#;
        let extracted = first_balanced_json_object(text).unwrap();
        assert_eq!(
            extracted,
            r#"{"route": "local_qwen", "reason": "a { b }"}"#
        );
    }

    #[test]
    fn first_balanced_json_object_returns_none_when_absent() {
        assert!(first_balanced_json_object("no json here").is_none());
    }

    #[test]
    fn route_parse_rejects_unknown_values() {
        assert_eq!(Route::parse("claude_opus"), Some(Route::ClaudeOpus));
        assert_eq!(Route::parse("gpt5"), None);
    }

    #[test]
    fn priority_parse_rejects_unknown_values() {
        assert_eq!(Priority::parse("high"), Some(Priority::High));
        assert_eq!(Priority::parse("urgent"), None);
    }

    #[test]
    fn build_prompt_truncates_history_to_last_two_and_200_chars() {
        let turns = vec![
            Turn::new(crate::session::Role::User, "a".repeat(300)),
            Turn::new(crate::session::Role::Assistant, "keep-me-2"),
            Turn::new(crate::session::Role::User, "keep-me-1"),
        ];
        let prompt = build_prompt("hello", &turns);
        assert!(!prompt.contains(&"a".repeat(201)));
        assert!(prompt.contains("keep-me-1"));
        assert!(prompt.contains("keep-me-2"));
    }

    #[test]
    fn build_prompt_escapes_embedded_quotes() {
        let prompt = build_prompt(r#"say "hi""#, &[]);
        assert!(prompt.contains(r#"say \"hi\""#));
    }

    #[test]
    fn default_decision_is_marked_as_default() {
        let decision = RouteDecision::default_decision(Route::ClaudeSonnet, "boom");
        assert!(decision.is_default);
        assert_eq!(decision.route, Route::ClaudeSonnet);
        assert_eq!(decision.priority, Priority::Medium);
    }
}
