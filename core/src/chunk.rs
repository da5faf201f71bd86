use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A retrievable corpus. Extensible in principle; the core ships these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Memory,
    Chat,
    Telegram,
}

impl Source {
    /// Fixed rendering order used by prompt assembly (§4.6).
    pub const ORDER: [Source; 3] = [Source::Memory, Source::Chat, Source::Telegram];
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Source::Memory => "memory",
            Source::Chat => "chat",
            Source::Telegram => "telegram",
        };
        f.write_str(s)
    }
}

/// Source-specific location metadata, carried alongside each chunk's text and vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkMeta {
    Memory {
        file: String,
        start_line: u32,
        end_line: u32,
    },
    Chat {
        session_id: String,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    },
    Telegram {
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    },
}

impl ChunkMeta {
    /// Stable one-line rendering used inside retrieval blocks (§4.6, "Prompt assembly").
    pub fn render(&self) -> String {
        match self {
            ChunkMeta::Memory {
                file,
                start_line,
                end_line,
            } => format!("{file}:{start_line}-{end_line}"),
            ChunkMeta::Chat {
                session_id,
                start_ts,
                end_ts,
            } => format!(
                "session {session_id}, {}–{}",
                start_ts.to_rfc3339(),
                end_ts.to_rfc3339()
            ),
            ChunkMeta::Telegram { start_ts, end_ts } => {
                format!("{}–{}", start_ts.to_rfc3339(), end_ts.to_rfc3339())
            }
        }
    }
}

/// A single retrievable passage, read-only to the core (data model §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub source: Source,
    pub text: String,
    /// Pre-normalized unit vector of fixed dimension `D`, as produced by ingestion.
    pub vector: Vec<f32>,
    pub meta: ChunkMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_order_is_stable() {
        assert_eq!(
            Source::ORDER,
            [Source::Memory, Source::Chat, Source::Telegram]
        );
    }

    #[test]
    fn memory_meta_renders_file_and_lines() {
        let meta = ChunkMeta::Memory {
            file: "src/lib.rs".to_owned(),
            start_line: 10,
            end_line: 20,
        };
        assert_eq!(meta.render(), "src/lib.rs:10-20");
    }
}
