//! Read-only access to the three corpora (§6, "Corpus sources").
//!
//! The core never writes to a corpus; ingestion (out of scope, §1) owns that. A [`CorpusReader`]
//! is a long-lived handle, prepared once and reused across index reloads (§5, "Shared
//! resources"): opening it is the expensive part, reading rows from an already-open handle is
//! cheap.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::chunk::{Chunk, ChunkMeta, Source};
use crate::error::{EnrichError, Result};

#[async_trait]
pub trait CorpusReader: Send + Sync {
    fn source(&self) -> Source;
    async fn load_all(&self) -> Result<Vec<Chunk>>;
}

/// Decodes the little-endian float32 blob encoding used for the `embedding` column (§6).
fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// A `rusqlite`-backed reader against one of the three tabular corpora, following
/// `mementor-lib`'s use of `rusqlite` for its own embedding store. Connections are not `Sync`, so
/// access is serialized behind a `tokio::sync::Mutex` — reloads are infrequent (bounded by
/// `staleAfterMs`) and this is not a hot-path lock.
pub struct SqliteCorpusReader {
    source: Source,
    table: String,
    conn: Mutex<Connection>,
}

impl SqliteCorpusReader {
    /// Opens (or creates) the backing SQLite file and prepares it for reads of the given table.
    pub fn open(source: Source, db_path: &str, table: impl Into<String>) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| EnrichError::CorpusUnavailable(e.to_string()))?;
        Ok(Self {
            source,
            table: table.into(),
            conn: Mutex::new(conn),
        })
    }

    fn row_to_chunk(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
        let text: String = row.get("text")?;
        let blob: Vec<u8> = row.get("embedding")?;
        let vector = decode_embedding(&blob);

        let meta = match self.source {
            Source::Memory => ChunkMeta::Memory {
                file: row.get("file")?,
                start_line: row.get("start_line")?,
                end_line: row.get("end_line")?,
            },
            Source::Chat => ChunkMeta::Chat {
                session_id: row.get("session_id")?,
                start_ts: timestamp_from_row(row, "start_ts")?,
                end_ts: timestamp_from_row(row, "end_ts")?,
            },
            Source::Telegram => ChunkMeta::Telegram {
                start_ts: timestamp_from_row(row, "start_ts")?,
                end_ts: timestamp_from_row(row, "end_ts")?,
            },
        };

        Ok(Chunk {
            source: self.source,
            text,
            vector,
            meta,
        })
    }
}

fn timestamp_from_row(row: &rusqlite::Row<'_>, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(col)?;
    Ok(Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now))
}

#[async_trait]
impl CorpusReader for SqliteCorpusReader {
    fn source(&self) -> Source {
        self.source
    }

    async fn load_all(&self) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock().await;
        let query = format!("SELECT * FROM {}", self.table);
        let mut stmt = conn
            .prepare(&query)
            .map_err(|e| EnrichError::CorpusUnavailable(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| self.row_to_chunk(row))
            .map_err(|e| EnrichError::CorpusUnavailable(e.to_string()))?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.map_err(|e| EnrichError::CorpusUnavailable(e.to_string()))?);
        }
        Ok(chunks)
    }
}

/// Fixed in-memory reader, used by tests and by the gateway binary's example configuration
/// when no SQLite corpus is configured for a source.
pub struct InMemoryCorpusReader {
    source: Source,
    chunks: Vec<Chunk>,
}

impl InMemoryCorpusReader {
    pub fn new(source: Source, chunks: Vec<Chunk>) -> Self {
        Self { source, chunks }
    }
}

#[async_trait]
impl CorpusReader for InMemoryCorpusReader {
    fn source(&self) -> Source {
        self.source
    }

    async fn load_all(&self) -> Result<Vec<Chunk>> {
        Ok(self.chunks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_embedding_round_trips_le_f32() {
        let values: Vec<f32> = vec![1.0, -2.5, 0.0, 3.25];
        let mut blob = Vec::new();
        for v in &values {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(decode_embedding(&blob), values);
    }

    #[tokio::test]
    async fn in_memory_reader_returns_configured_chunks() {
        let chunk = Chunk {
            source: Source::Memory,
            text: "hello".to_owned(),
            vector: vec![1.0, 0.0],
            meta: ChunkMeta::Memory {
                file: "a.rs".to_owned(),
                start_line: 1,
                end_line: 2,
            },
        };
        let reader = InMemoryCorpusReader::new(Source::Memory, vec![chunk.clone()]);
        assert_eq!(reader.load_all().await.unwrap(), vec![chunk]);
        assert_eq!(reader.source(), Source::Memory);
    }
}
