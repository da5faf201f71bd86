use thiserror::Error;

/// Error surface of the enrichment core.
///
/// Per the propagation policy, almost none of these ever reach a caller of
/// [`crate::assembler::Assembler::assemble`] directly — `R` and `C` branches reduce them to
/// empty results / default decisions. They do surface from `stats()`-adjacent and settings
/// entry points where a hard failure is the correct behavior.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("LLM runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("LLM runtime call timed out after {0:?}")]
    RuntimeTimeout(std::time::Duration),

    #[error("invalid response from LLM runtime: {0}")]
    InvalidResponse(String),

    #[error("corpus unavailable: {0}")]
    CorpusUnavailable(String),

    #[error("cache invariant violated (this is a bug): {0}")]
    CacheInvariantViolated(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

pub type Result<T> = std::result::Result<T, EnrichError>;
