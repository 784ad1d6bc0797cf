use thiserror::Error;

/// Errors surfaced by the public API of [`crate::context::DynamicInferenceContext`].
///
/// These mirror the admission overflow taxonomy plus the one fatal
/// configuration-bug condition (`ActiveRequestCountOverflow`). Internal
/// invariant violations are not represented here — they are bugs in the
/// scheduler, not caller-triggerable conditions, and are raised via
/// `assert!`/`debug_assert!` instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("token overflow: admitting {requested} tokens would exceed max_tokens ({max})")]
    TokenOverflow { requested: usize, max: usize },

    #[error("request overflow: max_requests ({max}) already reached")]
    RequestOverflow { max: usize },

    #[error("max sequence length overflow: {requested} > max_sequence_length ({max})")]
    MaxSequenceLengthOverflow { requested: usize, max: usize },

    #[error("chunk overflow: could not allocate {needed} chunks")]
    ChunkOverflow { needed: usize },

    #[error("active request count overflow: {active} > max_requests ({max})")]
    ActiveRequestCountOverflow { active: usize, max: usize },
}
