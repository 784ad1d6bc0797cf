//! Construction-time sizing: deriving chunk/byte sizes, max_requests,
//! max_tokens, the guaranteed reserve, and the graph-capture bucket list
//! from the caller-supplied configuration. Everything here is computed once
//! at construction and is immutable thereafter.

/// Element dtype used for the KV cache. Only the byte width matters to this
/// crate, since tensor storage itself is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamsDtype {
    F16,
    Bf16,
    F32,
}

impl ParamsDtype {
    pub fn dtype_bytes(self) -> usize {
        match self {
            ParamsDtype::F16 | ParamsDtype::Bf16 => 2,
            ParamsDtype::F32 => 4,
        }
    }
}

/// Construction-time configuration for [`crate::context::DynamicInferenceContext`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DynamicContextConfig {
    pub params_dtype: ParamsDtype,
    pub num_layers: usize,
    pub kv_channels: usize,
    pub num_attention_heads: usize,
    pub max_sequence_length: u32,
    pub buffer_size_gb: f64,
    pub buffer_guaranteed_fraction: f64,
    pub chunk_size_tokens: u32,
    pub buffer_overflow_factor: Option<f64>,
    pub max_requests_override: Option<u32>,
    pub max_tokens_override: Option<u32>,
    pub tensor_model_parallel_size: Option<u32>,
    pub num_cuda_graphs: Option<u32>,
    pub materialize_only_last_token_logits: bool,
}

impl Default for DynamicContextConfig {
    fn default() -> Self {
        Self {
            params_dtype: ParamsDtype::Bf16,
            num_layers: 1,
            kv_channels: 128,
            num_attention_heads: 1,
            max_sequence_length: 4096,
            buffer_size_gb: 1.0,
            buffer_guaranteed_fraction: 0.1,
            chunk_size_tokens: 256,
            buffer_overflow_factor: None,
            max_requests_override: None,
            max_tokens_override: None,
            tensor_model_parallel_size: None,
            num_cuda_graphs: None,
            materialize_only_last_token_logits: true,
        }
    }
}

/// Empirical heuristic divisor applied to the token-count estimate under
/// `buffer_overflow_factor`, reflecting that few requests are simultaneously
/// in prefill at once. Named so tests can pin it (see spec design notes).
pub const TOKEN_OVERFLOW_HEURISTIC_DIVISOR: f64 = 50.0;

const TOKEN_ROUNDER: u32 = 64;
const REQUEST_ROUNDER: u32 = 4;
const CUDA_GRAPH_ROUNDER: u32 = 8;

fn round_up_to_multiple(value: u32, multiple: u32) -> u32 {
    if multiple == 0 {
        return value;
    }
    multiple * value.div_ceil(multiple)
}

pub fn round_up_tokens(value: u32, tp_size: u32) -> u32 {
    let token_rounder = TOKEN_ROUNDER.div_ceil(tp_size) * tp_size;
    round_up_to_multiple(value, token_rounder)
}

pub fn round_up_requests(value: u32, tp_size: u32) -> u32 {
    let request_rounder = (REQUEST_ROUNDER.div_ceil(tp_size)) * tp_size;
    round_up_to_multiple(value, request_rounder)
}

/// All scalars derived at construction time, per spec.md §3.
#[derive(Debug, Clone)]
pub struct Layout {
    pub chunk_size_tokens: u32,
    pub chunk_size_bytes: u64,
    pub total_chunks: u32,
    pub max_sequence_length: u32,
    pub max_kv_chunk_count: u32,
    pub max_requests: u32,
    pub max_tokens: u32,
    pub gtd_request_count: u32,
    pub gtd_chunk_count: u32,
    pub tp_size: u32,
    pub heads_per_partition: usize,
    pub head_dim: usize,
    pub cuda_graph_request_counts: Option<Vec<u32>>,
    pub cuda_graph_step_size: Option<u32>,
}

impl Layout {
    pub fn derive(config: &DynamicContextConfig) -> Self {
        let tp_size = config.tensor_model_parallel_size.unwrap_or(1).max(1);
        assert!(
            config.num_attention_heads as u32 % tp_size == 0,
            "num_attention_heads ({}) must be divisible by tensor_model_parallel_size ({})",
            config.num_attention_heads,
            tp_size
        );
        let heads_per_partition = config.num_attention_heads / tp_size as usize;
        let head_dim = config.kv_channels;

        let chunk_size_tokens = config.chunk_size_tokens;
        let chunk_size_bytes = config.params_dtype.dtype_bytes() as u64
            * 2
            * config.num_layers as u64
            * chunk_size_tokens as u64
            * heads_per_partition as u64
            * head_dim as u64;
        assert!(chunk_size_bytes > 0, "chunk_size_bytes must be positive");

        let buffer_size_bytes_raw = (config.buffer_size_gb * 1024f64.powi(3)) as u64;
        let buffer_size_bytes = buffer_size_bytes_raw - (buffer_size_bytes_raw % chunk_size_bytes);
        let total_chunks = (buffer_size_bytes / chunk_size_bytes) as u32;

        let bytes_to_max_requests_and_tokens = |n_bytes: u64| -> (u32, u32) {
            let n_tokens = n_bytes as f64 / chunk_size_bytes as f64 * chunk_size_tokens as f64;
            let n_requests = n_tokens / config.max_sequence_length as f64;
            (
                round_up_requests(n_requests as u32, tp_size),
                round_up_tokens(n_tokens as u32, tp_size),
            )
        };

        let (mut max_requests, mut max_tokens) =
            bytes_to_max_requests_and_tokens(buffer_size_bytes);

        if let Some(factor) = config.buffer_overflow_factor {
            max_requests = round_up_requests((max_requests as f64 * factor) as u32, tp_size);
            max_tokens = round_up_tokens(
                (max_tokens as f64 * factor / TOKEN_OVERFLOW_HEURISTIC_DIVISOR) as u32,
                tp_size,
            );
        }

        if let Some(over) = config.max_requests_override {
            max_requests = round_up_requests(over, tp_size);
        }
        if let Some(over) = config.max_tokens_override {
            max_tokens = round_up_tokens(over, tp_size);
        }

        // See spec design notes: intentionally not changed, even though it can
        // silently cap capacity below buffer capacity for long prompts.
        max_requests = max_requests.min(max_tokens);

        let max_kv_chunk_count = config.max_sequence_length.div_ceil(chunk_size_tokens);

        let gtd_chunk_count_est =
            (config.buffer_guaranteed_fraction * total_chunks as f64) as u32;
        let gtd_chunk_count_est = gtd_chunk_count_est.min(total_chunks);
        let gtd_request_count = (gtd_chunk_count_est / max_kv_chunk_count).max(1);
        let gtd_chunk_count = gtd_request_count * max_kv_chunk_count;

        let (cuda_graph_request_counts, cuda_graph_step_size) = match config.num_cuda_graphs {
            None => (None, None),
            Some(requested) => {
                let num_cuda_graphs = requested.clamp(1, max_requests);
                let raw_step = (max_requests as f64 / num_cuda_graphs as f64).ceil() as u32;
                let rounded_step = round_up_to_multiple(raw_step, CUDA_GRAPH_ROUNDER);
                // Rounding to a multiple of 8 is an alignment nicety for
                // large batch counts; at small max_requests it would inflate
                // past max_requests and collapse multiple buckets into one.
                // Fall back to the unrounded (but still TP-rounded) step
                // whenever rounding would overshoot.
                let step_size = round_up_to_multiple(
                    if rounded_step < max_requests {
                        rounded_step
                    } else {
                        raw_step
                    },
                    tp_size,
                );

                let buckets = if num_cuda_graphs == 1 {
                    vec![max_requests]
                } else {
                    let mut buckets: Vec<u32> = (1..)
                        .map(|i| i * step_size)
                        .take_while(|&v| v < max_requests)
                        .collect();
                    if buckets.last().copied() != Some(max_requests) {
                        buckets.push(max_requests);
                    }
                    buckets.reverse();
                    buckets
                };
                (Some(buckets), Some(step_size))
            }
        };

        Self {
            chunk_size_tokens,
            chunk_size_bytes,
            total_chunks,
            max_sequence_length: config.max_sequence_length,
            max_kv_chunk_count,
            max_requests,
            max_tokens,
            gtd_request_count,
            gtd_chunk_count,
            tp_size,
            heads_per_partition,
            head_dim,
            cuda_graph_request_counts,
            cuda_graph_step_size,
        }
    }

    /// Smallest configured decode-only bucket that is >= `active_request_count`,
    /// clamped to `max_requests` when no bucket list is configured.
    pub fn smallest_bucket_at_least(&self, active_request_count: u32) -> u32 {
        match (&self.cuda_graph_request_counts, self.cuda_graph_step_size) {
            (Some(_), Some(step)) if active_request_count > 0 => {
                (active_request_count.div_ceil(step) * step).min(self.max_requests)
            }
            _ => self.max_requests,
        }
    }
}
