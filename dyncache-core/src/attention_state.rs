//! Per-step attention-state build: cumulative sequence lengths and block
//! table preparation, plus the decode-only bucketed/fixed-address surface
//! that keeps captured graphs replayable (spec.md §4.3, §4.7).

use crate::context::DynamicInferenceContext;
use crate::error::ContextError;
use crate::layout::{round_up_tokens, Layout};

/// Attention state rebuilt before every forward pass. In decode-only steps
/// the KV-length and block-table buffers are fixed-address (pre-allocated
/// at construction, overwritten in place) so graph captures stay valid
/// across different actual batch sizes; in prefill-or-mixed steps they are
/// freshly built views sized to the actual active count.
#[derive(Debug)]
pub struct AttentionState {
    pub max_seqlen_q: Option<u32>,
    pub max_seqlen_k: Option<u32>,
    pub cu_query_seq_lengths: Option<Vec<i32>>,
    pub cu_kv_seq_lengths: Option<Vec<i32>>,

    kv_seq_lengths_prefill: Vec<i32>,
    kv_seq_lengths_decode_only: Vec<i32>,
    decode_only_view_len: usize,

    block_table_prefill: Vec<Vec<u32>>,
    block_table_decode_only: Vec<Vec<u32>>,

    is_decode_only: bool,
}

impl AttentionState {
    pub fn new(layout: &Layout) -> Self {
        let max_requests = layout.max_requests as usize;
        let max_kv_chunk_count = layout.max_kv_chunk_count as usize;
        Self {
            max_seqlen_q: None,
            max_seqlen_k: None,
            cu_query_seq_lengths: None,
            cu_kv_seq_lengths: None,
            kv_seq_lengths_prefill: Vec::new(),
            kv_seq_lengths_decode_only: vec![0; max_requests],
            decode_only_view_len: 0,
            block_table_prefill: Vec::new(),
            block_table_decode_only: vec![vec![0; max_kv_chunk_count]; max_requests],
            is_decode_only: false,
        }
    }

    pub fn kv_seq_lengths(&self) -> &[i32] {
        if self.is_decode_only {
            &self.kv_seq_lengths_decode_only[..self.decode_only_view_len]
        } else {
            &self.kv_seq_lengths_prefill
        }
    }

    pub fn block_table(&self) -> &[Vec<u32>] {
        if self.is_decode_only {
            &self.block_table_decode_only[..self.decode_only_view_len]
        } else {
            &self.block_table_prefill
        }
    }

    /// Reset state used within attention after each step. Fixed-address
    /// decode-only buffers are zeroed in place, never reallocated.
    pub fn reset(&mut self) {
        self.max_seqlen_q = None;
        self.max_seqlen_k = None;
        self.cu_query_seq_lengths = None;
        self.cu_kv_seq_lengths = None;
        self.kv_seq_lengths_prefill.clear();
        self.kv_seq_lengths_decode_only.fill(0);
        self.decode_only_view_len = 0;
        self.block_table_prefill.clear();
        for row in &mut self.block_table_decode_only {
            row.fill(0);
        }
        self.is_decode_only = false;
    }
}

impl DynamicInferenceContext {
    /// Initialize attention state so every layer can use it this step.
    ///
    /// `num_warmup_requests`, when set, is used only to warm up cuda graphs
    /// for a synthetic decode-only batch size and requires the context to
    /// already be in decode-only mode.
    pub fn initialize_attention_state(
        &mut self,
        num_warmup_requests: Option<u32>,
    ) -> Result<(), ContextError> {
        if num_warmup_requests.is_some() {
            assert!(
                self.is_decode_only(),
                "cuda graph warmup requires decode-only mode"
            );
        }

        let active_request_count =
            num_warmup_requests.unwrap_or_else(|| self.get_active_request_count());
        let decode_only = self.is_decode_only();

        let active_cuda_graph_request_count = if decode_only {
            if active_request_count > self.layout.max_requests {
                return Err(ContextError::ActiveRequestCountOverflow {
                    active: active_request_count as usize,
                    max: self.layout.max_requests as usize,
                });
            }
            Some(self.layout.smallest_bucket_at_least(active_request_count))
        } else {
            None
        };

        self.padded_active_token_count = if decode_only {
            active_cuda_graph_request_count.unwrap()
        } else {
            round_up_tokens(self.active_token_count, self.layout.tp_size)
        };
        self.padded_active_request_count = if decode_only {
            active_cuda_graph_request_count.unwrap()
        } else {
            self.total_request_count - self.paused_request_count
        };

        let dummy = self.allocator.dummy_chunk_idx();
        for j in (self.active_token_count as usize)..(self.padded_active_token_count as usize) {
            self.tokens.chunk_idx[j] = dummy;
            self.tokens.local_position_within_kv_chunk[j] = 0;
            self.tokens.position_in_request[j] = 0;
        }

        let active_start = self.paused_request_count as usize;
        let active_end = self.total_request_count as usize;
        let query_lengths: Vec<i32> = (active_start..active_end)
            .map(|i| self.requests.query_length[i] as i32)
            .collect();

        if decode_only {
            self.attention_state.cu_query_seq_lengths = None;
            self.attention_state.max_seqlen_q = Some(1);
        } else {
            let mut cu = vec![0i32; query_lengths.len() + 1];
            for (idx, &q) in query_lengths.iter().enumerate() {
                cu[idx + 1] = cu[idx] + q;
            }
            self.attention_state.max_seqlen_q = query_lengths.iter().copied().max().map(|v| v as u32);
            self.attention_state.cu_query_seq_lengths = Some(cu);
        }

        let kv_lengths: Vec<i32> = (active_start..active_end)
            .map(|i| (self.requests.kv_length_offset[i] + self.requests.query_length[i]) as i32)
            .collect();

        self.attention_state.is_decode_only = decode_only;
        if decode_only {
            self.attention_state.kv_seq_lengths_decode_only[..kv_lengths.len()]
                .copy_from_slice(&kv_lengths);
            self.attention_state.decode_only_view_len = self.padded_active_request_count as usize;
            self.attention_state.cu_kv_seq_lengths = None;
            self.attention_state.max_seqlen_k = Some(self.layout.max_sequence_length);
        } else {
            let mut cu = vec![0i32; kv_lengths.len() + 1];
            for (idx, &k) in kv_lengths.iter().enumerate() {
                cu[idx + 1] = cu[idx] + k;
            }
            self.attention_state.max_seqlen_k = kv_lengths.iter().copied().max().map(|v| v as u32);
            self.attention_state.cu_kv_seq_lengths = Some(cu);
            self.attention_state.kv_seq_lengths_prefill = kv_lengths;
        }

        if decode_only {
            for (row, i) in (active_start..active_end).enumerate() {
                let ids = self.requests.assigned_chunk_ids(i);
                let dest = &mut self.attention_state.block_table_decode_only[row];
                dest.fill(0);
                dest[..ids.len()].copy_from_slice(&ids);
            }
        } else {
            self.attention_state.block_table_prefill = (active_start..active_end)
                .map(|i| self.requests.assigned_chunk_ids(i))
                .collect();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{DynamicContextConfig, ParamsDtype};

    fn small_config() -> DynamicContextConfig {
        DynamicContextConfig {
            params_dtype: ParamsDtype::F16,
            num_layers: 1,
            kv_channels: 8,
            num_attention_heads: 1,
            max_sequence_length: 16,
            buffer_size_gb: 1024.0 / (1024.0 * 1024.0 * 1024.0), // 1024 bytes -> 8 chunks of 128 bytes each
            buffer_guaranteed_fraction: 0.5,
            chunk_size_tokens: 4,
            buffer_overflow_factor: None,
            max_requests_override: Some(4),
            max_tokens_override: Some(16),
            tensor_model_parallel_size: Some(1),
            num_cuda_graphs: Some(2),
            materialize_only_last_token_logits: true,
        }
    }

    #[test]
    fn prefill_step_builds_cumulative_lengths() {
        let mut ctx = DynamicInferenceContext::new(small_config());
        ctx.add_request(1, &[10, 11, 12, 13], None).unwrap();
        ctx.add_request(2, &[20, 21], None).unwrap();
        ctx.initialize_attention_state(None).unwrap();

        assert!(!ctx.is_decode_only());
        let (cu_q, max_q) = ctx.cu_query_lengths();
        assert_eq!(cu_q, Some(&[0, 4, 6][..]));
        assert_eq!(max_q, Some(4));
    }

    #[test]
    fn decode_only_step_pads_to_bucket_with_dummy_page() {
        let mut ctx = DynamicInferenceContext::new(small_config());
        ctx.add_request(1, &[10, 11, 12, 13], None).unwrap();
        ctx.initialize_attention_state(None).unwrap();
        let mask = [true];
        let tokens = [99];
        ctx.update_requests(&mask, &tokens);

        assert!(ctx.is_decode_only());
        ctx.initialize_attention_state(None).unwrap();
        assert_eq!(ctx.padded_active_request_count, 2);
        let dummy = ctx.allocator.dummy_chunk_idx();
        assert_eq!(ctx.tokens.chunk_idx[1], dummy);
    }
}
