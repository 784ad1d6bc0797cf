//! The dynamic inference context: construction, introspection, the KV cache
//! R/W contract, rotary-position adapters, and logit extraction. Admission
//! (`add_request`) lives in [`crate::admission`], the per-step scheduler
//! update in [`crate::scheduler`], and attention-state build in
//! [`crate::attention_state`].

use crate::attention_state::AttentionState;
use crate::allocator::ChunkAllocator;
use crate::layout::{DynamicContextConfig, Layout};
use crate::tables::{RequestTable, TokenTable};

/// A single token's target write position within the paged KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenWrite {
    pub chunk_idx: u32,
    pub local_position: u32,
}

/// Storage backend for the KV cache tensors themselves. Tensor ownership and
/// the attention math that reads these planes are out of scope for this
/// crate (spec.md §1); this trait is the seam a colocated attention engine
/// implements. `vector_dim` is the per-token K/V vector width
/// (`heads_per_partition * head_dim`).
pub trait KvCacheStorage {
    /// Scatter one token's key/value vectors into `write`'s page slot.
    fn write_token(&mut self, layer: usize, write: TokenWrite, key: &[f32], value: &[f32]);

    /// The raw key/value pool planes for `layer`. Consumers index into these
    /// using the block table and perform paged attention themselves.
    fn layer_planes(&self, layer: usize) -> (&[f32], &[f32]);
}

/// Test/demo storage backend that discards writes and exposes empty planes.
#[derive(Debug, Default)]
pub struct NoopKvCacheStorage;

impl KvCacheStorage for NoopKvCacheStorage {
    fn write_token(&mut self, _layer: usize, _write: TokenWrite, _key: &[f32], _value: &[f32]) {}

    fn layer_planes(&self, _layer: usize) -> (&[f32], &[f32]) {
        (&[], &[])
    }
}

/// Common surface shared by static and dynamic batching strategies (see
/// spec.md §9's polymorphism note). Only the dynamic strategy is implemented
/// in this crate; the trait seam exists so a static-batching counterpart
/// could share callers without an inheritance hierarchy.
pub trait InferenceContext {
    fn has_unfinished_requests(&self) -> bool;
    fn is_decode_only(&self) -> bool;
    fn reset(&mut self);
}

/// The dynamic inference context: scheduler and bookkeeping subsystem for
/// in-flight continuous batching over a paged KV cache.
#[derive(Debug)]
pub struct DynamicInferenceContext {
    pub(crate) layout: Layout,
    pub(crate) allocator: ChunkAllocator,
    pub(crate) requests: RequestTable,
    pub(crate) tokens: TokenTable,

    pub(crate) total_request_count: u32,
    pub(crate) paused_request_count: u32,
    pub(crate) active_token_count: u32,
    pub(crate) padded_active_token_count: u32,
    pub(crate) padded_active_request_count: u32,
    pub(crate) paused_tokens: Option<Vec<i32>>,

    pub(crate) attention_state: AttentionState,
    pub(crate) materialize_only_last_token_logits: bool,
}

impl DynamicInferenceContext {
    pub fn new(config: DynamicContextConfig) -> Self {
        let layout = Layout::derive(&config);
        let allocator = ChunkAllocator::new(layout.total_chunks, layout.gtd_chunk_count);
        let requests = RequestTable::new(layout.max_requests, layout.max_kv_chunk_count);
        let tokens = TokenTable::new(layout.max_tokens);
        let attention_state = AttentionState::new(&layout);

        Self {
            layout,
            allocator,
            requests,
            tokens,
            total_request_count: 0,
            paused_request_count: 0,
            active_token_count: 0,
            padded_active_token_count: 0,
            padded_active_request_count: 0,
            paused_tokens: None,
            attention_state,
            materialize_only_last_token_logits: config.materialize_only_last_token_logits,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn materialize_only_last_token_logits(&self) -> bool {
        self.materialize_only_last_token_logits
    }

    /// Is every active request in the decode phase (one token each)?
    pub fn is_decode_only(&self) -> bool {
        let total_active = self.total_request_count - self.paused_request_count;
        total_active == self.active_token_count
    }

    pub fn has_unfinished_requests(&self) -> bool {
        self.total_request_count > 0
    }

    pub fn get_active_request_count(&self) -> u32 {
        self.total_request_count - self.paused_request_count
    }

    pub fn total_request_count(&self) -> u32 {
        self.total_request_count
    }

    pub fn paused_request_count(&self) -> u32 {
        self.paused_request_count
    }

    pub fn active_token_count(&self) -> u32 {
        self.active_token_count
    }

    pub fn chunk_allocator_avail(&self) -> u32 {
        self.allocator.avail()
    }

    /// Active-zone slice bounds `[paused_request_count, total_request_count)`.
    fn active_range(&self) -> std::ops::Range<usize> {
        self.paused_request_count as usize..self.total_request_count as usize
    }

    pub fn get_active_sequence_lengths(&self) -> Vec<u32> {
        self.active_range()
            .map(|i| self.requests.kv_length_offset[i] + self.requests.query_length[i])
            .collect()
    }

    pub fn get_max_sequence_lengths(&self) -> Vec<u32> {
        self.active_range()
            .map(|i| self.requests.output_length[i])
            .collect()
    }

    pub fn cu_query_lengths(&self) -> (Option<&[i32]>, Option<u32>) {
        (
            self.attention_state.cu_query_seq_lengths.as_deref(),
            self.attention_state.max_seqlen_q,
        )
    }

    pub fn cu_kv_lengths(&self) -> (Option<&[i32]>, &[i32], Option<u32>) {
        (
            self.attention_state.cu_kv_seq_lengths.as_deref(),
            self.attention_state.kv_seq_lengths(),
            self.attention_state.max_seqlen_k,
        )
    }

    pub fn block_table(&self) -> &[Vec<u32>] {
        self.attention_state.block_table()
    }

    pub fn reset_attention_state(&mut self) {
        self.attention_state.reset();
    }

    /// Reset the entire context: tables, counts, allocator, and attention
    /// state. Does not reallocate any buffer (their addresses may be
    /// referenced by captured graphs), matching spec.md §5's contract.
    pub fn reset(&mut self) {
        self.total_request_count = 0;
        self.active_token_count = 0;
        self.paused_request_count = 0;
        self.padded_active_token_count = 0;
        self.padded_active_request_count = 0;
        self.paused_tokens = None;

        self.requests.reset();
        self.tokens.reset();
        self.attention_state.reset();
        self.allocator.reset();
    }

    /// Flattened input and position IDs for the forward pass.
    pub fn current_input_and_position_ids(
        &self,
        num_warmup_tokens: Option<u32>,
    ) -> (&[i32], &[i32]) {
        let n = num_warmup_tokens.unwrap_or(self.padded_active_token_count) as usize;
        (&self.tokens.input_id[..n], &self.tokens.pos_id[..n])
    }

    /// Position indices a caller gathers query rotary frequencies by. Actual
    /// rotary math is out of scope (spec.md §1/§6); this only specifies
    /// which positions are looked up.
    pub fn apply_rotary_emb_query_positions(&self) -> &[i32] {
        let n = self.padded_active_token_count as usize;
        &self.tokens.pos_id[..n]
    }

    /// Position indices a caller gathers key rotary frequencies by.
    pub fn apply_rotary_emb_key_positions(&self) -> &[i32] {
        let n = self.padded_active_token_count as usize;
        &self.tokens.position_in_request[..n]
    }

    /// Scatter this layer's per-token key/value vectors into their assigned
    /// page slots, for tokens `[0, padded_active_token_count)`.
    pub fn append_key_value_cache(
        &self,
        layer: usize,
        keys: &[&[f32]],
        values: &[&[f32]],
        storage: &mut impl KvCacheStorage,
    ) {
        let n = self.padded_active_token_count as usize;
        assert_eq!(keys.len(), n, "key count must match padded_active_token_count");
        assert_eq!(values.len(), n, "value count must match padded_active_token_count");
        for j in 0..n {
            let write = TokenWrite {
                chunk_idx: self.tokens.chunk_idx[j],
                local_position: self.tokens.local_position_within_kv_chunk[j],
            };
            storage.write_token(layer, write, keys[j], values[j]);
        }
    }

    /// Read this layer's key/value pool planes and the current block table.
    pub fn key_value_cache<'a>(
        &'a self,
        layer: usize,
        storage: &'a impl KvCacheStorage,
    ) -> (&'a [f32], &'a [f32], &'a [Vec<u32>]) {
        let (k, v) = storage.layer_planes(layer);
        (k, v, self.block_table())
    }

    /// Extract per-request next-token logits from the flattened prefill
    /// output, gathering each active request's last contributed row.
    pub fn last_token_logits(&self, logits: &[f32], vocab_size: usize) -> Vec<f32> {
        let active = self.active_range();
        assert_eq!(
            logits.len(),
            self.padded_active_token_count as usize * vocab_size,
            "logits length must equal padded_active_token_count * vocab_size"
        );
        let mut out = Vec::with_capacity(active.len() * vocab_size);
        let mut cumulative = 0u32;
        for i in active {
            cumulative += self.requests.query_length[i];
            let row = (cumulative - 1) as usize;
            out.extend_from_slice(&logits[row * vocab_size..(row + 1) * vocab_size]);
        }
        out
    }

    /// Log-softmax over the vocab axis for each active token this step,
    /// selecting the log-prob of its recorded input id, then splitting the
    /// result per request by that request's `query_length`.
    pub fn calculate_log_probs(&self, logits: &[f32], vocab_size: usize) -> Vec<Vec<f32>> {
        assert_eq!(
            logits.len(),
            self.padded_active_token_count as usize * vocab_size,
            "logits length must equal padded_active_token_count * vocab_size"
        );

        let n = self.active_token_count as usize;
        let mut selected = Vec::with_capacity(n);
        for t in 0..n {
            let row = &logits[t * vocab_size..(t + 1) * vocab_size];
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum_exp: f32 = row.iter().map(|&x| (x - max).exp()).sum();
            let log_sum_exp = max + sum_exp.ln();
            let token_id = self.tokens.input_id[t] as usize;
            selected.push(row[token_id] - log_sum_exp);
        }

        let mut out = Vec::with_capacity(self.active_range().len());
        let mut cursor = 0usize;
        for i in self.active_range() {
            let len = self.requests.query_length[i] as usize;
            out.push(selected[cursor..cursor + len].to_vec());
            cursor += len;
        }
        out
    }
}

impl InferenceContext for DynamicInferenceContext {
    fn has_unfinished_requests(&self) -> bool {
        DynamicInferenceContext::has_unfinished_requests(self)
    }

    fn is_decode_only(&self) -> bool {
        DynamicInferenceContext::is_decode_only(self)
    }

    fn reset(&mut self) {
        DynamicInferenceContext::reset(self)
    }
}
