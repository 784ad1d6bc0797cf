//! Per-request and per-token contiguous bookkeeping arrays (spec.md §3).
//!
//! Both tables are flat parallel arrays, not owned per-request objects: the
//! request table is partitioned into `[0, P)` paused, `[P, T)` active,
//! `[T, max_requests)` free; rows move between zones by index swap, never by
//! allocation. This keeps the layout cache-friendly and lets downstream
//! attention kernels consume packed tensors directly.

/// Sentinel for an unassigned request id / chunk id slot.
pub const UNSET: i64 = -1;

/// Per-request contiguous bookkeeping, one row per request slot.
#[derive(Debug, Clone)]
pub struct RequestTable {
    pub request_id: Vec<i64>,
    pub query_length: Vec<u32>,
    pub output_length: Vec<u32>,
    pub kv_length_offset: Vec<u32>,
    pub kv_chunk_count: Vec<u32>,
    pub last_kv_chunk_id: Vec<i64>,
    pub last_kv_chunk_offset: Vec<u32>,
    /// `kv_chunk_ids[slot][k]` is the k-th assigned page index for `slot`,
    /// or `UNSET` if unassigned. Row width is `max_kv_chunk_count`.
    pub kv_chunk_ids: Vec<Vec<i64>>,
    max_kv_chunk_count: usize,
}

impl RequestTable {
    pub fn new(max_requests: u32, max_kv_chunk_count: u32) -> Self {
        let max_requests = max_requests as usize;
        let max_kv_chunk_count = max_kv_chunk_count as usize;
        Self {
            request_id: vec![UNSET; max_requests],
            query_length: vec![0; max_requests],
            output_length: vec![0; max_requests],
            kv_length_offset: vec![0; max_requests],
            kv_chunk_count: vec![0; max_requests],
            last_kv_chunk_id: vec![UNSET; max_requests],
            last_kv_chunk_offset: vec![0; max_requests],
            kv_chunk_ids: vec![vec![UNSET; max_kv_chunk_count]; max_requests],
            max_kv_chunk_count,
        }
    }

    pub fn max_kv_chunk_count(&self) -> usize {
        self.max_kv_chunk_count
    }

    pub fn len(&self) -> usize {
        self.request_id.len()
    }

    /// Copy every bookkeeping field of `src` onto `dst` (index-level move, no
    /// ownership transfer).
    pub fn move_row(&mut self, src: usize, dst: usize) {
        if src == dst {
            return;
        }
        self.request_id[dst] = self.request_id[src];
        self.query_length[dst] = self.query_length[src];
        self.output_length[dst] = self.output_length[src];
        self.kv_length_offset[dst] = self.kv_length_offset[src];
        self.kv_chunk_count[dst] = self.kv_chunk_count[src];
        self.last_kv_chunk_id[dst] = self.last_kv_chunk_id[src];
        self.last_kv_chunk_offset[dst] = self.last_kv_chunk_offset[src];
        self.kv_chunk_ids[dst] = self.kv_chunk_ids[src].clone();
    }

    /// Reset a single row's chunk-id vector to "unassigned" (used when a
    /// request is retired or vacated during a swap).
    pub fn clear_kv_chunk_ids(&mut self, idx: usize) {
        self.kv_chunk_ids[idx].fill(UNSET);
    }

    /// Exchange every bookkeeping field between two rows in place.
    pub fn swap_row(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.request_id.swap(a, b);
        self.query_length.swap(a, b);
        self.output_length.swap(a, b);
        self.kv_length_offset.swap(a, b);
        self.kv_chunk_count.swap(a, b);
        self.last_kv_chunk_id.swap(a, b);
        self.last_kv_chunk_offset.swap(a, b);
        self.kv_chunk_ids.swap(a, b);
    }

    /// Reset a single row to its default "free slot" state.
    pub fn clear_row(&mut self, idx: usize) {
        self.request_id[idx] = UNSET;
        self.query_length[idx] = 0;
        self.output_length[idx] = 0;
        self.kv_length_offset[idx] = 0;
        self.kv_chunk_count[idx] = 0;
        self.last_kv_chunk_id[idx] = UNSET;
        self.last_kv_chunk_offset[idx] = 0;
        self.clear_kv_chunk_ids(idx);
    }

    pub fn reset(&mut self) {
        for idx in 0..self.len() {
            self.clear_row(idx);
        }
    }

    /// Assigned page indices for `slot`, in order, excluding unset entries.
    pub fn assigned_chunk_ids(&self, slot: usize) -> Vec<u32> {
        self.kv_chunk_ids[slot]
            .iter()
            .copied()
            .take_while(|&id| id != UNSET)
            .map(|id| id as u32)
            .collect()
    }
}

/// Per-token contiguous bookkeeping, one row per flattened-batch token slot.
#[derive(Debug, Clone)]
pub struct TokenTable {
    pub input_id: Vec<i32>,
    pub pos_id: Vec<i32>,
    pub request_idx: Vec<i64>,
    pub position_in_request: Vec<i32>,
    pub chunk_idx: Vec<u32>,
    pub local_position_within_kv_chunk: Vec<u32>,
}

impl TokenTable {
    pub fn new(max_tokens: u32) -> Self {
        let max_tokens = max_tokens as usize;
        Self {
            input_id: vec![0; max_tokens],
            pos_id: vec![0; max_tokens],
            request_idx: vec![UNSET; max_tokens],
            position_in_request: vec![0; max_tokens],
            chunk_idx: vec![0; max_tokens],
            local_position_within_kv_chunk: vec![0; max_tokens],
        }
    }

    pub fn len(&self) -> usize {
        self.input_id.len()
    }

    pub fn reset(&mut self) {
        self.input_id.fill(0);
        self.pos_id.fill(0);
        self.request_idx.fill(UNSET);
        self.position_in_request.fill(0);
        self.chunk_idx.fill(0);
        self.local_position_within_kv_chunk.fill(0);
    }
}
