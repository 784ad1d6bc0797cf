//! Per-step bookkeeping update after a forward pass: promote prefill to
//! decode, retire finished requests, pause requests that need a page the
//! allocator can't give them yet, and resume paused requests as pages free
//! up (spec.md §4.5).
//!
//! All bookkeeping tensors are laid out contiguously with a conceptual
//! three-way split: `[0, paused_request_count)` paused, `[paused_request_count,
//! total_request_count)` active, `[total_request_count, max_requests)` free.
//! Rows move between zones by index swap or copy, never by (re)allocation.

use crate::context::DynamicInferenceContext;
use crate::tables::UNSET;

impl DynamicInferenceContext {
    /// Update context state after a forward pass + sampling step.
    ///
    /// `mask` has one entry per currently-active request (same order as the
    /// active zone); `true` means the request is still going, `false` means
    /// it just produced its final token. `new_tokens` carries one sampled
    /// token id per entry of `mask`, in the same order.
    pub fn update_requests(&mut self, mask: &[bool], new_tokens: &[i32]) {
        assert_eq!(mask.len(), new_tokens.len());
        assert_eq!(
            mask.len(),
            (self.total_request_count - self.paused_request_count) as usize,
            "mask must cover exactly the current active zone"
        );

        let mut active_request_count = mask.iter().filter(|&&b| b).count() as u32;
        let finished_request_count = mask.len() as u32 - active_request_count;

        self.reset_attention_state();

        // 2. Nothing paused and nothing still active: release everything and reset.
        if active_request_count + self.paused_request_count == 0 {
            if finished_request_count > 0 {
                let finished_idxs: Vec<usize> = (0..mask.len())
                    .map(|i| self.paused_request_count as usize + i)
                    .collect();
                self.release_rows(&finished_idxs);
            }
            for row in 0..self.requests.len() {
                self.requests.clear_kv_chunk_ids(row);
            }
            self.total_request_count = 0;
            self.active_token_count = 0;
            return;
        }

        // 3. Carry paused tokens forward, in front of this step's new tokens.
        let mut next_tokens: Vec<i32> = match &self.paused_tokens {
            Some(paused) => {
                let mut v = paused.clone();
                v.extend_from_slice(new_tokens);
                v
            }
            None => new_tokens.to_vec(),
        };

        // 4. Retire finished requests: release their pages, then swap
        // surviving active requests on the right into the vacated slots on
        // the left so the zone order stays [paused | active | finished].
        if finished_request_count > 0 {
            let finished_idxs: Vec<usize> = (0..mask.len())
                .filter(|&i| !mask[i])
                .map(|i| self.paused_request_count as usize + i)
                .collect();
            self.release_rows(&finished_idxs);
            for &idx in &finished_idxs {
                self.requests.clear_kv_chunk_ids(idx);
            }

            if active_request_count > 0 {
                let arc = active_request_count as usize;
                let finished_idxs_on_left: Vec<usize> = (0..arc)
                    .filter(|&i| !mask[i])
                    .map(|i| self.paused_request_count as usize + i)
                    .collect();
                let active_idxs_on_right: Vec<usize> = (arc..mask.len())
                    .filter(|&i| mask[i])
                    .map(|i| self.paused_request_count as usize + i)
                    .collect();
                debug_assert_eq!(finished_idxs_on_left.len(), active_idxs_on_right.len());

                for (&dst, &src) in finished_idxs_on_left.iter().zip(active_idxs_on_right.iter())
                {
                    self.requests.move_row(src, dst);
                    next_tokens[dst] = next_tokens[src];
                }
                for &idx in &active_idxs_on_right {
                    self.requests.clear_kv_chunk_ids(idx);
                }
            }
        }

        // 5. Pause active requests that just filled their last page, by
        // swapping them right past the (shrinking) active boundary.
        if active_request_count > 0 {
            let base = self.paused_request_count as usize;
            let arc = active_request_count as usize;
            let requiring_new_chunk: Vec<bool> = (0..arc)
                .map(|i| {
                    self.requests.last_kv_chunk_offset[base + i] == self.layout.chunk_size_tokens - 1
                })
                .collect();
            let requiring_count = requiring_new_chunk.iter().filter(|&&b| b).count();

            if requiring_count > 0 && requiring_count != arc {
                let active_on_left: Vec<usize> = (0..requiring_count)
                    .filter(|&i| !requiring_new_chunk[i])
                    .map(|i| base + i)
                    .collect();
                let paused_on_right: Vec<usize> = (requiring_count..arc)
                    .filter(|&i| requiring_new_chunk[i])
                    .map(|i| base + i)
                    .collect();
                debug_assert_eq!(active_on_left.len(), paused_on_right.len());

                for (&a, &b) in active_on_left.iter().zip(paused_on_right.iter()) {
                    self.requests.swap_row(a, b);
                    next_tokens.swap(a, b);
                }
            }

            self.paused_request_count += requiring_count as u32;
            active_request_count -= requiring_count as u32;
        }

        // 6. Resume as many paused requests as the allocator can support:
        // prefer pages outside the guaranteed reserve, only dipping into it
        // if active request count has dropped below the reserved floor.
        let avail = self.allocator.avail();
        let num_non_gtd_chunks = avail.saturating_sub(self.layout.gtd_chunk_count);
        let resume_request_count = if num_non_gtd_chunks > 0 {
            num_non_gtd_chunks.min(self.paused_request_count)
        } else {
            self.layout
                .gtd_request_count
                .saturating_sub(active_request_count)
                .min(self.paused_request_count)
        };

        self.paused_request_count -= resume_request_count;
        active_request_count += resume_request_count;
        debug_assert!(active_request_count > 0);

        // 7. Commit the new zone boundaries; every surviving request is now
        // a one-token decode step.
        self.total_request_count = active_request_count + self.paused_request_count;
        self.active_token_count = active_request_count;

        let active_start = self.paused_request_count as usize;
        let active_end = self.total_request_count as usize;

        for (j, i) in (active_start..active_end).enumerate() {
            self.tokens.input_id[j] = next_tokens[i];
        }

        self.paused_tokens = if self.paused_request_count > 0 {
            Some(next_tokens[..self.paused_request_count as usize].to_vec())
        } else {
            None
        };

        for i in active_start..active_end {
            self.requests.kv_length_offset[i] += self.requests.query_length[i];
            self.requests.query_length[i] = 1;
        }
        for (j, i) in (active_start..active_end).enumerate() {
            self.tokens.pos_id[j] = self.requests.kv_length_offset[i] as i32;
        }
        for i in active_start..active_end {
            self.requests.last_kv_chunk_offset[i] =
                (self.requests.last_kv_chunk_offset[i] + 1) % self.layout.chunk_size_tokens;
        }

        // 8. Assign a fresh page to each just-resumed request.
        if resume_request_count > 0 {
            let resume_start = active_start;
            let resume_end = active_start + resume_request_count as usize;
            debug_assert!(self.requests.last_kv_chunk_offset[resume_start..resume_end]
                .iter()
                .all(|&off| off == 0));

            let chunk_ids = self
                .allocator
                .allocate(resume_request_count, false)
                .expect("resume budget must never exceed allocator availability");
            for (k, i) in (resume_start..resume_end).enumerate() {
                let col = self.requests.kv_chunk_count[i] as usize;
                self.requests.kv_chunk_ids[i][col] = chunk_ids[k] as i64;
                self.requests.kv_chunk_count[i] += 1;
                self.requests.last_kv_chunk_id[i] = chunk_ids[k] as i64;
            }
        }

        // 9. Lay out token bookkeeping for the single decode token each
        // active request contributes this step.
        for (j, i) in (active_start..active_end).enumerate() {
            self.tokens.request_idx[j] = i as i64;
            self.tokens.position_in_request[j] = self.requests.kv_length_offset[i] as i32;
            self.tokens.chunk_idx[j] = self.requests.last_kv_chunk_id[i] as u32;
            self.tokens.local_position_within_kv_chunk[j] = self.requests.last_kv_chunk_offset[i];
        }
    }

    fn release_rows(&mut self, idxs: &[usize]) {
        let mut ids = Vec::new();
        for &idx in idxs {
            for &id in &self.requests.kv_chunk_ids[idx] {
                if id != UNSET {
                    ids.push(id as u32);
                }
            }
        }
        self.allocator.release(ids);
    }
}
