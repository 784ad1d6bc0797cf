//! Admission: turning a new prompt into a reserved request slot and its
//! first batch of token-table rows (spec.md §4.2).

use crate::context::DynamicInferenceContext;
use crate::error::ContextError;
use crate::tables::UNSET;

impl DynamicInferenceContext {
    /// Admit a new request at slot `total_request_count`, reserving its KV
    /// pages and writing its prompt into the token table. The request then
    /// runs one prefill step followed by decode steps until it finishes or
    /// is retired.
    ///
    /// `tokens_to_generate`, when `None`, defaults to filling out the
    /// remaining room up to `max_sequence_length`.
    pub fn add_request(
        &mut self,
        request_id: i64,
        tokens: &[i32],
        tokens_to_generate: Option<u32>,
    ) -> Result<(), ContextError> {
        let context_length = tokens.len() as u32;

        if self.active_token_count + context_length > self.layout.max_tokens {
            return Err(ContextError::TokenOverflow {
                requested: (self.active_token_count + context_length) as usize,
                max: self.layout.max_tokens as usize,
            });
        }
        if self.total_request_count >= self.layout.max_requests {
            return Err(ContextError::RequestOverflow {
                max: self.layout.max_requests as usize,
            });
        }

        if context_length > self.layout.max_sequence_length {
            return Err(ContextError::MaxSequenceLengthOverflow {
                requested: context_length as usize,
                max: self.layout.max_sequence_length as usize,
            });
        }

        let tokens_to_generate = match tokens_to_generate {
            None => self.layout.max_sequence_length - context_length,
            Some(n) => {
                if context_length + n > self.layout.max_sequence_length {
                    return Err(ContextError::MaxSequenceLengthOverflow {
                        requested: (context_length + n) as usize,
                        max: self.layout.max_sequence_length as usize,
                    });
                }
                n
            }
        };

        let chunk_size = self.layout.chunk_size_tokens;
        let num_chunks_needed = context_length.div_ceil(chunk_size);
        let new_chunk_ids = self
            .allocator
            .allocate(num_chunks_needed, true)
            .ok_or(ContextError::ChunkOverflow {
                needed: num_chunks_needed as usize,
            })?;

        let slot = self.total_request_count as usize;
        self.requests.request_id[slot] = request_id;
        self.requests.query_length[slot] = context_length;
        self.requests.output_length[slot] = context_length + tokens_to_generate;
        self.requests.kv_length_offset[slot] = 0;
        self.requests.kv_chunk_count[slot] = num_chunks_needed;
        self.requests.kv_chunk_ids[slot].fill(UNSET);
        for (k, &id) in new_chunk_ids.iter().enumerate() {
            self.requests.kv_chunk_ids[slot][k] = id as i64;
        }
        self.requests.last_kv_chunk_id[slot] = *new_chunk_ids.last().unwrap() as i64;
        self.requests.last_kv_chunk_offset[slot] = (context_length - 1) % chunk_size;

        let base = self.active_token_count as usize;
        for k in 0..context_length as usize {
            let j = base + k;
            self.tokens.pos_id[j] = k as i32;
            self.tokens.input_id[j] = tokens[k];
            self.tokens.request_idx[j] = self.total_request_count as i64;
            self.tokens.position_in_request[j] = k as i32;
            self.tokens.chunk_idx[j] = new_chunk_ids[k / chunk_size as usize];
            self.tokens.local_position_within_kv_chunk[j] = k as u32 % chunk_size;
        }

        self.total_request_count += 1;
        self.active_token_count += context_length;

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
    fn admits_request_and_lays_out_token_rows() {
        let mut ctx = DynamicInferenceContext::new(small_config());
        ctx.add_request(7, &[1, 2, 3, 4, 5], Some(3)).unwrap();

        assert_eq!(ctx.requests.request_id[0], 7);
        assert_eq!(ctx.requests.query_length[0], 5);
        assert_eq!(ctx.requests.output_length[0], 8);
        assert_eq!(ctx.requests.kv_chunk_count[0], 2);
        assert_eq!(ctx.requests.last_kv_chunk_offset[0], 0);
        assert_eq!(ctx.tokens.position_in_request[4], 4);
        assert_eq!(ctx.tokens.local_position_within_kv_chunk[4], 0);
        assert_eq!(ctx.total_request_count, 1);
        assert_eq!(ctx.active_token_count, 5);
    }

    #[test]
    fn default_tokens_to_generate_fills_remaining_sequence_room() {
        let mut ctx = DynamicInferenceContext::new(small_config());
        ctx.add_request(1, &[1, 2, 3, 4], None).unwrap();
        assert_eq!(ctx.requests.output_length[0], 16);
    }

    #[test]
    fn rejects_request_exceeding_max_sequence_length() {
        let mut ctx = DynamicInferenceContext::new(small_config());
        let err = ctx.add_request(1, &[1, 2, 3, 4], Some(20)).unwrap_err();
        assert_eq!(
            err,
            ContextError::MaxSequenceLengthOverflow {
                requested: 24,
                max: 16
            }
        );
    }

    #[test]
    fn rejects_prompt_longer_than_max_sequence_length_with_default_tokens_to_generate() {
        // max_tokens is independent of max_sequence_length here, so a
        // 20-token prompt clears the TokenOverflow check but must still be
        // rejected before the None-path subtraction underflows.
        let config = DynamicContextConfig {
            max_tokens_override: Some(64),
            ..small_config()
        };
        let mut ctx = DynamicInferenceContext::new(config);
        let prompt: Vec<i32> = (0..20).collect();
        let err = ctx.add_request(1, &prompt, None).unwrap_err();
        assert_eq!(
            err,
            ContextError::MaxSequenceLengthOverflow {
                requested: 20,
                max: 16
            }
        );
    }

    #[test]
    fn rejects_request_count_overflow() {
        let mut ctx = DynamicInferenceContext::new(small_config());
        for i in 0..4 {
            ctx.add_request(i, &[1, 2], Some(1)).unwrap();
        }
        let err = ctx.add_request(99, &[1, 2], Some(1)).unwrap_err();
        assert_eq!(err, ContextError::RequestOverflow { max: 4 });
    }

    #[test]
    fn rejects_token_overflow() {
        let mut ctx = DynamicInferenceContext::new(small_config());
        let err = ctx
            .add_request(1, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17], None)
            .unwrap_err();
        assert!(matches!(err, ContextError::TokenOverflow { .. }));
    }
}
