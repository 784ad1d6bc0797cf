//! Randomized admission/retirement stress test, in the style of the
//! teacher's `tests/radix_stress.rs`: drive a long randomized sequence of
//! operations through the public API and check the invariants from spec.md
//! §8 hold after every step, rather than hand-picking a handful of cases.

use dyncache_core::{DynamicContextConfig, DynamicInferenceContext, ParamsDtype};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn stress_config() -> DynamicContextConfig {
    DynamicContextConfig {
        params_dtype: ParamsDtype::F16,
        num_layers: 1,
        kv_channels: 8,
        num_attention_heads: 1,
        max_sequence_length: 32,
        // 8192 bytes / 256 bytes-per-chunk -> 32 chunks.
        buffer_size_gb: 8192.0 / (1024.0 * 1024.0 * 1024.0),
        buffer_guaranteed_fraction: 0.25,
        chunk_size_tokens: 8,
        buffer_overflow_factor: None,
        max_requests_override: Some(8),
        max_tokens_override: Some(256),
        tensor_model_parallel_size: Some(1),
        num_cuda_graphs: None,
        materialize_only_last_token_logits: true,
    }
}

fn assert_invariants(ctx: &DynamicInferenceContext) {
    let layout = ctx.layout();
    assert!(ctx.total_request_count() <= layout.max_requests);
    assert!(ctx.active_token_count() <= layout.max_tokens);
    assert!(ctx.chunk_allocator_avail() <= layout.total_chunks);
    if !ctx.has_unfinished_requests() {
        assert_eq!(
            ctx.chunk_allocator_avail(),
            layout.total_chunks,
            "every page must be back in the pool once no request remains"
        );
    }
}

#[test]
fn randomized_admission_and_scheduling_preserves_invariants() {
    let mut rng = StdRng::seed_from_u64(0xD19_CACE);
    let mut ctx = DynamicInferenceContext::new(stress_config());
    let max_sequence_length = ctx.layout().max_sequence_length;
    let mut next_request_id = 0_i64;

    for _ in 0..500 {
        if rng.random_bool(0.6) {
            let prompt_len = rng.random_range(1..=max_sequence_length as usize);
            let tokens_to_generate = rng.random_range(0..=(max_sequence_length as usize - prompt_len)) as u32;
            let prompt: Vec<i32> = (0..prompt_len).map(|_| rng.random_range(1..=100)).collect();
            let _ = ctx.add_request(next_request_id, &prompt, Some(tokens_to_generate));
            next_request_id += 1;
            assert_invariants(&ctx);
        }

        let active = ctx.get_active_request_count() as usize;
        let mask: Vec<bool> = (0..active).map(|_| rng.random_bool(0.5)).collect();
        let tokens: Vec<i32> = (0..active).map(|_| rng.random_range(1..=100)).collect();
        ctx.update_requests(&mask, &tokens);
        assert_invariants(&ctx);
    }
}
