use dyncache_core::{ContextError, DynamicContextConfig, DynamicInferenceContext, ParamsDtype};
use pyo3::exceptions::{PyOverflowError, PyValueError};
use pyo3::prelude::*;

fn parse_dtype(s: &str) -> PyResult<ParamsDtype> {
    match s {
        "f16" => Ok(ParamsDtype::F16),
        "bf16" => Ok(ParamsDtype::Bf16),
        "f32" => Ok(ParamsDtype::F32),
        other => Err(PyValueError::new_err(format!(
            "unknown params_dtype {other:?}, expected one of \"f16\", \"bf16\", \"f32\""
        ))),
    }
}

fn context_error_to_py(err: ContextError) -> PyErr {
    match err {
        ContextError::TokenOverflow { .. }
        | ContextError::RequestOverflow { .. }
        | ContextError::MaxSequenceLengthOverflow { .. }
        | ContextError::ChunkOverflow { .. } => PyOverflowError::new_err(err.to_string()),
        ContextError::ActiveRequestCountOverflow { .. } => PyValueError::new_err(err.to_string()),
    }
}

/// Construction-time configuration for [`PyDynamicInferenceContext`], mirroring
/// `dyncache_core::DynamicContextConfig`.
#[pyclass(name = "DynamicContextConfig")]
#[derive(Clone, Debug)]
struct PyDynamicContextConfig {
    inner: DynamicContextConfig,
}

#[pymethods]
impl PyDynamicContextConfig {
    #[new]
    #[pyo3(signature = (
        num_layers,
        kv_channels,
        num_attention_heads,
        max_sequence_length,
        buffer_size_gb,
        buffer_guaranteed_fraction,
        chunk_size_tokens=256,
        params_dtype="bf16",
        buffer_overflow_factor=None,
        max_requests_override=None,
        max_tokens_override=None,
        tensor_model_parallel_size=None,
        num_cuda_graphs=None,
        materialize_only_last_token_logits=true,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        num_layers: usize,
        kv_channels: usize,
        num_attention_heads: usize,
        max_sequence_length: u32,
        buffer_size_gb: f64,
        buffer_guaranteed_fraction: f64,
        chunk_size_tokens: u32,
        params_dtype: &str,
        buffer_overflow_factor: Option<f64>,
        max_requests_override: Option<u32>,
        max_tokens_override: Option<u32>,
        tensor_model_parallel_size: Option<u32>,
        num_cuda_graphs: Option<u32>,
        materialize_only_last_token_logits: bool,
    ) -> PyResult<Self> {
        Ok(Self {
            inner: DynamicContextConfig {
                params_dtype: parse_dtype(params_dtype)?,
                num_layers,
                kv_channels,
                num_attention_heads,
                max_sequence_length,
                buffer_size_gb,
                buffer_guaranteed_fraction,
                chunk_size_tokens,
                buffer_overflow_factor,
                max_requests_override,
                max_tokens_override,
                tensor_model_parallel_size,
                num_cuda_graphs,
                materialize_only_last_token_logits,
            },
        })
    }
}

/// Python-facing wrapper around [`dyncache_core::DynamicInferenceContext`].
///
/// Exposes admission and the per-step bookkeeping surface only. Cache tensor
/// storage and the attention kernels that read it stay out of scope (the
/// core crate models only the scatter/gather indices), so
/// `append_key_value_cache` / `key_value_cache` are not bound here — a Python
/// caller that owns GPU tensors drives those through its own kernels using
/// the block table and position vectors this binding returns.
#[pyclass(name = "DynamicInferenceContext")]
struct PyDynamicInferenceContext {
    inner: DynamicInferenceContext,
}

#[pymethods]
impl PyDynamicInferenceContext {
    #[new]
    fn new(config: PyDynamicContextConfig) -> Self {
        Self {
            inner: DynamicInferenceContext::new(config.inner),
        }
    }

    #[pyo3(signature = (request_id, token_ids, tokens_to_generate=None))]
    fn add_request(
        &mut self,
        request_id: i64,
        token_ids: Vec<i32>,
        tokens_to_generate: Option<u32>,
    ) -> PyResult<()> {
        self.inner
            .add_request(request_id, &token_ids, tokens_to_generate)
            .map_err(context_error_to_py)
    }

    #[pyo3(signature = (num_warmup_requests=None))]
    fn initialize_attention_state(&mut self, num_warmup_requests: Option<u32>) -> PyResult<()> {
        self.inner
            .initialize_attention_state(num_warmup_requests)
            .map_err(context_error_to_py)
    }

    #[pyo3(signature = (num_warmup_tokens=None))]
    fn current_input_and_position_ids(
        &self,
        num_warmup_tokens: Option<u32>,
    ) -> (Vec<i32>, Vec<i32>) {
        let (ids, positions) = self.inner.current_input_and_position_ids(num_warmup_tokens);
        (ids.to_vec(), positions.to_vec())
    }

    fn apply_rotary_emb_query_positions(&self) -> Vec<i32> {
        self.inner.apply_rotary_emb_query_positions().to_vec()
    }

    fn apply_rotary_emb_key_positions(&self) -> Vec<i32> {
        self.inner.apply_rotary_emb_key_positions().to_vec()
    }

    fn update_requests(&mut self, mask: Vec<bool>, new_tokens: Vec<i32>) {
        self.inner.update_requests(&mask, &new_tokens);
    }

    fn last_token_logits(&self, logits: Vec<f32>, vocab_size: usize) -> Vec<f32> {
        self.inner.last_token_logits(&logits, vocab_size)
    }

    fn calculate_log_probs(&self, logits: Vec<f32>, vocab_size: usize) -> Vec<Vec<f32>> {
        self.inner.calculate_log_probs(&logits, vocab_size)
    }

    fn block_table(&self) -> Vec<Vec<u32>> {
        self.inner.block_table().to_vec()
    }

    fn cu_query_lengths(&self) -> (Option<Vec<i32>>, Option<u32>) {
        let (cu, max_q) = self.inner.cu_query_lengths();
        (cu.map(|s| s.to_vec()), max_q)
    }

    fn cu_kv_lengths(&self) -> (Option<Vec<i32>>, Vec<i32>, Option<u32>) {
        let (cu, kv_lengths, max_k) = self.inner.cu_kv_lengths();
        (cu.map(|s| s.to_vec()), kv_lengths.to_vec(), max_k)
    }

    fn has_unfinished_requests(&self) -> bool {
        self.inner.has_unfinished_requests()
    }

    fn is_decode_only(&self) -> bool {
        self.inner.is_decode_only()
    }

    fn get_active_request_count(&self) -> u32 {
        self.inner.get_active_request_count()
    }

    fn get_active_sequence_lengths(&self) -> Vec<u32> {
        self.inner.get_active_sequence_lengths()
    }

    fn get_max_sequence_lengths(&self) -> Vec<u32> {
        self.inner.get_max_sequence_lengths()
    }

    fn chunk_allocator_avail(&self) -> u32 {
        self.inner.chunk_allocator_avail()
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn reset_attention_state(&mut self) {
        self.inner.reset_attention_state();
    }
}

#[pyfunction]
fn ping() -> &'static str {
    "ok"
}

#[pyfunction]
fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[pymodule]
fn dyncache_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(ping, m)?)?;
    m.add_function(wrap_pyfunction!(core_version, m)?)?;
    m.add_class::<PyDynamicContextConfig>()?;
    m.add_class::<PyDynamicInferenceContext>()?;
    Ok(())
}
