pub mod admission;
pub mod allocator;
pub mod attention_state;
pub mod context;
pub mod error;
pub mod layout;
pub mod scheduler;
pub mod tables;

pub use allocator::ChunkAllocator;
pub use attention_state::AttentionState;
pub use context::{
    DynamicInferenceContext, InferenceContext, KvCacheStorage, NoopKvCacheStorage, TokenWrite,
};
pub use error::ContextError;
pub use layout::{DynamicContextConfig, Layout, ParamsDtype};
pub use tables::{RequestTable, TokenTable};
