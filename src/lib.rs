#![forbid(unsafe_code)]

//! # promptgrid
//!
//! Expand prompt templates over variable bindings and query models with
//! every concrete prompt, without paying twice for the same answer.
//!
//! A template such as `"Who is {person}?"` bound to `person: ["TJ", "MJ"]`
//! becomes two concrete prompts. [`PromptPipeline`] sends each of them (once
//! per chat history) through a per-model [`RateLimiter`], merges the outputs
//! into a [`ResponseCache`] and streams results back as calls complete.
//! Identities already answered `n` times are served from the cache; partial
//! entries only request the shortfall.
//!
//! Model access, image compression and usage accounting are injected through
//! the traits in [`gateway`].

pub mod cache;
pub mod extract;
pub mod gateway;
pub mod permutation;
pub mod pipeline;
pub mod rate_limit;
pub mod response;
pub mod template;

pub use cache::{CacheMap, KeyValueStore, MemoryStore, ResponseCache, SqliteStore};
pub use extract::{extract_responses, ExtractionError};
pub use gateway::{
    ChatHistoryInfo, ImageCompressor, Message, ModelCall, ModelCaller, ModelReply, ModelSpec,
    Provider, ProviderError, UsageSink,
};
pub use permutation::{PromptPermutationGenerator, VarBindings, VarValues};
pub use pipeline::{GenRequest, PipelineConfig, PipelineError, PromptPipeline};
pub use rate_limit::{Cancelled, RateLimit, RateLimitConfig, RateLimiter};
pub use response::{merge_response_objs, LlmOutput, QueryResult, ResponseError, ResponseObject};
pub use template::{PromptTemplate, TemplateError, TemplateValue, TemplateVarInfo};
