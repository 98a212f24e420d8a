//! Capabilities the engine consumes: model calls, image compression and
//! usage reporting.
//!
//! Vendor wire formats live behind [`ModelCaller`]; the engine only sees the
//! query it sent and the raw payload it got back.

pub mod error;
pub mod types;
pub mod usage;

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{CallRecord, CallStatus, MemoryUsageSink, NoopUsageSink, TracingUsageSink, UsageSink};

/// Asynchronous model-call capability.
///
/// Implementations own transport, authentication and timeouts. They return
/// the query actually sent together with the unparsed provider payload; the
/// pipeline extracts outputs with [`crate::extract::extract_responses`].
#[async_trait::async_trait]
pub trait ModelCaller: Send + Sync {
    async fn call(&self, req: ModelCall) -> Result<ModelReply, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
#[error("image compression failed: {0}")]
pub struct CompressError(pub String);

/// Recompresses a base64-encoded image, returning base64 again.
///
/// Compression is an optimisation: the pipeline keeps the original image when
/// this fails.
#[async_trait::async_trait]
pub trait ImageCompressor: Send + Sync {
    async fn compress(&self, base64_image: &str) -> Result<String, CompressError>;
}
