//! Usage tracking via the UsageSink trait.
//!
//! The pipeline reports every model call it issues through a UsageSink. This
//! decouples the engine from any specific storage backend:
//! - Hosts persist records wherever they keep billing data
//! - Library users can log them with TracingUsageSink
//! - Tests use NoopUsageSink or MemoryUsageSink

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of one model call issued by the pipeline.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Provider name: "openai", "anthropic", etc.
    pub provider: String,
    /// Model configuration key.
    pub model_key: String,
    /// Provider-side model id.
    pub model: String,
    /// Run this call belongs to.
    pub run_id: Option<Uuid>,
    /// Generations asked for.
    pub generations_requested: u32,
    /// Generations extracted from the reply (0 on error).
    pub generations_received: u32,
    /// Latency in milliseconds, rate-limit waits excluded.
    pub latency_ms: u64,
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Provider request ID (for debugging).
    pub request_id: Option<String>,
    /// When the call finished.
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    /// Create a new record with required fields, defaulting others.
    pub fn new(
        provider: impl Into<String>,
        model_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model_key: model_key.into(),
            model: model.into(),
            run_id: None,
            generations_requested: 0,
            generations_received: 0,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn generations(mut self, requested: u32, received: u32) -> Self {
        self.generations_requested = requested;
        self.generations_received = received;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }

    pub fn request_id(mut self, id: Option<&str>) -> Self {
        self.request_id = id.map(str::to_string);
        self
    }
}

/// Trait for recording model call usage.
///
/// Implement this trait to customize where usage data is stored.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a model call. This should be fire-and-forget:
    /// failures should be logged but not propagated.
    async fn record(&self, record: CallRecord);
}

/// No-op usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: CallRecord) {
        // Discard
    }
}

/// Usage sink that emits one `tracing` event per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: CallRecord) {
        tracing::info!(
            provider = %record.provider,
            model = %record.model,
            model_key = %record.model_key,
            requested = record.generations_requested,
            received = record.generations_received,
            latency_ms = record.latency_ms,
            status = record.status.as_str(),
            error_code = record.error_code.as_deref().unwrap_or(""),
            "model call"
        );
    }
}

/// Usage sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<CallRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records collected so far.
    pub fn records(&self) -> Vec<CallRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: CallRecord) {
        match self.records.lock() {
            Ok(mut guard) => guard.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}
