//! Query pipeline: expands a template, consults the response cache, and
//! dispatches the remaining work through the rate limiter.
//!
//! Flow for one run:
//! 1. Every permutation is paired with every chat history to form a unit.
//! 2. Units already answered `n` times in the cache are yielded as-is.
//!    Others issue one call for the shortfall.
//! 3. Calls complete out of order; each completion is merged into the
//!    cache entry for its identity, persisted, then yielded.
//!
//! A failing call yields a [`QueryResult::Error`] and the run continues.
//! Cancellation ends the stream with [`PipelineError::Cancelled`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, FuturesUnordered};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cache::{CacheMap, ResponseCache};
use crate::extract::{extract_responses, ExtractionError};
use crate::gateway::{
    CallRecord, ChatHistoryInfo, ImageCompressor, Message, ModelCall, ModelCaller, ModelReply,
    ModelSpec, NoopUsageSink, ProviderError, UsageSink,
};
use crate::permutation::{PromptPermutationGenerator, VarBindings};
use crate::rate_limit::{Cancelled, RateLimiter};
use crate::response::{
    merge_response_objs, settings_from_vars, ImageOutput, LlmOutput, QueryResult, ResponseError,
    ResponseObject,
};
use crate::template::{PromptTemplate, TemplateError};

/// Polled cancellation predicate.
pub type CancelCheck = dyn Fn() -> bool + Send + Sync;

// =============================================================================
// Configuration and requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Recompress image outputs through the injected compressor.
    pub compress_images: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compress_images: true,
        }
    }
}

impl PipelineConfig {
    /// Reads `PROMPTGRID_COMPRESS_IMAGES` (`0`, `false`, `no` or `off`
    /// disable compression).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("PROMPTGRID_COMPRESS_IMAGES") {
            config.compress_images = !matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }
        config
    }
}

/// One run: bindings to expand, the model to query and how many generations
/// each (prompt, chat history) identity should end up with.
#[derive(Debug, Clone)]
pub struct GenRequest {
    pub vars: VarBindings,
    pub model: ModelSpec,
    pub n: u32,
    /// Used unless the merged params carry a `temperature`.
    pub temperature: f32,
    pub llm_params: Map<String, Value>,
    /// `None` (or an empty list) queries each prompt without history.
    pub chat_histories: Option<Vec<ChatHistoryInfo>>,
}

impl GenRequest {
    pub fn new(model: ModelSpec, vars: VarBindings, n: u32) -> Self {
        Self {
            vars,
            model,
            n,
            temperature: 1.0,
            llm_params: Map::new(),
            chat_histories: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn llm_params(mut self, params: Map<String, Value>) -> Self {
        self.llm_params = params;
        self
    }

    pub fn chat_histories(mut self, histories: Vec<ChatHistoryInfo>) -> Self {
        self.chat_histories = Some(histories);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("run cancelled")]
    Cancelled,
    #[error("prompt {prompt:?} is not concrete; unresolved {unresolved:?}")]
    NonConcretePrompt {
        prompt: String,
        unresolved: Vec<String>,
    },
}

impl From<Cancelled> for PipelineError {
    fn from(_: Cancelled) -> Self {
        PipelineError::Cancelled
    }
}

/// Why an issued call produced no response object.
#[derive(Debug, thiserror::Error)]
enum CallFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl CallFailure {
    fn code(&self) -> &'static str {
        match self {
            CallFailure::Provider(e) => e.code(),
            CallFailure::Extraction(_) => "extraction",
        }
    }

    fn request_id(&self) -> Option<&str> {
        match self {
            CallFailure::Provider(e) => e.request_id(),
            CallFailure::Extraction(_) => None,
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct PromptPipeline {
    generator: PromptPermutationGenerator,
    caller: Arc<dyn ModelCaller>,
    rate_limiter: Arc<RateLimiter>,
    cache: Option<ResponseCache>,
    compressor: Option<Arc<dyn ImageCompressor>>,
    usage: Arc<dyn UsageSink>,
    config: PipelineConfig,
}

impl PromptPipeline {
    pub fn new(template: &str, caller: Arc<dyn ModelCaller>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            generator: PromptPermutationGenerator::new(template),
            caller,
            rate_limiter,
            cache: None,
            compressor: None,
            usage: Arc::new(NoopUsageSink),
            config: PipelineConfig::default(),
        }
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn ImageCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn template(&self) -> &PromptTemplate {
        self.generator.template()
    }

    /// Stream one result per (prompt, chat history) identity, in completion
    /// order. Cached answers come first.
    ///
    /// Scheduling happens up front; no call is issued until the stream is
    /// polled. Dropping the stream drops every in-flight call.
    pub fn gen_responses<'a>(
        &'a self,
        req: GenRequest,
        should_cancel: &'a CancelCheck,
    ) -> BoxStream<'a, Result<QueryResult, PipelineError>> {
        let run_id = Uuid::new_v4();
        let cache_map = self.cache.as_ref().map(ResponseCache::load).unwrap_or_default();
        tracing::debug!(
            run_id = %run_id,
            model = %req.model.key,
            n = req.n,
            cached_prompts = cache_map.prompts().count(),
            "starting run"
        );

        let mut state = RunState {
            pending: FuturesUnordered::new(),
            ready: VecDeque::new(),
            cache_map,
            cache: self.cache.clone(),
            done: false,
        };
        if let Err(e) = self.schedule(&req, run_id, should_cancel, &mut state) {
            state.pending.clear();
            state.ready.clear();
            state.ready.push_back(Err(e));
        }

        stream::unfold(state, move |mut state| async move {
            if state.done {
                return None;
            }
            if should_cancel() {
                state.finish();
                return Some((Err(PipelineError::Cancelled), state));
            }
            if let Some(item) = state.ready.pop_front() {
                if item.is_err() {
                    state.finish();
                }
                return Some((item, state));
            }

            let item = match state.pending.next().await? {
                Step::Completed(obj) => Ok(QueryResult::Response(state.persist(obj))),
                Step::Failed(err) => Ok(QueryResult::Error(err)),
                Step::Cancelled => {
                    state.finish();
                    Err(PipelineError::Cancelled)
                }
            };
            Some((item, state))
        })
        .boxed()
    }

    /// Drive a run to completion, collecting every result.
    pub async fn collect_responses(
        &self,
        req: GenRequest,
        should_cancel: &CancelCheck,
    ) -> Result<Vec<QueryResult>, PipelineError> {
        let mut out = Vec::new();
        let mut results = self.gen_responses(req, should_cancel);
        while let Some(item) = results.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    fn schedule<'a>(
        &'a self,
        req: &GenRequest,
        run_id: Uuid,
        should_cancel: &'a CancelCheck,
        state: &mut RunState<'a>,
    ) -> Result<(), PipelineError> {
        let no_history = [ChatHistoryInfo::default()];
        let histories: &[ChatHistoryInfo] = match req.chat_histories.as_deref() {
            Some(list) if !list.is_empty() => list,
            _ => &no_history,
        };
        let histories_given = matches!(req.chat_histories.as_deref(), Some(list) if !list.is_empty());

        let mut seen: HashSet<(String, Vec<Message>, BTreeMap<String, String>)> = HashSet::new();

        for template in self.generator.generate(&req.vars) {
            for history in histories {
                let vars = overlay(&history.fill_history, template.fill_history());
                let metavars = overlay(&history.metavars, template.metavars());
                let filled = template.fill_special_vars(&vars, &metavars);
                let prompt = filled.render().map_err(|e| match e {
                    TemplateError::Unresolved(unresolved) => PipelineError::NonConcretePrompt {
                        prompt: filled.to_string(),
                        unresolved,
                    },
                })?;

                let chat_history = histories_given.then(|| history.messages.clone());
                let settings = settings_from_vars(&vars);
                let identity = (prompt.clone(), history.messages.clone(), settings.clone());
                if !seen.insert(identity) {
                    continue;
                }

                let cached = state
                    .cache_map
                    .find(&prompt, &req.model.key, chat_history.as_deref(), &settings)
                    .cloned();
                let have = cached.as_ref().map_or(0, |c| c.responses.len());
                let owed = req.n.saturating_sub(u32::try_from(have).unwrap_or(u32::MAX));

                if owed == 0 {
                    if let Some(mut hit) = cached {
                        hit.responses.truncate(req.n as usize);
                        tracing::debug!(prompt = %prompt, "cache hit");
                        state.ready.push_back(Ok(QueryResult::Response(hit)));
                    }
                    continue;
                }

                let unit = Unit {
                    prompt,
                    vars,
                    metavars,
                    chat_history,
                    settings,
                    owed,
                };
                state.pending.push(self.issue(req, unit, run_id, should_cancel));
            }
        }
        Ok(())
    }

    fn issue<'a>(
        &'a self,
        req: &GenRequest,
        unit: Unit,
        run_id: Uuid,
        should_cancel: &'a CancelCheck,
    ) -> BoxFuture<'a, Step> {
        let params = effective_params(&req.model.params, &req.llm_params, &unit.settings);
        let temperature = params
            .get("temperature")
            .and_then(Value::as_f64)
            .map(|t| t as f32)
            .unwrap_or(req.temperature);
        let call = ModelCall::new(req.model.clone(), unit.prompt.clone(), unit.owed)
            .temperature(temperature)
            .params(params)
            .chat_history(unit.chat_history.clone());
        let model = req.model.clone();
        let owed = unit.owed;

        async move {
            let perform = || async {
                let start = Instant::now();
                let result = self
                    .caller
                    .call(call)
                    .await
                    .map_err(CallFailure::from)
                    .and_then(|reply| {
                        let outputs = extract_responses(&reply.raw_response, &model.provider)?;
                        Ok((reply, outputs))
                    });
                let latency_ms = start.elapsed().as_millis() as u64;
                self.usage
                    .record(call_record(&model, run_id, owed, latency_ms, &result))
                    .await;
                result
            };

            let outcome = self.rate_limiter.throttle(&model.key, should_cancel, perform).await;
            match outcome {
                Err(Cancelled) => Step::Cancelled,
                Ok(Ok((reply, outputs))) => {
                    Step::Completed(self.build_response(&model, unit, reply, outputs).await)
                }
                Ok(Err(e)) => {
                    tracing::warn!(model = %model.key, prompt = %unit.prompt, error = %e, "query failed");
                    Step::Failed(ResponseError {
                        message: e.to_string(),
                        prompt: unit.prompt,
                        llm: model.key.clone(),
                        vars: unit.vars,
                        metavars: unit.metavars,
                    })
                }
            }
        }
        .boxed()
    }

    async fn build_response(
        &self,
        model: &ModelSpec,
        unit: Unit,
        reply: ModelReply,
        mut outputs: Vec<LlmOutput>,
    ) -> ResponseObject {
        if outputs.len() > unit.owed as usize {
            tracing::warn!(
                model = %model.key,
                requested = unit.owed,
                received = outputs.len(),
                "provider returned extra generations; truncating"
            );
            outputs.truncate(unit.owed as usize);
        } else if outputs.len() < unit.owed as usize {
            tracing::warn!(
                model = %model.key,
                requested = unit.owed,
                received = outputs.len(),
                "provider returned fewer generations than requested; a later run asks for the rest"
            );
        }

        let has_images = outputs.iter().any(LlmOutput::is_image);
        if has_images && self.config.compress_images {
            if let Some(compressor) = &self.compressor {
                for output in outputs.iter_mut() {
                    if let LlmOutput::Image(image) = output {
                        match compressor.compress(&image.data).await {
                            Ok(data) => *image = ImageOutput::new(data),
                            Err(e) => tracing::warn!(error = %e, "keeping uncompressed image"),
                        }
                    }
                }
            }
        }

        ResponseObject {
            uid: Uuid::new_v4().to_string(),
            prompt: unit.prompt,
            query: reply.query,
            responses: outputs,
            raw_response: (!has_images).then_some(reply.raw_response),
            llm: model.key.clone(),
            vars: unit.vars,
            metavars: unit.metavars,
            chat_history: unit.chat_history,
        }
    }
}

// =============================================================================
// Run state
// =============================================================================

/// One (prompt, chat history) identity that still owes generations.
struct Unit {
    prompt: String,
    vars: BTreeMap<String, String>,
    metavars: BTreeMap<String, String>,
    chat_history: Option<Vec<Message>>,
    settings: BTreeMap<String, String>,
    owed: u32,
}

enum Step {
    Completed(ResponseObject),
    Failed(ResponseError),
    Cancelled,
}

struct RunState<'a> {
    pending: FuturesUnordered<BoxFuture<'a, Step>>,
    ready: VecDeque<Result<QueryResult, PipelineError>>,
    cache_map: CacheMap,
    cache: Option<ResponseCache>,
    done: bool,
}

impl RunState<'_> {
    fn finish(&mut self) {
        self.done = true;
        self.pending.clear();
        self.ready.clear();
    }

    /// Merge a completed call into its cache entry and flush the map.
    fn persist(&mut self, fresh: ResponseObject) -> ResponseObject {
        let settings = fresh.settings_vars();
        let mut merged = match self
            .cache_map
            .find(&fresh.prompt, &fresh.llm, fresh.chat_history.as_deref(), &settings)
        {
            Some(older) => merge_response_objs(older.clone(), fresh),
            None => fresh,
        };
        if merged.responses.iter().any(LlmOutput::is_image) {
            merged.raw_response = None;
        }

        self.cache_map.upsert(merged.clone());
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(&self.cache_map) {
                tracing::warn!(error = %e, prompt = %merged.prompt, "failed to persist response cache");
            }
        }
        merged
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn overlay(base: &BTreeMap<String, String>, top: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = base.clone();
    out.extend(top.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

/// Model defaults, then request params, then settings variables. Settings
/// values are parsed as JSON when they parse (`"0.5"` becomes a number) and
/// kept as strings otherwise.
fn effective_params(
    model_params: &Map<String, Value>,
    llm_params: &Map<String, Value>,
    settings: &BTreeMap<String, String>,
) -> Map<String, Value> {
    let mut params = model_params.clone();
    params.extend(llm_params.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (name, raw) in settings {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        params.insert(name.clone(), value);
    }
    params
}

fn call_record(
    model: &ModelSpec,
    run_id: Uuid,
    requested: u32,
    latency_ms: u64,
    result: &Result<(ModelReply, Vec<LlmOutput>), CallFailure>,
) -> CallRecord {
    let record = CallRecord::new(model.provider.to_string(), &model.key, &model.model)
        .run(run_id)
        .latency(latency_ms);
    match result {
        Ok((_, outputs)) => record.generations(requested, outputs.len() as u32),
        Err(e) => record
            .generations(requested, 0)
            .error(e.code())
            .request_id(e.request_id()),
    }
}
