//! Core types shared by the pipeline and the model-call capability.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A chat history together with the provenance that produced it.
///
/// When a run is given several histories, every concrete prompt is sent once
/// per history.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatHistoryInfo {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub fill_history: BTreeMap<String, String>,
    #[serde(default)]
    pub metavars: BTreeMap<String, String>,
}

impl ChatHistoryInfo {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_fill_history(mut self, fill_history: BTreeMap<String, String>) -> Self {
        self.fill_history = fill_history;
        self
    }

    pub fn with_metavars(mut self, metavars: BTreeMap<String, String>) -> Self {
        self.metavars = metavars;
        self
    }
}

// =============================================================================
// MODEL TYPES
// =============================================================================

/// Provider family of a model. Selects the response extraction routine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Provider {
    OpenAI,
    AzureOpenAI,
    Anthropic,
    Google,
    HuggingFace,
    Ollama,
    Together,
    DeepSeek,
    /// Image generation endpoints returning base64 payloads.
    OpenAIImage,
    /// Any other provider; the payload must already be a string or a list.
    Custom(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::OpenAI => "openai",
            Provider::AzureOpenAI => "azure_openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::HuggingFace => "huggingface",
            Provider::Ollama => "ollama",
            Provider::Together => "together",
            Provider::DeepSeek => "deepseek",
            Provider::OpenAIImage => "openai_image",
            Provider::Custom(name) => name,
        }
    }

    /// Parse a provider name. Unknown names become [`Provider::Custom`].
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "azure_openai" | "azure" => Provider::AzureOpenAI,
            "anthropic" => Provider::Anthropic,
            "google" | "gemini" | "palm" => Provider::Google,
            "huggingface" | "hf" => Provider::HuggingFace,
            "ollama" | "dalai" => Provider::Ollama,
            "together" => Provider::Together,
            "deepseek" => Provider::DeepSeek,
            "openai_image" | "dalle" => Provider::OpenAIImage,
            _ => Provider::Custom(name.to_string()),
        }
    }
}

impl From<String> for Provider {
    fn from(name: String) -> Self {
        Provider::parse(&name)
    }
}

impl From<Provider> for String {
    fn from(provider: Provider) -> Self {
        provider.as_str().to_string()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The model a pipeline run targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Unique key of this model configuration. Rate limits and the `llm`
    /// field of response objects use it.
    pub key: String,
    /// Provider-side model id, e.g. "gpt-4o-mini".
    pub model: String,
    pub provider: Provider,
    /// Default call parameters for this model.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ModelSpec {
    pub fn new(provider: Provider, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            key: model.clone(),
            model,
            provider,
            params: Map::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

// =============================================================================
// CALL TYPES
// =============================================================================

/// A single request to the model-call capability.
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub model: ModelSpec,
    /// Rendered, concrete prompt text.
    pub prompt: String,
    /// Number of generations to request.
    pub n: u32,
    pub temperature: f32,
    /// Model parameters merged from the model defaults, the request and
    /// settings variables.
    pub params: Map<String, Value>,
    pub chat_history: Option<Vec<Message>>,
}

impl ModelCall {
    pub fn new(model: ModelSpec, prompt: impl Into<String>, n: u32) -> Self {
        Self {
            model,
            prompt: prompt.into(),
            n,
            temperature: 1.0,
            params: Map::new(),
            chat_history: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn chat_history(mut self, messages: Option<Vec<Message>>) -> Self {
        self.chat_history = messages;
        self
    }
}

/// What the model-call capability hands back: the query actually sent and
/// the provider's raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub query: Value,
    pub raw_response: Value,
}

impl ModelReply {
    pub fn new(query: Value, raw_response: Value) -> Self {
        Self {
            query,
            raw_response,
        }
    }
}
