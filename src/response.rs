//! Response objects: the unit of cached and returned work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::Message;
use crate::template::SETTINGS_PREFIX;

/// Image payload as stored in a response: `{"t": "img", "d": <base64>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageOutput {
    #[serde(rename = "t")]
    pub kind: String,
    #[serde(rename = "d")]
    pub data: String,
}

impl ImageOutput {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            kind: "img".to_string(),
            data: data.into(),
        }
    }
}

/// One generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LlmOutput {
    Text(String),
    Image(ImageOutput),
}

impl LlmOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            LlmOutput::Text(t) => Some(t),
            LlmOutput::Image(_) => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, LlmOutput::Image(_))
    }
}

impl From<&str> for LlmOutput {
    fn from(s: &str) -> Self {
        LlmOutput::Text(s.to_string())
    }
}

/// Cached/returned result for one (prompt, chat history, settings) identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseObject {
    /// Missing ids in stored data are healed on load.
    #[serde(default)]
    pub uid: String,
    pub prompt: String,
    /// The query actually sent to the provider.
    #[serde(default)]
    pub query: Value,
    pub responses: Vec<LlmOutput>,
    /// Raw provider payload(s); dropped when responses contain images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
    /// Model key that produced the responses.
    pub llm: String,
    /// Fill history that produced the prompt (settings vars keep their `=`).
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub metavars: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<Vec<Message>>,
}

impl ResponseObject {
    /// Settings variables, keyed without the `=` prefix.
    pub fn settings_vars(&self) -> BTreeMap<String, String> {
        settings_from_vars(&self.vars)
    }

    /// Whether this object answers the same logical request: same model key,
    /// equal chat history content and equal settings variables. A missing
    /// history and an empty one are the same request.
    pub fn matches(
        &self,
        llm: &str,
        chat_history: Option<&[Message]>,
        settings_vars: &BTreeMap<String, String>,
    ) -> bool {
        let ours = self.chat_history.as_deref().unwrap_or_default();
        let theirs = chat_history.unwrap_or_default();
        self.llm == llm && ours == theirs && &self.settings_vars() == settings_vars
    }

    pub fn text_responses(&self) -> impl Iterator<Item = &str> {
        self.responses.iter().filter_map(LlmOutput::as_text)
    }
}

pub(crate) fn settings_from_vars(vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    vars.iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(SETTINGS_PREFIX)
                .map(|name| (name.to_string(), v.clone()))
        })
        .collect()
}

/// Merge an older (cached) response object with a newer one.
///
/// `responses` and `raw_response` are concatenated, older first; each raw
/// payload is treated as a one-element list unless it already is a list.
/// Every other field comes from `newer`, which carries the current
/// provenance.
pub fn merge_response_objs(older: ResponseObject, newer: ResponseObject) -> ResponseObject {
    let mut responses = older.responses;
    responses.extend(newer.responses);

    let mut raw = raw_as_list(older.raw_response);
    raw.extend(raw_as_list(newer.raw_response));
    let raw_response = if raw.is_empty() {
        None
    } else {
        Some(Value::Array(raw))
    };

    ResponseObject {
        responses,
        raw_response,
        ..newer
    }
}

fn raw_as_list(raw: Option<Value>) -> Vec<Value> {
    match raw {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(other) => vec![other],
    }
}

/// A failed call, reported in place of a response object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub message: String,
    pub prompt: String,
    pub llm: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub metavars: BTreeMap<String, String>,
}

/// One item yielded by a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Response(ResponseObject),
    Error(ResponseError),
}

impl QueryResult {
    pub fn is_error(&self) -> bool {
        matches!(self, QueryResult::Error(_))
    }

    pub fn response(&self) -> Option<&ResponseObject> {
        match self {
            QueryResult::Response(r) => Some(r),
            QueryResult::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ResponseError> {
        match self {
            QueryResult::Response(_) => None,
            QueryResult::Error(e) => Some(e),
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            QueryResult::Response(r) => &r.prompt,
            QueryResult::Error(e) => &e.prompt,
        }
    }
}
