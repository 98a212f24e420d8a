//! Provider-specific extraction of generations from raw payloads.
//!
//! Every routine either returns one output per generation found in the
//! payload or fails with the provider name and a rendering of the shape it
//! could not read. An empty list is never a successful extraction.

use serde_json::Value;

use crate::gateway::Provider;
use crate::response::{ImageOutput, LlmOutput};

/// Longest payload rendering kept in an [`ExtractionError`].
const MAX_SHAPE_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized {provider} response shape: {shape}")]
pub struct ExtractionError {
    pub provider: String,
    pub shape: String,
}

impl ExtractionError {
    fn new(provider: &Provider, raw: &Value) -> Self {
        Self {
            provider: provider.to_string(),
            shape: render_shape(raw),
        }
    }
}

/// Extract the ordered outputs of `raw`, as returned by `provider`.
///
/// A list payload is read as one response per element (several calls
/// merged), except for providers whose native shape is a list.
pub fn extract_responses(raw: &Value, provider: &Provider) -> Result<Vec<LlmOutput>, ExtractionError> {
    let outputs = match provider {
        Provider::OpenAI | Provider::AzureOpenAI | Provider::Together | Provider::DeepSeek => {
            each_element(raw, openai_outputs)
        }
        Provider::Anthropic => each_element(raw, anthropic_outputs),
        Provider::Google => each_element(raw, google_outputs),
        Provider::HuggingFace => huggingface_outputs(raw),
        Provider::Ollama => each_element(raw, ollama_outputs),
        Provider::OpenAIImage => each_element(raw, image_outputs),
        Provider::Custom(_) => custom_outputs(raw),
    };

    match outputs {
        Some(outputs) if !outputs.is_empty() => Ok(outputs),
        _ => Err(ExtractionError::new(provider, raw)),
    }
}

fn each_element(raw: &Value, f: fn(&Value) -> Option<Vec<LlmOutput>>) -> Option<Vec<LlmOutput>> {
    match raw {
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(f(item)?);
            }
            Some(out)
        }
        other => f(other),
    }
}

/// Chat completions (`choices[].message.content`) or legacy completions
/// (`choices[].text`).
fn openai_outputs(raw: &Value) -> Option<Vec<LlmOutput>> {
    let choices = raw.get("choices")?.as_array()?;
    choices
        .iter()
        .map(|choice| {
            if let Some(message) = choice.get("message") {
                return message_text(message).map(LlmOutput::Text);
            }
            choice.get("text")?.as_str().map(|t| LlmOutput::Text(t.to_string()))
        })
        .collect()
}

/// Message content, falling back to tool-call arguments when the content is
/// empty (structured output through function calling).
fn message_text(message: &Value) -> Option<String> {
    let content = message.get("content").and_then(Value::as_str).unwrap_or("");
    if !content.is_empty() {
        return Some(content.to_string());
    }
    let args: Vec<&str> = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| c.pointer("/function/arguments").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if !args.is_empty() {
        return Some(args.join("\n"));
    }
    message.get("content")?.as_str().map(str::to_string)
}

/// Messages API (`content[]` text blocks) or legacy `completion`.
fn anthropic_outputs(raw: &Value) -> Option<Vec<LlmOutput>> {
    if let Some(completion) = raw.get("completion").and_then(Value::as_str) {
        return Some(vec![LlmOutput::Text(completion.to_string())]);
    }
    let blocks = raw.get("content")?.as_array()?;
    let text: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        return None;
    }
    Some(vec![LlmOutput::Text(text.concat())])
}

/// Gemini (`candidates[].content.parts[].text`) or PaLM (`candidates[].output`
/// / `candidates[].content`).
fn google_outputs(raw: &Value) -> Option<Vec<LlmOutput>> {
    let candidates = raw.get("candidates")?.as_array()?;
    candidates
        .iter()
        .map(|c| {
            if let Some(output) = c.get("output").and_then(Value::as_str) {
                return Some(LlmOutput::Text(output.to_string()));
            }
            match c.get("content")? {
                Value::String(s) => Some(LlmOutput::Text(s.clone())),
                content => {
                    let parts = content.get("parts")?.as_array()?;
                    let text: Vec<&str> = parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect();
                    (!text.is_empty()).then(|| LlmOutput::Text(text.concat()))
                }
            }
        })
        .collect()
}

/// Inference API: `[{generated_text}]` or a single `{generated_text}`.
fn huggingface_outputs(raw: &Value) -> Option<Vec<LlmOutput>> {
    let one = |v: &Value| {
        v.get("generated_text")
            .and_then(Value::as_str)
            .map(|t| LlmOutput::Text(t.to_string()))
    };
    match raw {
        Value::Array(items) => items.iter().map(one).collect(),
        other => one(other).map(|o| vec![o]),
    }
}

/// Generate (`response`) or chat (`message.content`) endpoints.
fn ollama_outputs(raw: &Value) -> Option<Vec<LlmOutput>> {
    if let Some(text) = raw.get("response").and_then(Value::as_str) {
        return Some(vec![LlmOutput::Text(text.to_string())]);
    }
    raw.pointer("/message/content")
        .and_then(Value::as_str)
        .map(|t| vec![LlmOutput::Text(t.to_string())])
}

/// Image generation: `data[].b64_json`.
fn image_outputs(raw: &Value) -> Option<Vec<LlmOutput>> {
    let data = raw.get("data")?.as_array()?;
    data.iter()
        .map(|d| {
            d.get("b64_json")
                .and_then(Value::as_str)
                .map(|b64| LlmOutput::Image(ImageOutput::new(b64)))
        })
        .collect()
}

/// Custom providers hand back outputs directly: a string, an image object,
/// or a list of those.
fn custom_outputs(raw: &Value) -> Option<Vec<LlmOutput>> {
    let one = |v: &Value| -> Option<LlmOutput> {
        match v {
            Value::String(s) => Some(LlmOutput::Text(s.clone())),
            Value::Object(_) => serde_json::from_value::<ImageOutput>(v.clone())
                .ok()
                .map(LlmOutput::Image),
            _ => None,
        }
    };
    match raw {
        Value::Array(items) => items.iter().map(one).collect(),
        other => one(other).map(|o| vec![o]),
    }
}

fn render_shape(raw: &Value) -> String {
    let rendered = raw.to_string();
    if rendered.chars().count() <= MAX_SHAPE_CHARS {
        return rendered;
    }
    let mut short: String = rendered.chars().take(MAX_SHAPE_CHARS).collect();
    short.push('…');
    short
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn texts(outputs: Vec<LlmOutput>) -> Vec<String> {
        outputs
            .into_iter()
            .map(|o| o.as_text().unwrap_or("<img>").to_string())
            .collect()
    }

    #[test]
    fn openai_chat_and_completion_shapes() {
        let chat = json!({"choices": [
            {"message": {"role": "assistant", "content": "one"}},
            {"message": {"role": "assistant", "content": "two"}}
        ]});
        assert_eq!(
            texts(extract_responses(&chat, &Provider::OpenAI).unwrap()),
            vec!["one", "two"]
        );

        let completion = json!({"choices": [{"text": "legacy"}]});
        assert_eq!(
            texts(extract_responses(&completion, &Provider::AzureOpenAI).unwrap()),
            vec!["legacy"]
        );
    }

    #[test]
    fn openai_falls_back_to_tool_call_arguments() {
        let raw = json!({"choices": [{"message": {
            "content": null,
            "tool_calls": [{"function": {"arguments": "{\"a\":1}"}}]
        }}]});
        assert_eq!(
            texts(extract_responses(&raw, &Provider::OpenAI).unwrap()),
            vec![r#"{"a":1}"#]
        );
    }

    #[test]
    fn anthropic_messages_legacy_and_lists() {
        let messages = json!({"content": [
            {"type": "text", "text": "Hel"},
            {"type": "tool_use", "id": "x"},
            {"type": "text", "text": "lo"}
        ]});
        assert_eq!(
            texts(extract_responses(&messages, &Provider::Anthropic).unwrap()),
            vec!["Hello"]
        );

        let many = json!([{"completion": "a"}, {"content": [{"type": "text", "text": "b"}]}]);
        assert_eq!(
            texts(extract_responses(&many, &Provider::Anthropic).unwrap()),
            vec!["a", "b"]
        );
    }

    #[test]
    fn google_gemini_and_palm_shapes() {
        let gemini = json!({"candidates": [
            {"content": {"parts": [{"text": "g1"}]}},
            {"content": {"parts": [{"text": "g"}, {"text": "2"}]}}
        ]});
        assert_eq!(
            texts(extract_responses(&gemini, &Provider::Google).unwrap()),
            vec!["g1", "g2"]
        );

        let palm = json!({"candidates": [{"output": "p1"}, {"content": "p2"}]});
        assert_eq!(
            texts(extract_responses(&palm, &Provider::Google).unwrap()),
            vec!["p1", "p2"]
        );
    }

    #[test]
    fn huggingface_and_ollama_shapes() {
        let hf = json!([{"generated_text": "h1"}, {"generated_text": "h2"}]);
        assert_eq!(
            texts(extract_responses(&hf, &Provider::HuggingFace).unwrap()),
            vec!["h1", "h2"]
        );

        let ollama = json!([{"response": "o1"}, {"message": {"content": "o2"}}]);
        assert_eq!(
            texts(extract_responses(&ollama, &Provider::Ollama).unwrap()),
            vec!["o1", "o2"]
        );
    }

    #[test]
    fn image_payloads_become_image_outputs() {
        let raw = json!({"data": [{"b64_json": "AAAA"}, {"b64_json": "BBBB"}]});
        let outputs = extract_responses(&raw, &Provider::OpenAIImage).unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(LlmOutput::is_image));
    }

    #[test]
    fn custom_accepts_strings_and_image_objects() {
        let raw = json!(["a", {"t": "img", "d": "CCCC"}]);
        let outputs = extract_responses(&raw, &Provider::Custom("mine".into())).unwrap();
        assert_eq!(outputs[0], LlmOutput::from("a"));
        assert_eq!(outputs[1], LlmOutput::Image(ImageOutput::new("CCCC")));
    }

    #[test]
    fn unknown_shapes_fail_with_provider_attribution() {
        let raw = json!({"unexpected": true});
        let err = extract_responses(&raw, &Provider::Anthropic).unwrap_err();
        assert_eq!(err.provider, "anthropic");
        assert!(err.shape.contains("unexpected"));
        assert!(err.to_string().starts_with("unrecognized anthropic response shape"));

        let empty = json!({"choices": []});
        assert!(extract_responses(&empty, &Provider::OpenAI).is_err());

        let partial = json!({"choices": [{"message": {"content": "ok"}}, {"nope": 1}]});
        assert!(extract_responses(&partial, &Provider::OpenAI).is_err());
    }

    #[test]
    fn long_shapes_are_truncated() {
        let raw = json!({"blob": "x".repeat(1000)});
        let err = extract_responses(&raw, &Provider::Google).unwrap_err();
        assert!(err.shape.chars().count() <= MAX_SHAPE_CHARS + 1);
        assert!(err.shape.ends_with('…'));
    }
}
