//! Prompt templates with `{name}` placeholders.
//!
//! Three placeholder kinds are recognised:
//! - `{name}`: content variable, replaced by [`PromptTemplate::fill`]
//! - `{=name}`: settings variable; its value configures the model call and
//!   is never rendered into the prompt text
//! - `{#name}`: reference to a metavariable or an upstream fill-history
//!   entry, resolved by [`PromptTemplate::fill_special_vars`]
//!
//! `\{`, `\}` and `\\` are escapes for literal characters.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix of settings-variable names in bindings and fill histories.
pub const SETTINGS_PREFIX: char = '=';
/// Prefix of special (metavariable) references.
pub const SPECIAL_PREFIX: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("template has unresolved placeholders: {}", .0.join(", "))]
    Unresolved(Vec<String>),
}

// =============================================================================
// Values
// =============================================================================

/// A value bound to a template variable, with optional provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVarInfo {
    pub text: String,
    /// Variables that produced this value upstream.
    #[serde(default)]
    pub fill_history: BTreeMap<String, String>,
    /// Side metadata carried with the value; never substituted.
    #[serde(default)]
    pub metavars: BTreeMap<String, String>,
    /// Values of different variables sharing an id belong together (e.g. one
    /// row of a table) and are never crossed with each other.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associate_id: Option<String>,
}

impl TemplateVarInfo {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fill_history: BTreeMap::new(),
            metavars: BTreeMap::new(),
            associate_id: None,
        }
    }

    pub fn with_fill_history(mut self, fill_history: BTreeMap<String, String>) -> Self {
        self.fill_history = fill_history;
        self
    }

    pub fn with_metavar(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metavars.insert(key.into(), value.into());
        self
    }

    pub fn with_associate_id(mut self, id: impl Into<String>) -> Self {
        self.associate_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    Text(String),
    Info(TemplateVarInfo),
}

impl TemplateValue {
    pub fn text(&self) -> &str {
        match self {
            TemplateValue::Text(t) => t,
            TemplateValue::Info(info) => &info.text,
        }
    }

    pub fn info(&self) -> Option<&TemplateVarInfo> {
        match self {
            TemplateValue::Text(_) => None,
            TemplateValue::Info(info) => Some(info),
        }
    }

    pub fn associate_id(&self) -> Option<&str> {
        self.info().and_then(|i| i.associate_id.as_deref())
    }
}

impl From<&str> for TemplateValue {
    fn from(s: &str) -> Self {
        TemplateValue::Text(s.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(s: String) -> Self {
        TemplateValue::Text(s)
    }
}

impl From<TemplateVarInfo> for TemplateValue {
    fn from(info: TemplateVarInfo) -> Self {
        TemplateValue::Info(info)
    }
}

// =============================================================================
// Template
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var(String),
    Setting(String),
    Special(String),
}

impl Segment {
    fn source_form(&self) -> Option<String> {
        match self {
            Segment::Text(_) => None,
            Segment::Var(name) => Some(format!("{{{name}}}")),
            Segment::Setting(name) => Some(format!("{{{SETTINGS_PREFIX}{name}}}")),
            Segment::Special(name) => Some(format!("{{{SPECIAL_PREFIX}{name}}}")),
        }
    }
}

/// A parsed prompt template plus the provenance of the values filled so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
    fill_history: BTreeMap<String, String>,
    metavars: BTreeMap<String, String>,
}

impl PromptTemplate {
    pub fn new(template: &str) -> Self {
        Self {
            segments: parse(template),
            fill_history: BTreeMap::new(),
            metavars: BTreeMap::new(),
        }
    }

    /// Which value of each variable produced this template. Settings
    /// variables appear with their `=` prefix.
    pub fn fill_history(&self) -> &BTreeMap<String, String> {
        &self.fill_history
    }

    pub fn metavars(&self) -> &BTreeMap<String, String> {
        &self.metavars
    }

    /// Unresolved content placeholders, in order of first appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        self.names_of(|s| match s {
            Segment::Var(n) => Some(n.as_str()),
            _ => None,
        })
    }

    /// Unresolved settings placeholders (without the `=` prefix).
    pub fn settings_placeholders(&self) -> Vec<&str> {
        self.names_of(|s| match s {
            Segment::Setting(n) => Some(n.as_str()),
            _ => None,
        })
    }

    /// Unresolved special placeholders (without the `#` prefix).
    pub fn special_placeholders(&self) -> Vec<&str> {
        self.names_of(|s| match s {
            Segment::Special(n) => Some(n.as_str()),
            _ => None,
        })
    }

    fn names_of<'a>(&'a self, pick: impl Fn(&'a Segment) -> Option<&'a str>) -> Vec<&'a str> {
        let mut out: Vec<&str> = Vec::new();
        for name in self.segments.iter().filter_map(pick) {
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }

    pub fn is_concrete(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Text(_)))
    }

    /// Settings variables recorded during fills, keyed without the prefix.
    pub fn settings_vars(&self) -> BTreeMap<String, String> {
        self.fill_history
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(SETTINGS_PREFIX)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect()
    }

    /// Substitute every bound placeholder.
    ///
    /// Content placeholders become literal text. Settings placeholders are
    /// removed from the text. Unbound placeholders stay in place. Bound
    /// settings variables are recorded even when the text never mentions
    /// them, since they configure the call rather than the prompt.
    pub fn fill(&self, bindings: &BTreeMap<String, TemplateValue>) -> PromptTemplate {
        let mut fill_history = self.fill_history.clone();
        let mut metavars = self.metavars.clone();
        let mut upstream: Vec<&TemplateVarInfo> = Vec::new();
        let mut segments = Vec::with_capacity(self.segments.len());

        for segment in &self.segments {
            match segment {
                Segment::Var(name) => match bindings.get(name) {
                    Some(value) => {
                        fill_history.insert(name.clone(), value.text().to_string());
                        upstream.extend(value.info());
                        segments.push(Segment::Text(value.text().to_string()));
                    }
                    None => segments.push(segment.clone()),
                },
                Segment::Setting(name) => {
                    if !bindings.contains_key(&settings_key(name)) {
                        segments.push(segment.clone());
                    }
                }
                other => segments.push(other.clone()),
            }
        }

        for (key, value) in bindings {
            if key.starts_with(SETTINGS_PREFIX) {
                fill_history.insert(key.clone(), value.text().to_string());
                upstream.extend(value.info());
            }
        }

        // Direct choices win over provenance inherited from upstream values.
        for info in upstream {
            for (k, v) in &info.fill_history {
                fill_history.entry(k.clone()).or_insert_with(|| v.clone());
            }
            for (k, v) in &info.metavars {
                metavars.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        PromptTemplate {
            segments: merge_text(segments),
            fill_history,
            metavars,
        }
    }

    /// Resolve `{#name}` references, looking first in `metavars`, then in
    /// `fill_history`, then in this template's own metavars and history.
    pub fn fill_special_vars(
        &self,
        fill_history: &BTreeMap<String, String>,
        metavars: &BTreeMap<String, String>,
    ) -> PromptTemplate {
        let segments = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Special(name) => metavars
                    .get(name)
                    .or_else(|| fill_history.get(name))
                    .or_else(|| self.metavars.get(name))
                    .or_else(|| self.fill_history.get(name))
                    .map(|v| Segment::Text(v.clone()))
                    .unwrap_or_else(|| segment.clone()),
                other => other.clone(),
            })
            .collect();

        PromptTemplate {
            segments: merge_text(segments),
            fill_history: self.fill_history.clone(),
            metavars: self.metavars.clone(),
        }
    }

    /// Render the concrete prompt text.
    pub fn render(&self) -> Result<String, TemplateError> {
        let unresolved: Vec<String> = self
            .segments
            .iter()
            .filter_map(Segment::source_form)
            .collect();
        if !unresolved.is_empty() {
            return Err(TemplateError::Unresolved(unresolved));
        }

        Ok(self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Text(t) => t.as_str(),
                _ => "",
            })
            .collect())
    }
}

/// Source form: literal text re-escaped, open placeholders kept.
impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => {
                    for c in text.chars() {
                        if matches!(c, '\\' | '{' | '}') {
                            f.write_str("\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                }
                other => {
                    if let Some(source) = other.source_form() {
                        f.write_str(&source)?;
                    }
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn settings_key(name: &str) -> String {
    format!("{SETTINGS_PREFIX}{name}")
}

fn parse(template: &str) -> Vec<Segment> {
    let chars: Vec<char> = template.chars().collect();
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() && matches!(chars[i + 1], '\\' | '{' | '}') => {
                text.push(chars[i + 1]);
                i += 2;
            }
            '{' => match placeholder_end(&chars, i + 1) {
                Some(end) => {
                    let name: String = chars[i + 1..end].iter().collect();
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(classify(name));
                    i = end + 1;
                }
                None => {
                    text.push('{');
                    i += 1;
                }
            },
            c => {
                text.push(c);
                i += 1;
            }
        }
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    segments
}

/// Index of the `}` closing a placeholder opened just before `start`, if the
/// enclosed name is non-empty and contains no braces or escapes.
fn placeholder_end(chars: &[char], start: usize) -> Option<usize> {
    for (offset, c) in chars[start..].iter().enumerate() {
        match c {
            '}' if offset > 0 => return Some(start + offset),
            '}' | '{' | '\\' => return None,
            _ => {}
        }
    }
    None
}

fn classify(name: String) -> Segment {
    if let Some(rest) = name.strip_prefix(SETTINGS_PREFIX) {
        if !rest.is_empty() {
            return Segment::Setting(rest.to_string());
        }
    }
    if let Some(rest) = name.strip_prefix(SPECIAL_PREFIX) {
        if !rest.is_empty() {
            return Segment::Special(rest.to_string());
        }
    }
    Segment::Var(name)
}

fn merge_text(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if let Segment::Text(next) = &segment {
            if next.is_empty() {
                continue;
            }
            if let Some(Segment::Text(prev)) = out.last_mut() {
                prev.push_str(next);
                continue;
            }
        }
        out.push(segment);
    }
    out
}
