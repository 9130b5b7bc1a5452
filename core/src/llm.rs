//! LLM collaborator abstraction.
//!
//! The core never talks to a concrete model provider. Everything that needs
//! generated text (persona execution, group discussions, consensus checks)
//! goes through the [`LlmBackend`] trait, and the provider implementation is
//! supplied by the embedding application. [`CannedBackend`] is the
//! deterministic stand-in used by tests and dry runs.

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;

use crate::errors::LlmResult;

/// Options forwarded to a backend for a single generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub model: Option<String>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

/// A stream of generated text fragments.
pub type TextStream = Pin<Box<dyn Stream<Item = LlmResult<String>> + Send>>;

/// The minimal seam to an external text generator.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Identifier of this backend, used in logs and work messages.
    fn name(&self) -> &str;

    /// Generate streamed text for the given prompt.
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> LlmResult<TextStream>;

    /// Generate and collect the full response into a single string.
    async fn generate_text(&self, prompt: &str, options: &GenerationOptions) -> LlmResult<String> {
        let mut stream = self.generate(prompt, options).await?;
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

/// Deterministic backend for tests and offline dry runs.
///
/// Responses are resolved in priority order: an explicitly queued response,
/// then the first substring rule matching the prompt, then a fixed default.
/// Output is chunked to exercise the streaming path.
pub struct CannedBackend {
    name: String,
    rules: Vec<(String, String)>,
    queue: Mutex<VecDeque<String>>,
    default_response: String,
}

impl CannedBackend {
    pub fn new() -> Self {
        Self {
            name: "canned".to_string(),
            rules: Vec::new(),
            queue: Mutex::new(VecDeque::new()),
            default_response: "Acknowledged.".to_string(),
        }
    }

    /// Respond with `response` whenever the prompt contains `needle`
    /// (case-insensitive).
    pub fn with_rule(mut self, needle: &str, response: &str) -> Self {
        self.rules.push((needle.to_lowercase(), response.to_string()));
        self
    }

    /// Override the fallback response.
    pub fn with_default(mut self, response: &str) -> Self {
        self.default_response = response.to_string();
        self
    }

    /// Queue a one-shot response consumed before any rule is considered.
    pub fn push_response(&self, response: &str) {
        self.queue.lock().push_back(response.to_string());
    }

    fn resolve(&self, prompt: &str) -> String {
        if let Some(queued) = self.queue.lock().pop_front() {
            return queued;
        }
        let lower = prompt.to_lowercase();
        for (needle, response) in &self.rules {
            if lower.contains(needle) {
                return response.clone();
            }
        }
        self.default_response.clone()
    }
}

impl Default for CannedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmBackend for CannedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> LlmResult<TextStream> {
        let response = self.resolve(prompt);
        let stream = async_stream::stream! {
            // Chunk on word boundaries so consumers see multiple items.
            let mut buf = String::new();
            for word in response.split_inclusive(' ') {
                buf.push_str(word);
                if buf.len() >= 64 {
                    yield Ok(std::mem::take(&mut buf));
                }
            }
            if !buf.is_empty() {
                yield Ok(buf);
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Extract the first JSON object embedded in model output.
///
/// Handles fenced blocks (```json ... ```) and prose-wrapped objects by
/// scanning for a balanced top-level `{...}` region. Returns `None` when no
/// parseable object is present.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let candidate = match fenced_block(text) {
        Some(block) => block,
        None => text,
    };

    let start = candidate.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in candidate[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let slice = &candidate[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(slice).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}
