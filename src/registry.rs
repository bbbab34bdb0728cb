//! Explicit registry of intent handlers, built at startup and shared by sessions.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Speak `response` directly.
    Response,
    /// Hand `result` to the LLM as context.
    ReqLlm,
    None,
    NotFound,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionResponse {
    pub action: Action,
    pub result: Option<String>,
    pub response: Option<String>,
}

impl ActionResponse {
    pub fn response(text: impl Into<String>) -> Self {
        Self {
            action: Action::Response,
            result: None,
            response: Some(text.into()),
        }
    }

    pub fn req_llm(result: impl Into<String>) -> Self {
        Self {
            action: Action::ReqLlm,
            result: Some(result.into()),
            response: None,
        }
    }

    pub fn not_found(name: &str) -> Self {
        Self {
            action: Action::NotFound,
            result: Some(format!("no handler named {}", name)),
            response: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            action: Action::Error,
            result: Some(message.into()),
            response: None,
        }
    }
}

#[async_trait]
pub trait FunctionHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, session_id: &str, arguments: &HashMap<String, String>) -> ActionResponse;
}

/// Handler configured from a text template. `{key}` is replaced by the argument
/// of that name and `{key|fallback}` falls back when the argument is missing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplateFunction {
    pub name: String,
    pub action: Action,
    pub template: String,
}

impl TemplateFunction {
    pub fn new(name: &str, action: Action, template: &str) -> Self {
        Self {
            name: name.to_string(),
            action,
            template: template.to_string(),
        }
    }

    pub fn render(&self, arguments: &HashMap<String, String>) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let Some(len) = rest[start..].find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let placeholder = &rest[start + 1..start + len];
            let (key, fallback) = placeholder.split_once('|').unwrap_or((placeholder, ""));
            match arguments.get(key.trim()).filter(|v| !v.is_empty()) {
                Some(value) => out.push_str(value),
                None => out.push_str(fallback),
            }
            rest = &rest[start + len + 1..];
        }
        out.push_str(rest);
        out
    }
}

#[async_trait]
impl FunctionHandler for TemplateFunction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, _session_id: &str, arguments: &HashMap<String, String>) -> ActionResponse {
        let text = self.render(arguments);
        match self.action {
            Action::Response => ActionResponse::response(text),
            Action::ReqLlm => ActionResponse::req_llm(text),
            action => ActionResponse {
                action,
                result: Some(text),
                response: None,
            },
        }
    }
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Arc<dyn FunctionHandler>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock handlers for `play_music`, `weather` and `device_control`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TemplateFunction::new(
            "play_music",
            Action::Response,
            "Now playing {song|some music}.",
        )));
        registry.register(Arc::new(TemplateFunction::new(
            "weather",
            Action::ReqLlm,
            "The user asked about the weather in {location|their area}. No live weather feed is connected; say so briefly.",
        )));
        registry.register(Arc::new(TemplateFunction::new(
            "device_control",
            Action::Response,
            "OK, turning {action|on} the {device|device}.",
        )));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn FunctionHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn call(
        &self,
        session_id: &str,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> ActionResponse {
        match self.handlers.get(name) {
            Some(handler) => {
                debug!(session_id, "calling function {} {:?}", name, arguments);
                handler.call(session_id, arguments).await
            }
            None => ActionResponse::not_found(name),
        }
    }
}
