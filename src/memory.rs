use crate::dialogue::{Message, Role};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

#[derive(Debug, Clone, Serialize, Hash, Eq, PartialEq)]
pub enum MemoryType {
    #[serde(rename = "nomem")]
    NoMemory,
    #[serde(rename = "local")]
    Local,
    Other(String),
}

impl Default for MemoryType {
    fn default() -> Self {
        Self::NoMemory
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::NoMemory => write!(f, "nomem"),
            MemoryType::Local => write!(f, "local"),
            MemoryType::Other(provider) => write!(f, "{}", provider),
        }
    }
}

impl<'de> Deserialize<'de> for MemoryType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "nomem" => Ok(MemoryType::NoMemory),
            "local" => Ok(MemoryType::Local),
            _ => Ok(MemoryType::Other(value)),
        }
    }
}

/// Recall of earlier conversation snippets for prompt enrichment.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn query(&self, device_id: &str, text: &str, top_k: usize) -> Result<Vec<String>>;

    async fn save(&self, device_id: &str, messages: &[Message]) -> Result<()>;
}

/// Keeps user utterances in process, keyed by device, ranked by word overlap.
#[derive(Default)]
pub struct LocalMemory {
    entries: Mutex<HashMap<String, Vec<String>>>,
    capacity: usize,
}

fn tokens(text: &str) -> HashSet<String> {
    let lowered = text.to_lowercase();
    let mut set: HashSet<String> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1)
        .map(|w| w.to_string())
        .collect();
    // CJK text has no spaces; fall back to single characters.
    set.extend(
        lowered
            .chars()
            .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
            .map(|c| c.to_string()),
    );
    set
}

impl LocalMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn create() -> Result<Arc<dyn MemoryProvider>> {
        Ok(Arc::new(Self::new(256)))
    }
}

#[async_trait]
impl MemoryProvider for LocalMemory {
    async fn query(&self, device_id: &str, text: &str, top_k: usize) -> Result<Vec<String>> {
        let query = tokens(text);
        if query.is_empty() {
            return Ok(vec![]);
        }
        let entries = self.entries.lock();
        let Some(snippets) = entries.get(device_id) else {
            return Ok(vec![]);
        };
        let mut scored: Vec<(usize, usize, &String)> = snippets
            .iter()
            .enumerate()
            .map(|(idx, s)| (tokens(s).intersection(&query).count(), idx, s))
            .filter(|(score, _, _)| *score > 0)
            .collect();
        // Highest overlap first, newest first on ties.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, _, s)| s.clone())
            .collect())
    }

    async fn save(&self, device_id: &str, messages: &[Message]) -> Result<()> {
        let mut entries = self.entries.lock();
        let snippets = entries.entry(device_id.to_string()).or_default();
        for message in messages.iter().filter(|m| m.role == Role::User) {
            if !message.content.trim().is_empty() {
                snippets.push(message.content.clone());
            }
        }
        if snippets.len() > self.capacity {
            let excess = snippets.len() - self.capacity;
            snippets.drain(..excess);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_ranks_by_overlap() {
        let memory = LocalMemory::new(10);
        memory
            .save(
                "dev",
                &[
                    Message::user("my cat is called Tom"),
                    Message::assistant("nice cat"),
                    Message::user("I live in Berlin"),
                    Message::user("Tom the cat likes fish"),
                ],
            )
            .await
            .unwrap();
        let hits = memory.query("dev", "what does my cat Tom eat", 2).await.unwrap();
        assert_eq!(
            hits,
            vec!["my cat is called Tom".to_string(), "Tom the cat likes fish".to_string()]
        );
        assert!(memory.query("other", "cat", 3).await.unwrap().is_empty());
        assert!(memory.query("dev", "?", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let memory = LocalMemory::new(2);
        for text in ["alpha one", "beta two", "gamma three"] {
            memory.save("dev", &[Message::user(text)]).await.unwrap();
        }
        assert!(memory.query("dev", "alpha", 5).await.unwrap().is_empty());
        assert_eq!(memory.query("dev", "gamma", 5).await.unwrap().len(), 1);
    }
}
