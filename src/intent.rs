use anyhow::{Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Hash, Eq, PartialEq)]
pub enum IntentType {
    #[serde(rename = "nointent")]
    NoIntent,
    #[serde(rename = "keyword")]
    Keyword,
    Other(String),
}

impl Default for IntentType {
    fn default() -> Self {
        Self::Keyword
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentType::NoIntent => write!(f, "nointent"),
            IntentType::Keyword => write!(f, "keyword"),
            IntentType::Other(provider) => write!(f, "{}", provider),
        }
    }
}

impl<'de> Deserialize<'de> for IntentType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "nointent" => Ok(IntentType::NoIntent),
            "keyword" => Ok(IntentType::Keyword),
            _ => Ok(IntentType::Other(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Exit,
    ContinueChat,
    /// Dispatch to the function registry.
    Call {
        name: String,
        arguments: HashMap<String, String>,
    },
    None,
}

/// One keyword rule. `pattern`, when set, is a regex whose named groups become
/// call arguments.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IntentRule {
    pub intent: String,
    pub keywords: Vec<String>,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IntentOption {
    pub rules: Vec<IntentRule>,
}

#[async_trait]
pub trait IntentRecognizer: Send + Sync {
    async fn recognize(&self, session_id: &str, text: &str) -> Result<Intent>;
}

/// Always falls through to chat, except for exit phrases.
pub struct NoIntent {
    exit_commands: Vec<String>,
}

impl NoIntent {
    pub fn new(exit_commands: &[String]) -> Self {
        Self {
            exit_commands: exit_commands.iter().map(|c| normalize(c)).collect(),
        }
    }

    pub fn create(
        _option: &IntentOption,
        exit_commands: &[String],
    ) -> Result<Arc<dyn IntentRecognizer>> {
        Ok(Arc::new(Self::new(exit_commands)))
    }
}

#[async_trait]
impl IntentRecognizer for NoIntent {
    async fn recognize(&self, _session_id: &str, text: &str) -> Result<Intent> {
        if is_exit(&self.exit_commands, text) {
            return Ok(Intent::Exit);
        }
        Ok(Intent::None)
    }
}

struct CompiledRule {
    intent: String,
    keywords: Vec<String>,
    pattern: Option<Regex>,
}

pub struct KeywordIntent {
    exit_commands: Vec<String>,
    rules: Vec<CompiledRule>,
}

fn default_rules() -> Vec<IntentRule> {
    let rule = |intent: &str, keywords: &[&str], pattern: Option<&str>| IntentRule {
        intent: intent.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        pattern: pattern.map(|p| p.to_string()),
    };
    vec![
        rule(
            "play_music",
            &["play music", "play some music", "play a song", "播放音乐", "放首歌"],
            Some(r"(?i)play (?:the song )?(?P<song>[\w' ]+?)(?: by .*)?$"),
        ),
        rule(
            "weather",
            &["weather", "天气"],
            Some(r"(?i)weather (?:in|for) (?P<location>[\w ]+)"),
        ),
        rule(
            "device_control",
            &["turn on", "turn off", "switch on", "switch off", "打开", "关闭"],
            Some(r"(?i)(?:turn|switch) (?P<action>on|off) (?:the )?(?P<device>[\w ]+)"),
        ),
        rule("continue_chat", &["go on", "continue", "继续"], None),
    ]
}

/// Lowercase and drop punctuation so "Goodbye!" matches "goodbye".
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `exit_commands` must already be normalized.
pub fn is_exit(exit_commands: &[String], text: &str) -> bool {
    let text = normalize(text);
    !text.is_empty() && exit_commands.iter().any(|c| !c.is_empty() && *c == text)
}

impl KeywordIntent {
    pub fn new(option: &IntentOption, exit_commands: &[String]) -> Result<Self> {
        let rules = if option.rules.is_empty() {
            default_rules()
        } else {
            option.rules.clone()
        };
        let rules = rules
            .into_iter()
            .map(|rule| {
                let pattern = match &rule.pattern {
                    Some(p) => Some(
                        Regex::new(p)
                            .map_err(|e| anyhow!("invalid pattern for {}: {}", rule.intent, e))?,
                    ),
                    None => None,
                };
                Ok(CompiledRule {
                    intent: rule.intent,
                    keywords: rule.keywords.iter().map(|k| normalize(k)).collect(),
                    pattern,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            exit_commands: exit_commands.iter().map(|c| normalize(c)).collect(),
            rules,
        })
    }

    pub fn create(option: &IntentOption, exit_commands: &[String]) -> Result<Arc<dyn IntentRecognizer>> {
        Ok(Arc::new(Self::new(option, exit_commands)?))
    }

    fn classify(&self, text: &str) -> Intent {
        if is_exit(&self.exit_commands, text) {
            return Intent::Exit;
        }
        let normalized = normalize(text);
        for rule in &self.rules {
            if !rule.keywords.iter().any(|k| normalized.contains(k.as_str())) {
                continue;
            }
            if rule.intent == "continue_chat" {
                return Intent::ContinueChat;
            }
            if rule.intent == "exit" {
                return Intent::Exit;
            }
            let mut arguments = HashMap::new();
            if let Some(captures) = rule.pattern.as_ref().and_then(|p| p.captures(text.trim())) {
                for name in rule.pattern.iter().flat_map(|p| p.capture_names()).flatten() {
                    if let Some(value) = captures.name(name) {
                        arguments.insert(name.to_string(), value.as_str().trim().to_string());
                    }
                }
            }
            return Intent::Call {
                name: rule.intent.clone(),
                arguments,
            };
        }
        Intent::None
    }
}

#[async_trait]
impl IntentRecognizer for KeywordIntent {
    async fn recognize(&self, session_id: &str, text: &str) -> Result<Intent> {
        let intent = self.classify(text);
        debug!(session_id, "intent for {:?}: {:?}", text, intent);
        Ok(intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exits() -> Vec<String> {
        vec!["goodbye".to_string(), "退出".to_string()]
    }

    #[test]
    fn test_exit_phrases_match_whole_utterance() {
        let intent = KeywordIntent::new(&IntentOption::default(), &exits()).unwrap();
        assert_eq!(intent.classify("Goodbye!"), Intent::Exit);
        assert_eq!(intent.classify("退出。"), Intent::Exit);
        assert_eq!(intent.classify("say goodbye to my cat"), Intent::None);
    }

    #[test]
    fn test_default_rules_extract_arguments() {
        let intent = KeywordIntent::new(&IntentOption::default(), &exits()).unwrap();
        match intent.classify("Turn off the kitchen light") {
            Intent::Call { name, arguments } => {
                assert_eq!(name, "device_control");
                assert_eq!(arguments["action"], "off");
                assert_eq!(arguments["device"], "kitchen light");
            }
            other => panic!("unexpected {:?}", other),
        }
        match intent.classify("what's the weather in Paris") {
            Intent::Call { name, arguments } => {
                assert_eq!(name, "weather");
                assert_eq!(arguments["location"], "Paris");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(intent.classify("please go on"), Intent::ContinueChat);
        assert_eq!(intent.classify("tell me a joke"), Intent::None);
    }

    #[test]
    fn test_custom_rules_replace_defaults() {
        let option = IntentOption {
            rules: vec![IntentRule {
                intent: "timer".to_string(),
                keywords: vec!["timer".to_string()],
                pattern: Some(r"(?P<minutes>\d+) minute".to_string()),
            }],
        };
        let intent = KeywordIntent::new(&option, &[]).unwrap();
        assert_eq!(intent.classify("what's the weather"), Intent::None);
        match intent.classify("set a timer for 5 minutes") {
            Intent::Call { name, arguments } => {
                assert_eq!(name, "timer");
                assert_eq!(arguments["minutes"], "5");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_pattern_is_an_error() {
        let option = IntentOption {
            rules: vec![IntentRule {
                intent: "x".to_string(),
                keywords: vec!["x".to_string()],
                pattern: Some("(".to_string()),
            }],
        };
        assert!(KeywordIntent::new(&option, &[]).is_err());
    }

    #[tokio::test]
    async fn test_no_intent_only_exits() {
        let intent = NoIntent::new(&exits());
        assert_eq!(intent.recognize("s", "goodbye").await.unwrap(), Intent::Exit);
        assert_eq!(intent.recognize("s", "play music").await.unwrap(), Intent::None);
    }
}
