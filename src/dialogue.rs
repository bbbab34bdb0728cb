use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

/// Role-tagged history of one session. Append-only.
#[derive(Debug, Clone, Default)]
pub struct Dialogue {
    system_prompt: String,
    messages: Vec<Message>,
}

impl Dialogue {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
        }
    }

    pub fn put(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages for the next LLM call: the system prompt, with any recalled
    /// memory and tool context folded in, followed by the history.
    pub fn llm_messages(&self, memory: &[String], context: Option<&str>) -> Vec<Message> {
        let mut system = self.system_prompt.clone();
        if !memory.is_empty() {
            system.push_str("\n\nRelevant memories:\n");
            for snippet in memory {
                system.push_str("- ");
                system.push_str(snippet);
                system.push('\n');
            }
        }
        if let Some(context) = context {
            system.push_str("\n\nTool result:\n");
            system.push_str(context);
        }
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if !system.trim().is_empty() {
            messages.push(Message::system(system));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_messages_fold_memory_into_system_prompt() {
        let mut dialogue = Dialogue::new("You are a helpful speaker.");
        dialogue.put(Message::user("hi"));
        dialogue.put(Message::assistant("hello!"));
        dialogue.put(Message::user("remember my cat?"));

        let messages = dialogue.llm_messages(&["cat is named Tom".to_string()], None);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("- cat is named Tom"));
        assert_eq!(messages[3], Message::user("remember my cat?"));
    }

    #[test]
    fn test_empty_system_prompt_is_omitted() {
        let mut dialogue = Dialogue::new("");
        dialogue.put(Message::user("hi"));
        let messages = dialogue.llm_messages(&[], None);
        assert_eq!(messages, vec![Message::user("hi")]);

        let messages = dialogue.llm_messages(&[], Some("sunny, 21C"));
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.ends_with("sunny, 21C"));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Message::assistant("x")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"x"}"#);
    }
}
