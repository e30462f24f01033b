// src/context/mod.rs
// Builds a token-budgeted message list from system prompt + recalled
// semantic context + recent conversation (spec.md §4.4). Never mutates the
// underlying store; produces a fresh list per request.

use crate::config::ContextConfig;
use crate::llm::types::ChatMessage;
use async_trait::async_trait;

/// Consumed interface (spec.md §6): conversation append + semantic recall.
/// Concrete persistence drivers are out of scope; this crate only depends on
/// the trait.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn append_conversation(
        &self,
        user_id: &str,
        role: &str,
        content: &str,
        channel: &str,
        model: Option<&str>,
        tokens: Option<u32>,
    ) -> anyhow::Result<()>;

    async fn recent_conversations(&self, user_id: &str, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;

    /// Semantic search; ordered by relevance.
    async fn recall(&self, query: &str, user_id: &str, n: usize) -> anyhow::Result<Vec<String>>;
}

const NO_PRIOR_CONTEXT: &str = "No prior context.";

pub struct ContextAssembler<'a> {
    config: &'a ContextConfig,
    system_prompt_template: String,
    assistant_name: String,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(config: &'a ContextConfig, system_prompt_template: impl Into<String>, assistant_name: impl Into<String>) -> Self {
        Self {
            config,
            system_prompt_template: system_prompt_template.into(),
            assistant_name: assistant_name.into(),
        }
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        text.len() / self.config.chars_per_token.max(1)
    }

    fn render_system_prompt(&self, user_name: &str, recalled: &[String]) -> String {
        let relevant = if recalled.is_empty() {
            NO_PRIOR_CONTEXT.to_string()
        } else {
            recalled.join("\n")
        };
        self.system_prompt_template
            .replace("{assistant_name}", &self.assistant_name)
            .replace("{user_name}", user_name)
            + "\n\nRelevant context:\n"
            + &relevant
    }

    /// Drops oldest history messages until the remaining messages' combined
    /// estimated tokens fit within `history_budget` (spec.md §4.4 step 3).
    fn truncate_history(&self, mut history: Vec<ChatMessage>, history_budget: usize) -> Vec<ChatMessage> {
        loop {
            let total: usize = history.iter().map(|m| self.estimate_tokens(&m.content)).sum();
            if total <= history_budget || history.is_empty() {
                return history;
            }
            history.remove(0);
        }
    }

    /// Builds the message list for `(user_id, current_user_message)`.
    pub async fn assemble(
        &self,
        store: &dyn MemoryStore,
        user_id: &str,
        user_name: &str,
        current_user_message: &str,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let recalled = store
            .recall(current_user_message, user_id, self.config.recall_snippets)
            .await?;
        let system_prompt = self.render_system_prompt(user_name, &recalled);

        let history = store.recent_conversations(user_id, self.config.recent_turns).await?;

        let system_tokens = self.estimate_tokens(&system_prompt);
        let history_budget = ((self.config.max_tokens.saturating_sub(system_tokens)) as f64
            * self.config.history_share)
            .round() as usize;
        let history = self.truncate_history(history, history_budget);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(history);
        messages.push(ChatMessage::user(current_user_message));
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStore {
        history: Vec<ChatMessage>,
        recall_results: Vec<String>,
    }

    #[async_trait]
    impl MemoryStore for FakeStore {
        async fn append_conversation(
            &self,
            _user_id: &str,
            _role: &str,
            _content: &str,
            _channel: &str,
            _model: Option<&str>,
            _tokens: Option<u32>,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn recent_conversations(&self, _user_id: &str, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
            Ok(self.history.iter().rev().take(limit).rev().cloned().collect())
        }

        async fn recall(&self, _query: &str, _user_id: &str, n: usize) -> anyhow::Result<Vec<String>> {
            Ok(self.recall_results.iter().take(n).cloned().collect())
        }
    }

    fn config() -> ContextConfig {
        ContextConfig {
            max_tokens: 1000,
            history_share: 0.5,
            chars_per_token: 4,
            recall_snippets: 3,
            recent_turns: 10,
        }
    }

    #[tokio::test]
    async fn no_recall_results_uses_literal_placeholder() {
        let cfg = config();
        let assembler = ContextAssembler::new(&cfg, "Hi {user_name}, I am {assistant_name}.", "Mira");
        let store = FakeStore { history: vec![], recall_results: vec![] };
        let messages = assembler.assemble(&store, "u1", "Alex", "hello").await.unwrap();
        assert!(messages[0].content.contains("No prior context."));
        assert!(messages[0].content.contains("Hi Alex"));
        assert!(messages[0].content.contains("I am Mira"));
    }

    #[tokio::test]
    async fn current_message_is_appended_last() {
        let cfg = config();
        let assembler = ContextAssembler::new(&cfg, "sys", "Mira");
        let store = FakeStore { history: vec![], recall_results: vec![] };
        let messages = assembler.assemble(&store, "u1", "Alex", "current message").await.unwrap();
        assert_eq!(messages.last().unwrap().content, "current message");
    }

    #[tokio::test]
    async fn history_is_truncated_to_fit_budget() {
        let mut cfg = config();
        cfg.max_tokens = 20;
        cfg.history_share = 0.5;
        let long_history = vec![
            ChatMessage::user("a".repeat(100)),
            ChatMessage::assistant("b".repeat(100)),
        ];
        let assembler = ContextAssembler::new(&cfg, "sys", "Mira");
        let store = FakeStore { history: long_history, recall_results: vec![] };
        let messages = assembler.assemble(&store, "u1", "Alex", "hi").await.unwrap();
        // system + current user message only; history dropped entirely.
        assert_eq!(messages.len(), 2);
    }
}
