//! Token-bounded sliding window of chat messages.

use crate::provider::{ChatMessage, ChatRole};
use crate::util::{self, TokenCounter};

pub struct ConversationContext {
    messages: Vec<ChatMessage>,
    max_tokens: usize,
    token_counter: Option<TokenCounter>,
}

impl ConversationContext {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_tokens,
            token_counter: None,
        }
    }

    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.token_counter = Some(counter);
        self
    }

    pub fn add_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn count(&self, text: &str) -> usize {
        match &self.token_counter {
            Some(counter) => counter(text),
            None => util::estimate_tokens(text),
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| self.count(&m.content_text()))
            .sum()
    }

    /// Drop the oldest non-system messages until the window fits
    /// `max_tokens` or only the system message remains. The initial system
    /// message at index 0 always survives.
    pub fn truncate(&mut self) {
        loop {
            if self.total_tokens() <= self.max_tokens {
                return;
            }
            let oldest_droppable = self
                .messages
                .iter()
                .enumerate()
                .position(|(i, m)| !(i == 0 && m.role == ChatRole::System));
            match oldest_droppable {
                Some(index) if self.messages.len() > 1 || index != 0 => {
                    self.messages.remove(index);
                    // A window reduced to the system message alone is as
                    // small as truncation goes.
                    if self.messages.len() == 1 {
                        return;
                    }
                }
                _ => return,
            }
        }
    }
}
