//! History Manager Implementation
//!
//! Bounded conversation buffer with token accounting. Appends trigger
//! automatic truncation once the token or message budget is exceeded, so
//! the history handed to the next request always fits the context window.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// One conversation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Token estimation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenEstimator {
    /// ceil(length / 4), the classic rough cut
    Simple,
    /// Per-word buckets, noticeably closer on natural language
    Advanced,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::Simple
    }
}

impl TokenEstimator {
    /// Estimate the token count of a piece of content.
    pub fn estimate(&self, content: &str) -> u32 {
        match self {
            TokenEstimator::Simple => {
                let chars = content.chars().count() as u32;
                chars.div_ceil(4)
            }
            TokenEstimator::Advanced => content
                .split_whitespace()
                .map(|word| {
                    let len = word.chars().count() as u32;
                    if len <= 3 {
                        1
                    } else if len <= 6 {
                        len.div_ceil(3)
                    } else {
                        len.div_ceil(4)
                    }
                })
                .sum(),
        }
    }
}

/// Which messages go first when the budget is exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TruncationStrategy {
    /// Remove oldest messages first
    Oldest,
    /// Remove from the middle, keeping the head and tail of the conversation
    Middle,
    /// Keep only system messages and the most recent entries
    Newest,
}

impl Default for TruncationStrategy {
    fn default() -> Self {
        Self::Oldest
    }
}

/// Configuration for history management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Token budget for the whole history
    pub max_tokens: u32,

    /// Message-count budget for the whole history
    pub max_messages: usize,

    /// Never remove system messages during truncation
    pub preserve_system_messages: bool,

    /// Newest entries shielded from truncation
    pub preserve_recent_messages: usize,

    pub truncation_strategy: TruncationStrategy,

    pub token_estimator: TokenEstimator,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            max_messages: 50,
            preserve_system_messages: true,
            preserve_recent_messages: 5,
            truncation_strategy: TruncationStrategy::default(),
            token_estimator: TokenEstimator::default(),
        }
    }
}

/// Token totals broken down by role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCount {
    pub total: u32,
    /// Tokens in user messages
    pub input: u32,
    /// Tokens in assistant messages
    pub output: u32,
    /// Tokens in system messages
    pub system: u32,
}

/// What a truncation pass removed
#[derive(Debug, Clone, Default)]
pub struct TruncationResult {
    pub removed_messages: usize,
    pub tokens_removed: u32,
    pub messages_before: usize,
    pub messages_after: usize,
    pub tokens_before: u32,
    pub tokens_after: u32,
}

/// Statistics for history operations
#[derive(Debug, Clone, Default)]
pub struct HistoryStats {
    pub appended_messages: u64,
    pub removed_messages: u64,
    pub truncations: u64,
    pub current_messages: usize,
    pub current_tokens: u32,
}

#[derive(Debug, Default)]
struct HistoryInner {
    messages: Vec<Message>,
    appended: u64,
    removed: u64,
    truncations: u64,
}

/// Bounded conversation history
///
/// All mutation happens under one mutex, so concurrent appends from
/// in-flight calls are linearizable.
#[derive(Debug)]
pub struct HistoryManager {
    config: HistoryConfig,
    inner: Mutex<HistoryInner>,
}

impl HistoryManager {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HistoryInner::default()),
        }
    }

    /// Append a message, truncating automatically when a budget is exceeded.
    pub fn add_message(&self, message: Message) -> Option<TruncationResult> {
        let mut inner = self.inner.lock();
        debug!(role = %message.role, "Appending message to history");
        inner.messages.push(message);
        inner.appended += 1;

        let total = self.count_tokens_in(&inner.messages).total;
        if total > self.config.max_tokens || inner.messages.len() > self.config.max_messages {
            Some(self.truncate_locked(&mut inner, self.config.max_tokens))
        } else {
            None
        }
    }

    /// Truncate down to `target_tokens` (the configured budget when absent).
    pub fn truncate(&self, target_tokens: Option<u32>) -> TruncationResult {
        let mut inner = self.inner.lock();
        let target = target_tokens.unwrap_or(self.config.max_tokens);
        self.truncate_locked(&mut inner, target)
    }

    /// Current token totals by role
    pub fn count_total_tokens(&self) -> TokenCount {
        let inner = self.inner.lock();
        self.count_tokens_in(&inner.messages)
    }

    /// Snapshot of the current messages
    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }

    /// Drop every message, keeping cumulative statistics
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.messages.len();
        inner.messages.clear();
        inner.removed += dropped as u64;
        debug!(dropped, "History cleared");
    }

    /// Get a statistics snapshot
    pub fn stats(&self) -> HistoryStats {
        let inner = self.inner.lock();
        HistoryStats {
            appended_messages: inner.appended,
            removed_messages: inner.removed,
            truncations: inner.truncations,
            current_messages: inner.messages.len(),
            current_tokens: self.count_tokens_in(&inner.messages).total,
        }
    }

    /// Get configuration
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    fn count_tokens_in(&self, messages: &[Message]) -> TokenCount {
        let mut count = TokenCount::default();
        for message in messages {
            let tokens = self.config.token_estimator.estimate(&message.content);
            count.total += tokens;
            match message.role {
                MessageRole::User => count.input += tokens,
                MessageRole::Assistant => count.output += tokens,
                MessageRole::System => count.system += tokens,
            }
        }
        count
    }

    fn over_budget(&self, messages: &[Message], target_tokens: u32) -> bool {
        self.count_tokens_in(messages).total > target_tokens
            || messages.len() > self.config.max_messages
    }

    fn truncate_locked(&self, inner: &mut HistoryInner, target_tokens: u32) -> TruncationResult {
        let tokens_before = self.count_tokens_in(&inner.messages).total;
        let messages_before = inner.messages.len();

        match self.config.truncation_strategy {
            TruncationStrategy::Oldest => self.truncate_oldest(inner, target_tokens),
            TruncationStrategy::Middle => self.truncate_middle(inner, target_tokens),
            TruncationStrategy::Newest => self.truncate_newest(inner),
        }

        let tokens_after = self.count_tokens_in(&inner.messages).total;
        let messages_after = inner.messages.len();
        let removed = messages_before - messages_after;
        inner.removed += removed as u64;

        let result = TruncationResult {
            removed_messages: removed,
            tokens_removed: tokens_before.saturating_sub(tokens_after),
            messages_before,
            messages_after,
            tokens_before,
            tokens_after,
        };

        if removed > 0 {
            inner.truncations += 1;
            info!(
                strategy = ?self.config.truncation_strategy,
                removed_messages = removed,
                tokens_before,
                tokens_after,
                "History truncated"
            );
        }
        result
    }

    fn truncate_oldest(&self, inner: &mut HistoryInner, target_tokens: u32) {
        loop {
            if !self.over_budget(&inner.messages, target_tokens) {
                break;
            }
            let len = inner.messages.len();
            let recent_start = len.saturating_sub(self.config.preserve_recent_messages);
            let removable = (0..recent_start).find(|&i| {
                !(self.config.preserve_system_messages
                    && inner.messages[i].role == MessageRole::System)
            });
            match removable {
                Some(i) => {
                    inner.messages.remove(i);
                }
                None => break,
            }
        }
    }

    fn truncate_middle(&self, inner: &mut HistoryInner, target_tokens: u32) {
        let system_count = if self.config.preserve_system_messages {
            inner
                .messages
                .iter()
                .filter(|m| m.role == MessageRole::System)
                .count()
        } else {
            0
        };
        let edge = self.config.preserve_recent_messages.max(system_count);

        loop {
            if !self.over_budget(&inner.messages, target_tokens) {
                break;
            }
            let len = inner.messages.len();
            if len <= edge * 2 {
                break;
            }
            let mid = len / 2;
            let candidate = (edge..len - edge)
                .filter(|&i| {
                    !(self.config.preserve_system_messages
                        && inner.messages[i].role == MessageRole::System)
                })
                .min_by_key(|&i| i.abs_diff(mid));
            match candidate {
                Some(i) => {
                    inner.messages.remove(i);
                }
                None => break,
            }
        }
    }

    fn truncate_newest(&self, inner: &mut HistoryInner) {
        let len = inner.messages.len();
        let mut keep = vec![false; len];
        let mut kept_recent = 0;
        for i in (0..len).rev() {
            let message = &inner.messages[i];
            if self.config.preserve_system_messages && message.role == MessageRole::System {
                keep[i] = true;
            } else if kept_recent < self.config.preserve_recent_messages {
                keep[i] = true;
                kept_recent += 1;
            }
        }
        let mut i = 0;
        inner.messages.retain(|_| {
            let kept = keep[i];
            i += 1;
            kept
        });
    }
}
