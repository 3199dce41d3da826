//! Chat validation and rate limiting on the dispatcher.
//!
//! Every `CHAT` a client sends passes [`ChatLimiter::validate_chat`] before
//! the dispatcher forwards it, either to everyone or only to the listed
//! recipients.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

/// Dispatcher-side chat rules.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Longest message, counted in characters.
    pub max_chars: usize,
    /// Messages one user may send inside `window_secs`.
    pub burst: usize,
    /// Game seconds a sent message counts against `burst`.
    pub window_secs: f64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_chars: 500,
            burst: 5,
            window_secs: 10.0,
        }
    }
}

/// Reason a chat message was not forwarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatRejection {
    #[error("message longer than {0} characters")]
    TooLong(usize),
    #[error("message is blank")]
    Blank,
    #[error("sender is over the chat rate")]
    RateLimited,
}

/// Game times of each user's recent messages.
#[derive(Debug, Default)]
pub struct ChatLimiter {
    config: ChatConfig,
    recent: FxHashMap<String, VecDeque<f64>>,
}

impl ChatLimiter {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            recent: FxHashMap::default(),
        }
    }

    /// Check `text` from `user` sent at game time `now`. An accepted message
    /// counts against the user's budget; a rejected one does not.
    pub fn validate_chat(&mut self, user: &str, text: &str, now: f64) -> Result<(), ChatRejection> {
        let max = self.config.max_chars;
        if text.chars().count() > max {
            return Err(ChatRejection::TooLong(max));
        }
        if text.trim().is_empty() {
            return Err(ChatRejection::Blank);
        }

        let window = self.config.window_secs;
        let sent = self.recent.entry(user.to_owned()).or_default();
        while let Some(&oldest) = sent.front()
            && now - oldest > window
        {
            sent.pop_front();
        }
        if sent.len() >= self.config.burst {
            return Err(ChatRejection::RateLimited);
        }
        sent.push_back(now);
        Ok(())
    }

    /// Drop the history of a departed user.
    pub fn forget(&mut self, user: &str) {
        self.recent.remove(user);
    }
}
