//! External text provider capability.
//!
//! The core never touches word-bank files itself. Whoever embeds it hands
//! in a [`TextProvider`], and the room creator consults it whenever the
//! shared text needs to be (re)generated.

use std::sync::Arc;

/// Difficulty tag passed to the provider when the core refreshes text.
pub const TEXT_DIFFICULTY: &str = "medium";

/// Number of words requested per refresh.
pub const TEXT_WORD_COUNT: usize = 20;

/// Supplies the words a race is typed from.
pub trait TextProvider: Send + Sync {
    /// Return up to `count` words for the given language and difficulty.
    /// An empty result leaves the shared text empty.
    fn words(&self, language: &str, difficulty: &str, count: usize) -> Vec<String>;
}

/// Build the shared race text the way the session expects it: provider
/// words joined by single spaces.
pub(crate) fn compose_text(provider: &Arc<dyn TextProvider>, language: &str) -> String {
    provider
        .words(language, TEXT_DIFFICULTY, TEXT_WORD_COUNT)
        .join(" ")
}

/// Fixed word bank that cycles through its words, language-agnostic.
/// Handy for demos and tests; real applications plug in their own bank.
pub struct StaticWordBank {
    words: Vec<String>,
}

impl StaticWordBank {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
        }
    }
}

impl TextProvider for StaticWordBank {
    fn words(&self, _language: &str, _difficulty: &str, count: usize) -> Vec<String> {
        if self.words.is_empty() {
            return Vec::new();
        }
        self.words.iter().cycle().take(count).cloned().collect()
    }
}
