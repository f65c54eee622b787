//! User dictionary matching using Aho-Corasick for multi-phrase detection
//!
//! Dictionary entries are literal spoken-phrase → replacement substitutions
//! ("ant row pic" -> "Anthropic"). The replacement itself is performed by the
//! cleanup backend; this module only detects which entries are relevant to a
//! given transcription so the rewrite instruction stays small.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use tracing::debug;

use crate::types::DictionaryEntry;

/// Compiled view of the user's dictionary with O(n) multi-phrase matching
pub struct Dictionary {
    automaton: Option<AhoCorasick>,
    entries: Vec<DictionaryEntry>,
}

impl Dictionary {
    pub fn new(entries: Vec<DictionaryEntry>) -> Self {
        let patterns: Vec<String> = entries.iter().map(|e| e.spoken.to_lowercase()).collect();

        let automaton = if patterns.is_empty() {
            None
        } else {
            AhoCorasickBuilder::new()
                .match_kind(MatchKind::LeftmostLongest)
                .build(&patterns)
                .ok()
        };

        Self { automaton, entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the text mentions any dictionary phrase
    pub fn matches(&self, text: &str) -> bool {
        let Some(ref ac) = self.automaton else {
            return false;
        };
        ac.is_match(&text.to_lowercase())
    }

    /// Entries whose spoken form occurs in `text` (case-insensitive),
    /// deduplicated, in first-occurrence order
    pub fn matching_entries(&self, text: &str) -> Vec<&DictionaryEntry> {
        let Some(ref ac) = self.automaton else {
            return Vec::new();
        };

        let text_lower = text.to_lowercase();
        let mut seen = vec![false; self.entries.len()];
        let mut matched = Vec::new();

        for m in ac.find_iter(&text_lower) {
            let idx = m.pattern().as_usize();
            if !seen[idx] {
                seen[idx] = true;
                matched.push(&self.entries[idx]);
            }
        }

        debug!("{} dictionary entries matched in text", matched.len());
        matched
    }
}
