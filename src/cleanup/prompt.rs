//! Rewrite-instruction builder
//!
//! The system instruction sent to a cleanup backend is assembled from a base
//! rewrite instruction, an optional self-correction addendum, and literal
//! substitution lines for the dictionary entries the raw text actually
//! mentions.

use crate::dictionary::Dictionary;

const BASE_INSTRUCTION: &str = "You are a dictation assistant. Your job is to take raw transcribed \
     speech and clean it up: remove filler words (\"um\", \"uh\", \"you know\"), \
     fix punctuation and capitalization, and break run-on sentences. Preserve \
     the speaker's words and meaning exactly; do not summarize, answer, or \
     add anything. Output ONLY the cleaned text, nothing else.";

const SELF_CORRECTION_ADDENDUM: &str = "When the speaker corrects themselves mid-sentence (\"meet at five, no \
     wait, six\"), keep only the corrected version and drop the false start.";

/// Build the system instruction for one cleanup call
pub fn build_instruction(
    raw_text: &str,
    handle_self_corrections: bool,
    dictionary: &Dictionary,
) -> String {
    let mut instruction = String::from(BASE_INSTRUCTION);

    if handle_self_corrections {
        instruction.push_str("\n\n");
        instruction.push_str(SELF_CORRECTION_ADDENDUM);
    }

    let entries = dictionary.matching_entries(raw_text);
    if !entries.is_empty() {
        instruction.push_str("\n\nApply these exact replacements:");
        for entry in entries {
            instruction.push_str(&format!("\n- replace \"{}\" with \"{}\"", entry.spoken, entry.replacement));
        }
    }

    instruction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DictionaryEntry;

    #[test]
    fn test_base_instruction_always_present() {
        let dict = Dictionary::new(Vec::new());
        let instruction = build_instruction("hello world", false, &dict);

        assert!(instruction.contains("dictation assistant"));
        assert!(instruction.contains("Output ONLY the cleaned text"));
        assert!(!instruction.contains("corrects themselves"));
        assert!(!instruction.contains("replacements"));
    }

    #[test]
    fn test_self_correction_addendum_is_optional() {
        let dict = Dictionary::new(Vec::new());
        let instruction = build_instruction("hello", true, &dict);

        assert!(instruction.contains("corrects themselves"));
    }

    #[test]
    fn test_only_mentioned_dictionary_entries_are_rendered() {
        let dict = Dictionary::new(vec![
            DictionaryEntry::new("ant row pic", "Anthropic"),
            DictionaryEntry::new("my email", "me@example.com"),
        ]);

        let instruction = build_instruction("I joined ant row pic last week", false, &dict);

        assert!(instruction.contains("replace \"ant row pic\" with \"Anthropic\""));
        assert!(!instruction.contains("my email"));
    }

    #[test]
    fn test_no_replacement_section_when_nothing_matches() {
        let dict = Dictionary::new(vec![DictionaryEntry::new("ant row pic", "Anthropic")]);
        let instruction = build_instruction("completely unrelated", false, &dict);

        assert!(!instruction.contains("replacements"));
    }
}
