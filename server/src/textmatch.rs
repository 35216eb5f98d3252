//! Utterance similarity and sentence-boundary detection.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// Token-set Jaccard similarity over normalized words.
pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokens(a).collect();
    let set_b: HashSet<String> = tokens(b).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// True when either normalized utterance contains the other.
pub fn substring_overlap(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}

/// End byte offset of the earliest sentence boundary whose prefix holds at
/// least `min_words` words, for early TTS. A too-short opening sentence is
/// absorbed into the next boundary.
pub fn first_sentence_boundary(text: &str, min_words: usize) -> Option<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[.!?](\s|$)").expect("sentence regex"));
    for m in re.find_iter(text) {
        let prefix = &text[..m.end()];
        if prefix.split_whitespace().count() >= min_words {
            return Some(m.end());
        }
    }
    None
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().filter_map(|w| {
        let cleaned: String = w
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(|c| c.to_lowercase())
            .collect();
        (!cleaned.is_empty()).then_some(cleaned)
    })
}

fn normalize(text: &str) -> String {
    tokens(text).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_utterances_have_full_similarity() {
        assert_eq!(token_jaccard("I want a quote.", "i want a QUOTE"), 1.0);
    }

    #[test]
    fn disjoint_utterances_have_zero_similarity() {
        assert_eq!(token_jaccard("hello there", "completely different words"), 0.0);
    }

    #[test]
    fn near_duplicates_score_high() {
        let sim = token_jaccard("I want a quote for my car", "I want a quote for my car please");
        assert!(sim >= 0.8, "similarity was {sim}");
    }

    #[test]
    fn substring_overlap_detects_containment() {
        assert!(substring_overlap("I want a quote", "want a quote"));
        assert!(substring_overlap("want a quote", "I want a quote!"));
        assert!(!substring_overlap("hello", "goodbye"));
        assert!(!substring_overlap("", "goodbye"));
    }

    #[test]
    fn sentence_boundary_requires_min_words() {
        // Six words before the period.
        let text = "I can certainly help with that. Let me check.";
        let end = first_sentence_boundary(text, 6).unwrap();
        assert_eq!(&text[..end], "I can certainly help with that. ");

        // A short opening sentence is absorbed into the next boundary.
        let text = "Sure. Let me look into the details now. More.";
        let end = first_sentence_boundary(text, 6).unwrap();
        assert_eq!(&text[..end], "Sure. Let me look into the details now. ");
        // No terminal punctuation at all.
        assert!(first_sentence_boundary("still streaming tokens without any end", 6).is_none());
        assert!(first_sentence_boundary("Sure.", 6).is_none());
    }

    #[test]
    fn sentence_boundary_at_end_of_text() {
        let text = "Here is everything you asked about today.";
        let end = first_sentence_boundary(text, 6).unwrap();
        assert_eq!(end, text.len());
    }
}
