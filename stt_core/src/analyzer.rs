//! Sentence-completion analysis.
//!
//! One scoring table, used both for silence-promotion of partials and by
//! the orchestrator for early-LLM and barge-in decisions.
//!
//! Score starts at 50 and is adjusted by:
//!
//! | signal | weight |
//! |---|---|
//! | terminal punctuation (`.` `!` `?`)        | +30 |
//! | trailing `,` `;` `:`                      | -15 |
//! | trailing incomplete-clause word           | -30 |
//! | trailing comparison/enumeration cue       | -10 |
//! | interrogative opener with >= 4 words      | +10 |
//! | fewer than 3 words                        | -20 |
//! | 8 or more words                           | +10 |
//! | silence >= 2.0 s                          | +15 |
//! | silence >= 1.2 s (below 2.0 s)            | +10 |
//!
//! Confidence is the clamped score. `Process` at >= 70, `Wait` at 45..70,
//! `WaitLonger` below 45.

use std::time::Duration;

/// What the orchestrator should do with the utterance so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suggestion {
    Process,
    Wait,
    WaitLonger,
}

#[derive(Debug, Clone, Copy)]
pub struct CompletionAnalysis {
    pub is_complete: bool,
    /// 0..=100.
    pub confidence: u8,
    pub suggestion: Suggestion,
}

/// Words that leave a clause dangling when they end an utterance.
const INCOMPLETE_CLAUSE_WORDS: &[&str] = &[
    "and", "or", "but", "the", "a", "an", "to", "of", "with", "for", "in",
    "on", "at", "my", "your", "his", "her", "their", "our", "so", "because",
    "if", "when", "while", "about", "than", "is", "are", "was", "were",
];

const INTERROGATIVE_OPENERS: &[&str] = &[
    "what", "who", "where", "when", "why", "how", "is", "are", "can",
    "could", "would", "will", "do", "does", "did", "should",
];

/// Enumeration/comparison cues that usually mean more items are coming.
const ENUMERATION_CUES: &[&str] = &["versus", "vs", "either", "between", "first", "second"];

pub fn analyze(text: &str, silence: Duration) -> CompletionAnalysis {
    let trimmed = text.trim();
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    let last_word = words
        .last()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .unwrap_or_default();
    let first_word = words
        .first()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .unwrap_or_default();

    let mut score: i32 = 50;

    if trimmed.ends_with(['.', '!', '?']) {
        score += 30;
    } else if trimmed.ends_with([',', ';', ':']) {
        score -= 15;
    }

    if INCOMPLETE_CLAUSE_WORDS.contains(&last_word.as_str()) {
        score -= 30;
    }
    if ENUMERATION_CUES.contains(&last_word.as_str()) {
        score -= 10;
    }

    if INTERROGATIVE_OPENERS.contains(&first_word.as_str()) && words.len() >= 4 {
        score += 10;
    }

    if words.len() < 3 {
        score -= 20;
    } else if words.len() >= 8 {
        score += 10;
    }

    if silence >= Duration::from_millis(2000) {
        score += 15;
    } else if silence >= Duration::from_millis(1200) {
        score += 10;
    }

    let confidence = score.clamp(0, 100) as u8;
    let suggestion = match confidence {
        70.. => Suggestion::Process,
        45..=69 => Suggestion::Wait,
        _ => Suggestion::WaitLonger,
    };

    CompletionAnalysis {
        is_complete: confidence >= 70,
        confidence,
        suggestion,
    }
}
