//! Barge-in policy.
//!
//! While TTS is active, a user utterance interrupts only when every guard
//! passes; an explicit stop phrase short-circuits them all. Anything else
//! is deferred and replayed after `tts.end`.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::config::TtsConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BargeDecision {
    Interrupt { reason: &'static str },
    Defer { reason: &'static str },
}

/// What the policy knows about the speech currently playing.
#[derive(Debug, Clone, Copy)]
pub struct SpeechContext<'a> {
    /// Text submitted to TTS so far this turn.
    pub tts_text: &'a str,
    /// Time since the first audio chunk went out.
    pub elapsed: Duration,
    /// Time since the spoken text last advanced.
    pub text_age: Duration,
}

fn stop_phrase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(stop|pause|hold on|wait|quiet|silent|cancel|enough)\b")
            .expect("stop phrase regex")
    })
}

fn protected_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Phone numbers, policy-like ids, currency, percentages, "call ...N".
        Regex::new(
            r"(?ix)
            (\d[\d\-\.\s]{6,}\d)                 # phone-like digit runs
            | (\b\d{2,}-\d{2,}-\d{2,}\b)         # policy-like ids
            | ([$€£₹]\s?\d[\d,\.]*)              # currency amounts
            | (\b\d+(\.\d+)?\s?%)                # percentages
            | (\bcall\b[^.!?]*\d)                # call ... number
            ",
        )
        .expect("protected number regex")
    })
}

fn critical_info_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Dates, times, street addresses, emails.
        Regex::new(
            r"(?ix)
            (\b\d{1,2}[/\-]\d{1,2}([/\-]\d{2,4})?\b)                                  # 12/31/2025
            | (\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2}\b)
            | (\b\d{1,2}:\d{2}\s?(am|pm)?\b)                                          # 4:30 pm
            | (\b\d+\s+\w+\s+(street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr)\b)
            | ([A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,})                        # emails
            ",
        )
        .expect("critical info regex")
    })
}

/// Trailing tokens that leave the current clause unfinished.
fn ends_mid_clause(text: &str) -> bool {
    let trimmed = text.trim_end();
    if trimmed.ends_with(',') {
        return true;
    }
    let last = trimmed
        .split_whitespace()
        .next_back()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .unwrap_or_default();
    matches!(
        last.as_str(),
        "and" | "or" | "but" | "the" | "a" | "an" | "to" | "of" | "with" | "for" | "is" | "your"
            | "their" | "at" | "on" | "in"
    )
}

pub fn contains_stop_phrase(text: &str) -> bool {
    stop_phrase_re().is_match(text)
}

/// Decide whether `user_text` may interrupt active speech.
pub fn evaluate(user_text: &str, speech: SpeechContext<'_>, config: &TtsConfig) -> BargeDecision {
    // Explicit stop phrases short-circuit every protection.
    if contains_stop_phrase(user_text) {
        return BargeDecision::Interrupt { reason: "stop_phrase" };
    }

    if speech.elapsed < Duration::from_millis(config.min_duration_ms) {
        return BargeDecision::Defer { reason: "min_duration" };
    }

    let words = user_text.split_whitespace().count();
    if words < config.barge_threshold_words {
        return BargeDecision::Defer { reason: "too_few_words" };
    }

    if protected_number_re().is_match(speech.tts_text) {
        return BargeDecision::Defer { reason: "protected_number" };
    }
    let tts_lower = speech.tts_text.to_lowercase();
    if config
        .protected_phrases
        .iter()
        .any(|phrase| tts_lower.contains(phrase))
    {
        return BargeDecision::Defer { reason: "protected_phrase" };
    }

    if config.sentence_boundary_protection
        && ends_mid_clause(speech.tts_text)
        && speech.text_age < Duration::from_millis(config.clause_protection_ms)
    {
        return BargeDecision::Defer { reason: "mid_clause" };
    }

    if config.critical_info_protection
        && speech.elapsed < Duration::from_millis(config.min_duration_ms) + Duration::from_secs(1)
        && critical_info_re().is_match(speech.tts_text)
    {
        return BargeDecision::Defer { reason: "critical_info" };
    }

    BargeDecision::Interrupt { reason: "all_conditions_met" }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TtsConfig {
        TtsConfig {
            min_duration_ms: 1500,
            barge_threshold_words: 3,
            protected_phrases: vec![],
            sentence_boundary_protection: true,
            clause_protection_ms: 1200,
            critical_info_protection: true,
        }
    }

    fn speech(text: &str, elapsed_ms: u64) -> SpeechContext<'_> {
        SpeechContext {
            tts_text: text,
            elapsed: Duration::from_millis(elapsed_ms),
            text_age: Duration::from_millis(elapsed_ms),
        }
    }

    #[test]
    fn stop_phrase_interrupts_immediately() {
        // 400 ms elapsed, two words, protected digits playing: stop phrase
        // still wins.
        let decision = evaluate(
            "um wait",
            speech("Your policy number is 12-345-67.", 400),
            &config(),
        );
        assert_eq!(decision, BargeDecision::Interrupt { reason: "stop_phrase" });
    }

    #[test]
    fn single_word_without_stop_phrase_is_deferred() {
        let decision = evaluate("hi", speech("Your policy number is 12-345-67.", 400), &config());
        assert!(matches!(decision, BargeDecision::Defer { .. }));
    }

    #[test]
    fn explicit_stop_overrides_protected_number() {
        let decision = evaluate(
            "okay stop now",
            speech("You can reach us at 1-800-555-1212 any time.", 2000),
            &config(),
        );
        assert_eq!(decision, BargeDecision::Interrupt { reason: "stop_phrase" });
    }

    #[test]
    fn protected_number_blocks_polite_interruptions() {
        let decision = evaluate(
            "great thanks very much",
            speech("You can reach us at 1-800-555-1212 any time.", 2000),
            &config(),
        );
        assert_eq!(decision, BargeDecision::Defer { reason: "protected_number" });
    }

    #[test]
    fn currency_and_percent_are_protected() {
        let cfg = config();
        let decision = evaluate("that sounds fine", speech("The premium is $42.50 monthly", 2000), &cfg);
        assert_eq!(decision, BargeDecision::Defer { reason: "protected_number" });
        let decision = evaluate("that sounds fine", speech("Your rate drops by 15% next year", 2000), &cfg);
        assert_eq!(decision, BargeDecision::Defer { reason: "protected_number" });
    }

    #[test]
    fn min_duration_defers_early_interruptions() {
        let decision = evaluate("can you explain that", speech("Sure, let me walk", 300), &config());
        assert_eq!(decision, BargeDecision::Defer { reason: "min_duration" });
    }

    #[test]
    fn mid_clause_text_is_protected_briefly() {
        let decision = evaluate(
            "actually one more thing",
            SpeechContext {
                tts_text: "To qualify you will need to",
                elapsed: Duration::from_millis(2000),
                text_age: Duration::from_millis(200),
            },
            &config(),
        );
        assert_eq!(decision, BargeDecision::Defer { reason: "mid_clause" });
    }

    #[test]
    fn critical_info_window_defers_then_releases() {
        let cfg = config();
        let text = "Your appointment is at 4:30 pm on March 12.";
        // Inside min_duration + 1 s.
        let decision = evaluate("okay sounds good yes", speech(text, 2000), &cfg);
        assert_eq!(decision, BargeDecision::Defer { reason: "critical_info" });
        // Past the window the same utterance interrupts.
        let decision = evaluate("okay sounds good yes", speech(text, 2700), &cfg);
        assert!(matches!(decision, BargeDecision::Interrupt { .. }));
    }

    #[test]
    fn plain_speech_allows_interruption() {
        let decision = evaluate(
            "let me ask something else",
            speech("Happy to help with anything you need today.", 2000),
            &config(),
        );
        assert_eq!(
            decision,
            BargeDecision::Interrupt { reason: "all_conditions_met" }
        );
    }

    #[test]
    fn configured_protected_phrases_apply() {
        let mut cfg = config();
        cfg.protected_phrases = vec!["claim number".to_string()];
        let decision = evaluate(
            "hang on a second",
            speech("Please write down your claim number now", 2000),
            &cfg,
        );
        assert_eq!(decision, BargeDecision::Defer { reason: "protected_phrase" });
    }
}
