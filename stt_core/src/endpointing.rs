//! Endpointing: deciding that an utterance has ended.

use std::time::Duration;

use crate::analyzer::{CompletionAnalysis, Suggestion};

/// Never promote a partial before this much silence.
pub const MIN_PROMOTION_DELAY: Duration = Duration::from_millis(1400);

/// Session-configurable endpointing parameters, in seconds to match the
/// client-facing configuration shape.
#[derive(Debug, Clone, Copy)]
pub struct EndpointingConfig {
    /// Base wait before any response starts.
    pub wait_seconds: f32,
    /// Extra delay when the utterance ends with terminal punctuation.
    pub punctuation_seconds: f32,
    /// Extra delay when it does not.
    pub no_punct_seconds: f32,
    /// Extra delay when it ends with a digit (numbers tend to continue).
    pub number_seconds: f32,
}

impl Default for EndpointingConfig {
    fn default() -> Self {
        Self {
            wait_seconds: 0.4,
            punctuation_seconds: 0.1,
            no_punct_seconds: 1.5,
            number_seconds: 0.5,
        }
    }
}

/// Delay before a silence timer may promote the given partial to a final.
///
/// Starts from the configured `no_punct_seconds` and extends for
/// heuristically incomplete utterances; floored at [`MIN_PROMOTION_DELAY`]
/// and capped at the session silence timeout.
pub fn promotion_delay(
    text: &str,
    config: &EndpointingConfig,
    analysis: &CompletionAnalysis,
    silence_timeout: Duration,
) -> Duration {
    let mut delay = Duration::from_secs_f32(config.no_punct_seconds.max(0.0));

    if ends_with_incomplete_clause(text) {
        delay += Duration::from_millis(800);
    }
    if analysis.suggestion == Suggestion::WaitLonger {
        delay += Duration::from_millis(700);
    } else if analysis.suggestion == Suggestion::Wait {
        delay += Duration::from_millis(300);
    }

    delay.clamp(MIN_PROMOTION_DELAY, silence_timeout.max(MIN_PROMOTION_DELAY))
}

/// Delay between accepting a user utterance and starting TTS output.
///
/// `grounded` answers (cache hits, stored first messages, KB answers) are
/// capped far tighter than general LLM responses.
pub fn tts_start_delay(user_text: &str, config: &EndpointingConfig, grounded: bool) -> Duration {
    let trimmed = user_text.trim_end();
    let ends_punct = trimmed.ends_with(['.', '!', '?']);
    let ends_digit = trimmed
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_digit());

    let mut seconds = config.wait_seconds.max(0.0);
    seconds += if ends_punct {
        config.punctuation_seconds.max(0.0)
    } else {
        config.no_punct_seconds.max(0.0)
    };
    if ends_digit {
        seconds += config.number_seconds.max(0.0);
    }

    let cap = if grounded {
        Duration::from_millis(200)
    } else {
        Duration::from_secs(2)
    };
    Duration::from_secs_f32(seconds).min(cap)
}

fn ends_with_incomplete_clause(text: &str) -> bool {
    let last = text
        .split_whitespace()
        .next_back()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .unwrap_or_default();
    matches!(
        last.as_str(),
        "and" | "or" | "but" | "the" | "a" | "an" | "to" | "of" | "with" | "for" | "in" | "on"
            | "at" | "so" | "because" | "if" | "than" | "about"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;

    #[test]
    fn promotion_delay_is_floored() {
        let cfg = EndpointingConfig {
            no_punct_seconds: 0.2,
            ..EndpointingConfig::default()
        };
        let analysis = analyze("I want a quote.", Duration::ZERO);
        let d = promotion_delay("I want a quote.", &cfg, &analysis, Duration::from_secs(5));
        assert_eq!(d, MIN_PROMOTION_DELAY);
    }

    #[test]
    fn incomplete_clause_extends_delay_up_to_timeout() {
        let cfg = EndpointingConfig::default();
        let analysis = analyze("I need help with", Duration::ZERO);
        let timeout = Duration::from_secs(5);
        let d = promotion_delay("I need help with", &cfg, &analysis, timeout);
        assert!(d > MIN_PROMOTION_DELAY);
        assert!(d <= timeout);

        // Ceiling applies even with a tiny silence timeout.
        let d = promotion_delay(
            "I need help with",
            &cfg,
            &analysis,
            Duration::from_millis(500),
        );
        assert_eq!(d, MIN_PROMOTION_DELAY);
    }

    #[test]
    fn tts_delay_grounded_cap() {
        let cfg = EndpointingConfig::default();
        let d = tts_start_delay("what are your hours", &cfg, true);
        assert_eq!(d, Duration::from_millis(200));
    }

    #[test]
    fn tts_delay_punctuated_is_short() {
        let cfg = EndpointingConfig::default();
        let punct = tts_start_delay("I want a quote.", &cfg, false);
        let bare = tts_start_delay("I want a quote", &cfg, false);
        assert!(punct < bare);
    }

    #[test]
    fn tts_delay_trailing_digit_extends() {
        let cfg = EndpointingConfig::default();
        let digit = tts_start_delay("my zip is 94110", &cfg, false);
        let plain = tts_start_delay("my zip is unknown", &cfg, false);
        assert!(digit >= plain);
        assert!(digit <= Duration::from_secs(2));
    }
}
