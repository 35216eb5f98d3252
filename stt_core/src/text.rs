//! Transcript text helpers.

use std::time::Duration;

use tokio::time::Instant;

/// Lowercase, punctuation to spaces, whitespace collapsed, trimmed.
pub fn normalize_transcript(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Suppresses finals whose normalized text repeats the previous final
/// within a short window.
pub struct FinalDedup {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl FinalDedup {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record `text` and report whether it duplicates the previous final.
    pub fn is_duplicate(&mut self, text: &str) -> bool {
        let normalized = normalize_transcript(text);
        let now = Instant::now();
        let duplicate = self
            .last
            .as_ref()
            .is_some_and(|(prev, at)| *prev == normalized && now.duration_since(*at) < self.window);
        if !duplicate {
            self.last = Some((normalized, now));
        }
        duplicate
    }
}

impl Default for FinalDedup {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}
