//! Sentence segmentation for streamed model output.
//!
//! Text arrives in arbitrary fragments. `SentenceSegmenter` buffers them and hands out
//! complete sentences as soon as a boundary is unambiguous, so synthesis can start on the
//! first sentence while the model is still generating the rest.

use tracing::debug;

/// Default minimum sentence length in characters.
pub const DEFAULT_MIN_SENTENCE_LENGTH: usize = 20;

/// Words that end in a period without ending a sentence (compared lowercase, without the final period).
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "inc", "ltd",
    "corp", "fig", "approx", "dept", "mt", "a.m", "p.m", "u.s", "jan", "feb", "apr", "jun",
    "jul", "aug", "sep", "sept", "oct", "nov", "dec",
];

/// Ordinary words that are abbreviations only before a number ("No. 5", "est. 1990", "Mar. 3").
const NUMBERED_ABBREVIATIONS: &[&str] = &["no", "co", "est", "mar"];

/// Characters that may trail a terminator and still belong to the sentence.
const CLOSERS: &[char] = &['"', '\'', ')', ']', '\u{201D}', '\u{2019}'];

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Splits a stream of text fragments into speakable sentences.
#[derive(Debug, Clone)]
pub struct SentenceSegmenter {
    min_sentence_length: usize,
    buffer: String,
    /// Characters at the front of `buffer` that form an already-closed but too-short sentence.
    deferred_chars: usize,
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SENTENCE_LENGTH)
    }
}

impl SentenceSegmenter {
    pub fn new(min_sentence_length: usize) -> Self {
        Self {
            min_sentence_length,
            buffer: String::new(),
            deferred_chars: 0,
        }
    }

    /// Append a fragment and return every sentence that became complete.
    ///
    /// A closed sentence shorter than the minimum is joined onto the sentence emitted
    /// just before it in this call. With nothing to join onto, it stays at the front of
    /// the buffer and scanning stops until more text arrives; it is then spoken together
    /// with the next sentence.
    pub fn add_text(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut emitted: Vec<String> = Vec::new();
        loop {
            let chars: Vec<char> = self.buffer.chars().collect();
            let Some(end) = find_boundary(&chars, self.deferred_chars) else {
                break;
            };

            let sentence: String = chars[..=end].iter().collect::<String>().trim().to_string();
            let rest: String = chars[end + 1..].iter().collect();

            if sentence.chars().count() >= self.min_sentence_length {
                self.buffer = rest;
                self.deferred_chars = 0;
                debug!(len = sentence.len(), "segmenter: sentence closed");
                emitted.push(sentence);
            } else if let Some(last) = emitted.last_mut() {
                self.buffer = rest;
                self.deferred_chars = 0;
                last.push(' ');
                last.push_str(&sentence);
            } else {
                // Keep it at the front; the next boundary closes it together with what follows.
                let deferred = sentence.chars().count();
                self.buffer = if rest.is_empty() { sentence } else { format!("{} {}", sentence, rest.trim_start()) };
                self.deferred_chars = deferred;
                debug!(deferred, "segmenter: short sentence deferred");
                break;
            }
        }
        emitted
    }

    /// Return whatever is left as the final sentence. Call once when the stream ends.
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_string();
        self.buffer.clear();
        self.deferred_chars = 0;
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    /// Text not yet emitted.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Index of the last character of the first valid sentence at or after `from`.
fn find_boundary(chars: &[char], from: usize) -> Option<usize> {
    let mut i = from;
    while i < chars.len() {
        let c = chars[i];
        if !is_terminator(c) {
            i += 1;
            continue;
        }
        // "?!" or "..": let the last terminator in the run decide.
        if chars.get(i + 1).is_some_and(|&n| is_terminator(n)) {
            i += 1;
            continue;
        }

        let mut end = i;
        while chars.get(end + 1).is_some_and(|n| CLOSERS.contains(n)) {
            end += 1;
        }

        if is_boundary(chars, i, end) {
            return Some(end);
        }
        i = end + 1;
    }
    None
}

fn is_boundary(chars: &[char], at: usize, end: usize) -> bool {
    // Not enough lookahead to tell yet.
    if chars.len() - end - 1 < 2 {
        return false;
    }

    let next = chars[end + 1..].iter().find(|c| !c.is_whitespace());
    if next.is_some_and(|c| c.is_lowercase()) {
        return false;
    }

    if chars[at] == '.' {
        if follows_abbreviation(chars, at) {
            return false;
        }
        let digit_before = at > 0 && chars[at - 1].is_ascii_digit();
        let digit_after = chars.get(at + 1).is_some_and(|c| c.is_ascii_digit());
        if digit_before && digit_after {
            return false;
        }
        if near_ellipsis(chars, at) {
            return false;
        }
    }
    true
}

fn follows_abbreviation(chars: &[char], dot: usize) -> bool {
    let mut start = dot;
    while start > 0 && (chars[start - 1].is_alphabetic() || chars[start - 1] == '.') {
        start -= 1;
    }
    if start == dot {
        return false;
    }
    // "21st." is an ordinal, not "St."
    if start > 0 && chars[start - 1].is_ascii_digit() {
        return false;
    }
    let word: String = chars[start..dot].iter().collect::<String>().to_lowercase();
    let word = word.trim_start_matches('.');
    if NUMBERED_ABBREVIATIONS.contains(&word) {
        return chars[dot + 1..]
            .iter()
            .find(|c| !c.is_whitespace())
            .is_some_and(|c| c.is_ascii_digit());
    }
    ABBREVIATIONS.contains(&word)
}

fn near_ellipsis(chars: &[char], dot: usize) -> bool {
    let lo = dot.saturating_sub(2);
    let hi = (dot + 3).min(chars.len());
    chars[lo..hi].windows(3).any(|w| w == ['.', '.', '.'])
}
