//! Moderator self-echo detection and remediation.
//!
//! Echo is when the moderator opens by restating the question instead of
//! synthesizing an answer. Detection is a string-prefix heuristic with two
//! withdrawal rules that guard against false positives: synthesis-indicator
//! tokens near the start, or substantial content following the apparent echo.
//!
//! The streaming variant buffers a 300-character prefix before releasing
//! anything to the client, so an echoed opening is never streamed out.

/// Questions at or under this length never trigger echo detection.
const MIN_QUESTION_CHARS: usize = 100;
/// The question prefix is the first 80 chars of the first 150, trimmed.
const QUESTION_WINDOW: usize = 150;
const PREFIX_CHARS: usize = 80;
/// Window of the response compared against the question prefix.
const RESPONSE_WINDOW: usize = 300;
/// Window scanned for synthesis indicators.
const INDICATOR_WINDOW: usize = 500;
/// Content this far past the prefix withdraws the echo verdict.
const SUBSTANTIAL_EXTRA: usize = 500;
/// Streaming prefix buffer size.
pub const STREAM_BUFFER_CHARS: usize = 300;

/// Tokens whose presence near the start marks the text as a synthesis, not an
/// echo. Includes enumerated-list markers.
const SYNTHESIS_INDICATORS: &[&str] = &[
    "based on",
    "analysis",
    "recommend",
    "synthesis",
    "conclusion",
    "verdict",
    "however",
    "therefore",
    "##",
    "**",
    "1.",
    "2.",
];

/// Markers that introduce a synthesis buried after an echoed opening.
const SYNTHESIS_MARKERS: &[&str] = &[
    "Based on the panel's analysis",
    "The panel recommends",
    "After reviewing",
    "In conclusion",
    "The consensus is",
    "My synthesis",
    "Final recommendation",
    "Synthesis:",
    "My recommendation",
    "The verdict",
];

/// Canned stage-3 text substituted when the strict retry also echoes.
pub const ECHO_FALLBACK_TEXT: &str = "**Unable to generate synthesis** - The moderator model encountered an issue processing this query.\n\n**Workaround:** Please try:\n1. Shortening your question\n2. Splitting into multiple smaller questions\n3. Using \"Quick\" mode\n\nThe individual panelist responses above may still be helpful.";

/// Canned stage-3 text substituted when the moderator returns nothing at all.
pub const MODERATOR_FAILED_TEXT: &str = "**Unable to generate synthesis** - The moderator model failed to respond.\n\nPlease try again or review the individual panelist responses above.";

/// First `n` characters of `s`, on char boundaries.
fn prefix_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// The echo-comparison prefix of a question, or `None` when the question is
/// too short for detection to be meaningful.
fn question_prefix(question: &str) -> Option<&str> {
    if question.chars().count() <= MIN_QUESTION_CHARS {
        return None;
    }
    let window = prefix_chars(question, QUESTION_WINDOW).trim();
    Some(prefix_chars(window, PREFIX_CHARS))
}

/// Decide whether a moderator response echoes the question.
///
/// Declared only when the stripped response begins with the question prefix
/// AND no synthesis indicator appears in the first 500 characters AND no
/// substantial content follows the apparent echo.
pub fn detect_echo(question: &str, response: &str) -> bool {
    let Some(prefix) = question_prefix(question) else {
        return false;
    };
    let response_start = prefix_chars(response, RESPONSE_WINDOW).trim();
    if !response_start.starts_with(prefix) {
        return false;
    }

    let head = prefix_chars(response, INDICATOR_WINDOW).to_lowercase();
    if SYNTHESIS_INDICATORS.iter().any(|ind| head.contains(ind)) {
        tracing::debug!("echo-like start but synthesis indicators present, allowing");
        return false;
    }
    if response.chars().count() >= prefix.chars().count() + SUBSTANTIAL_EXTRA {
        tracing::debug!("echo-like start but substantial content follows, allowing");
        return false;
    }

    true
}

/// Case-insensitive substring search returning the byte offset in `haystack`.
fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let needle_chars: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle_chars.is_empty() {
        return Some(0);
    }
    let hay: Vec<(usize, char)> = haystack
        .char_indices()
        .map(|(i, c)| (i, c.to_lowercase().next().unwrap_or(c)))
        .collect();
    'outer: for start in 0..hay.len() {
        for (k, nc) in needle_chars.iter().enumerate() {
            match hay.get(start + k) {
                Some((_, hc)) if hc == nc => {}
                _ => continue 'outer,
            }
        }
        return Some(hay[start].0);
    }
    None
}

/// On a confirmed echo, look for a synthesis buried after the echoed opening
/// and return the tail starting at the first recognized marker.
pub fn salvage_synthesis(question: &str, response: &str) -> Option<String> {
    let window_len = prefix_chars(question, QUESTION_WINDOW).trim().len();
    for marker in SYNTHESIS_MARKERS {
        if let Some(pos) = find_case_insensitive(response, marker) {
            if pos > window_len {
                tracing::info!(marker, pos, "synthesis found after echoed opening");
                return Some(response[pos..].to_string());
            }
        }
    }
    None
}

/// Check whether the strict retry response still echoes the question.
pub fn retry_still_echoes(question: &str, retry_response: &str) -> bool {
    if question.chars().count() <= MIN_QUESTION_CHARS {
        return false;
    }
    let needle = prefix_chars(question, 100);
    prefix_chars(retry_response, 200).contains(needle)
}

/// Prefix buffer for the streaming variant of the detector.
///
/// Tokens are withheld until the buffer reaches 300 characters; the echo
/// check then runs once. A clean buffer is released in full and subsequent
/// tokens pass straight through. On a stream that ends early, [`finish`]
/// runs the check on whatever accumulated.
///
/// [`finish`]: StreamEchoGuard::finish
pub struct StreamEchoGuard {
    prefix: Option<String>,
    buffer: String,
    released: bool,
    echo: bool,
}

impl StreamEchoGuard {
    pub fn new(question: &str) -> Self {
        Self {
            prefix: question_prefix(question).map(str::to_string),
            buffer: String::new(),
            released: false,
            echo: false,
        }
    }

    /// Feed one token. Returns text now safe to forward to the client, or
    /// `None` while buffering or after an echo verdict.
    pub fn push(&mut self, token: &str) -> Option<String> {
        if self.echo {
            return None;
        }
        if self.released {
            return Some(token.to_string());
        }
        self.buffer.push_str(token);
        if self.buffer.chars().count() >= STREAM_BUFFER_CHARS {
            if self.buffer_echoes() {
                self.echo = true;
                return None;
            }
            self.released = true;
            return Some(std::mem::take(&mut self.buffer));
        }
        None
    }

    /// The stream ended. Runs the check on a partial buffer and returns any
    /// withheld text that turned out to be clean.
    pub fn finish(&mut self) -> Option<String> {
        if self.released || self.echo {
            return None;
        }
        if self.buffer_echoes() {
            self.echo = true;
            return None;
        }
        self.released = true;
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Whether the buffered opening was judged an echo.
    pub fn echo_detected(&self) -> bool {
        self.echo
    }

    fn buffer_echoes(&self) -> bool {
        match &self.prefix {
            Some(prefix) => self.buffer.trim().starts_with(prefix.as_str()),
            None => false,
        }
    }
}
