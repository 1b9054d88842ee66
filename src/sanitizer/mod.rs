//! Prompt-injection screening
//!
//! Two independent entry points run on raw user text:
//!
//! - [`InputSanitizer::should_block_input`]: a strict gate evaluated first.
//!   Blocks obvious multi-vector attacks and binary payloads outright.
//! - [`InputSanitizer::sanitize`]: flags, redacts and normalizes what is
//!   allowed through, producing a [`SanitizationResult`] that feeds the
//!   audit risk score.

mod json;
mod patterns;

pub use json::KeyDenyList;
pub use patterns::{InjectionPattern, PatternTable, Severity};

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use regex::{NoExpand, Regex};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

/// Default maximum accepted input length, in characters
pub const DEFAULT_MAX_INPUT_LENGTH: usize = 4000;

pub const REDACTION_MARKER: &str = "[REDACTED]";

const BLOCK_MESSAGE: &str =
    "Your message could not be processed. Please rephrase your request and try again.";

const BLOCK_MIN_HIGH_PATTERNS: usize = 2;
const BLOCK_PRINTABLE_MIN_LENGTH: usize = 100;
const BLOCK_PRINTABLE_MIN_RATIO: f64 = 0.5;

const TRUNCATED_WEIGHT: u32 = 10;

/// (flag name, character, threshold); flagged when the count exceeds the threshold
const SUSPICIOUS_CHARACTERS: &[(&str, char, usize)] = &[
    ("backticks", '`', 10),
    ("braces", '{', 20),
    ("angle_brackets", '<', 20),
    ("backslashes", '\\', 10),
];

const BASE64_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

static BASE64_CANDIDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/]{20,}={0,2}").expect("static regex"));
static RUNS_OF_BLANKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("static regex"));
static TRAILING_BLANKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+\n").expect("static regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("static regex"));

/// One sanitizer finding, rendered as `severity:name` or `truncated`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    Pattern { severity: Severity, name: String },
    Truncated,
}

impl Flag {
    fn pattern(severity: Severity, name: impl Into<String>) -> Self {
        Flag::Pattern {
            severity,
            name: name.into(),
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            Flag::Pattern { severity, .. } => Some(*severity),
            Flag::Truncated => None,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            Flag::Pattern { severity, .. } => severity.weight(),
            Flag::Truncated => TRUNCATED_WEIGHT,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Pattern { severity, name } => write!(f, "{}:{}", severity, name),
            Flag::Truncated => f.write_str("truncated"),
        }
    }
}

impl Serialize for Flag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of [`InputSanitizer::sanitize`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SanitizationResult {
    pub sanitized: String,
    /// True iff any flag is high or medium severity
    pub flagged: bool,
    pub flags: Vec<Flag>,
    pub original_length: usize,
    pub sanitized_length: usize,
}

impl SanitizationResult {
    /// Weighted flag sum, capped at 100
    pub fn risk_score(&self) -> u8 {
        let total: u32 = self.flags.iter().map(Flag::weight).sum();
        total.min(100) as u8
    }

    pub fn flag_strings(&self) -> Vec<String> {
        self.flags.iter().map(Flag::to_string).collect()
    }
}

/// Outcome of [`InputSanitizer::should_block_input`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDecision {
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BlockDecision {
    fn allow() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    fn block() -> Self {
        Self {
            blocked: true,
            reason: Some(BLOCK_MESSAGE.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputSanitizer {
    patterns: PatternTable,
    max_input_length: usize,
}

impl Default for InputSanitizer {
    fn default() -> Self {
        Self::new(PatternTable::builtin(), DEFAULT_MAX_INPUT_LENGTH)
    }
}

impl InputSanitizer {
    pub fn new(patterns: PatternTable, max_input_length: usize) -> Self {
        Self {
            patterns,
            max_input_length,
        }
    }

    pub fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    /// Flag, redact and normalize user text
    pub fn sanitize(&self, text: &str) -> SanitizationResult {
        let original_length = text.chars().count();
        let mut flags = Vec::new();

        let mut working: String = if original_length > self.max_input_length {
            flags.push(Flag::Truncated);
            text.chars().take(self.max_input_length).collect()
        } else {
            text.to_string()
        };

        for pattern in self.patterns.iter() {
            if !pattern.is_match(&working) {
                continue;
            }
            flags.push(Flag::pattern(pattern.severity(), pattern.name()));
            if pattern.severity() == Severity::High {
                working = pattern
                    .regex()
                    .replace_all(&working, NoExpand(REDACTION_MARKER))
                    .into_owned();
            }
        }

        if self.has_encoded_payload(&working) {
            flags.push(Flag::pattern(Severity::Medium, "base64_payload"));
        }

        for (name, ch, threshold) in SUSPICIOUS_CHARACTERS {
            let count = working.chars().filter(|c| c == ch).count();
            if count > *threshold {
                flags.push(Flag::pattern(Severity::Low, format!("excessive_{}", name)));
            }
        }

        let sanitized = normalize_whitespace(&working);
        let flagged = flags
            .iter()
            .any(|f| matches!(f.severity(), Some(Severity::High | Severity::Medium)));

        SanitizationResult {
            sanitized_length: sanitized.chars().count(),
            sanitized,
            flagged,
            flags,
            original_length,
        }
    }

    /// Strict pre-screen; the reason never names what matched
    pub fn should_block_input(&self, text: &str) -> BlockDecision {
        let high_hits: BTreeSet<&str> = self
            .patterns
            .matches(text)
            .filter(|p| p.severity() == Severity::High)
            .map(|p| p.name())
            .collect();
        if high_hits.len() >= BLOCK_MIN_HIGH_PATTERNS {
            return BlockDecision::block();
        }

        let total = text.chars().count();
        if total > BLOCK_PRINTABLE_MIN_LENGTH {
            let printable = text.chars().filter(|c| is_printable(*c)).count();
            if (printable as f64) / (total as f64) < BLOCK_PRINTABLE_MIN_RATIO {
                return BlockDecision::block();
            }
        }

        BlockDecision::allow()
    }

    fn has_encoded_payload(&self, text: &str) -> bool {
        BASE64_CANDIDATE.find_iter(text).any(|candidate| {
            let body = candidate.as_str().trim_end_matches('=');
            // a single dangling symbol cannot encode a byte
            let body = if body.len() % 4 == 1 {
                &body[..body.len() - 1]
            } else {
                body
            };
            let Ok(bytes) = BASE64_LENIENT.decode(body) else {
                return false;
            };
            let decoded = String::from_utf8_lossy(&bytes);
            self.patterns.matches(&decoded).next().is_some()
        })
    }
}

fn is_printable(c: char) -> bool {
    matches!(c, '\n' | '\t' | '\r') || !(c.is_control() || c == char::REPLACEMENT_CHARACTER)
}

fn normalize_whitespace(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| matches!(c, '\n' | '\t') || !c.is_control())
        .collect();
    let collapsed = RUNS_OF_BLANKS.replace_all(&stripped, " ");
    let trimmed_lines = TRAILING_BLANKS.replace_all(&collapsed, "\n");
    let squeezed = BLANK_LINES.replace_all(&trimmed_lines, "\n\n");
    squeezed.trim().to_string()
}
