//! Pattern detection provider used by `detect` steps.
//!
//! [`PatternDetector`] ships the built-in OSINT patterns (emails, phone
//! numbers, URLs, IPv4 addresses and crypto wallet addresses) and accepts
//! extra named regular expressions per call.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use basset_types::error::StepError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A single pattern hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    /// Name of the pattern that matched.
    pub pattern: String,
    pub value: String,
    /// Byte offsets into the scanned text.
    pub start: usize,
    pub end: usize,
}

/// Finds pattern matches in text. Implementations must be side-effect free.
pub trait DetectionProvider: Send + Sync {
    /// Scan `text` for the named built-in `patterns` and the `custom` regexes.
    ///
    /// An empty result is not an error.
    fn detect(
        &self,
        patterns: &[String],
        custom: &HashMap<String, String>,
        text: &str,
    ) -> Result<Vec<PatternMatch>, StepError>;
}

// ---------------------------------------------------------------------------
// Built-in patterns
// ---------------------------------------------------------------------------

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern compiles")
});

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+?\d{1,3}?[-.\s]?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}")
        .expect("phone pattern compiles")
});

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>]+"#).expect("url pattern compiles")
});

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b")
        .expect("ipv4 pattern compiles")
});

static BITCOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:bc1[a-z0-9]{25,39}|[13][a-km-zA-HJ-NP-Z1-9]{25,34})\b")
        .expect("bitcoin pattern compiles")
});

static ETHEREUM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b0x[a-fA-F0-9]{40}\b").expect("ethereum pattern compiles")
});

/// Names accepted in a detect step's `patterns` list.
pub const BUILTIN_PATTERNS: &[&str] = &["email", "phone", "url", "ipv4", "bitcoin", "ethereum"];

fn builtin(name: &str) -> Option<&'static Regex> {
    let regex: &'static LazyLock<Regex> = match name {
        "email" => &EMAIL,
        "phone" => &PHONE,
        "url" => &URL,
        "ipv4" | "ip" => &IPV4,
        "bitcoin" => &BITCOIN,
        "ethereum" => &ETHEREUM,
        _ => return None,
    };
    Some(LazyLock::force(regex))
}

// ---------------------------------------------------------------------------
// PatternDetector
// ---------------------------------------------------------------------------

/// Regex-backed [`DetectionProvider`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternDetector;

impl PatternDetector {
    pub fn new() -> Self {
        Self
    }

    fn scan(
        name: &str,
        regex: &Regex,
        text: &str,
        seen: &mut BTreeSet<(String, String)>,
        out: &mut Vec<PatternMatch>,
    ) {
        for m in regex.find_iter(text) {
            // Report each distinct value once per pattern.
            if seen.insert((name.to_string(), m.as_str().to_string())) {
                out.push(PatternMatch {
                    pattern: name.to_string(),
                    value: m.as_str().to_string(),
                    start: m.start(),
                    end: m.end(),
                });
            }
        }
    }
}

impl DetectionProvider for PatternDetector {
    fn detect(
        &self,
        patterns: &[String],
        custom: &HashMap<String, String>,
        text: &str,
    ) -> Result<Vec<PatternMatch>, StepError> {
        let mut seen = BTreeSet::new();
        let mut matches = Vec::new();

        // No names and no custom patterns means "everything built in".
        let names: Vec<&str> = if patterns.is_empty() && custom.is_empty() {
            BUILTIN_PATTERNS.to_vec()
        } else {
            patterns.iter().map(String::as_str).collect()
        };

        for name in names {
            let regex = builtin(name).ok_or_else(|| {
                StepError::validation(format!("unknown detection pattern '{name}'"))
            })?;
            Self::scan(name, regex, text, &mut seen, &mut matches);
        }

        let mut custom: Vec<(&String, &String)> = custom.iter().collect();
        custom.sort();
        for (name, pattern) in custom {
            let regex = Regex::new(pattern).map_err(|e| {
                StepError::validation(format!("invalid custom pattern '{name}': {e}"))
            })?;
            Self::scan(name, &regex, text, &mut seen, &mut matches);
        }

        matches.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.pattern.cmp(&b.pattern)));
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(patterns: &[&str], text: &str) -> Vec<PatternMatch> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        PatternDetector::new()
            .detect(&patterns, &HashMap::new(), text)
            .unwrap()
    }

    #[test]
    fn test_detects_emails_and_urls() {
        let text = "Contact alice@example.com or see https://example.com/about today";
        let matches = detect(&["email", "url"], text);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pattern, "email");
        assert_eq!(matches[0].value, "alice@example.com");
        assert_eq!(matches[1].value, "https://example.com/about");
    }

    #[test]
    fn test_duplicate_values_reported_once() {
        let matches = detect(&["email"], "a@b.io, a@b.io, c@d.io");
        let values: Vec<&str> = matches.iter().map(|m| m.value.as_str()).collect();
        assert_eq!(values, vec!["a@b.io", "c@d.io"]);
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        assert!(detect(&["ethereum"], "nothing to see here").is_empty());
    }

    #[test]
    fn test_crypto_and_ipv4() {
        let text = "wallet 0x52908400098527886E0F7030069857D2E4169EE7 from 192.168.1.20";
        let matches = detect(&["ethereum", "ipv4"], text);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].pattern, "ethereum");
        assert_eq!(matches[1].value, "192.168.1.20");
    }

    #[test]
    fn test_custom_pattern() {
        let mut custom = HashMap::new();
        custom.insert("ticket".to_string(), r"TICKET-\d+".to_string());
        let matches = PatternDetector::new()
            .detect(&[], &custom, "see TICKET-42 and TICKET-7")
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.pattern == "ticket"));
    }

    #[test]
    fn test_unknown_pattern_and_bad_regex_are_validation_errors() {
        let err = PatternDetector::new()
            .detect(&["ssn".to_string()], &HashMap::new(), "x")
            .unwrap_err();
        assert_eq!(err.kind(), basset_types::error::ErrorKind::Validation);

        let mut custom = HashMap::new();
        custom.insert("bad".to_string(), "(unclosed".to_string());
        assert!(PatternDetector::new().detect(&[], &custom, "x").is_err());
    }
}
