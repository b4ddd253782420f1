//! Verification provider used by `verify` steps.
//!
//! Verification is a local format check: nothing is looked up remotely. A
//! verdict always comes back, even for unsupported types, so `verify` steps
//! never fail on their own.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a format check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub valid: bool,
    /// Canonical form of the value, when it could be computed.
    pub normalized: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl Verification {
    fn valid(normalized: impl Into<Value>) -> Self {
        Self {
            valid: true,
            normalized: Some(normalized.into()),
            errors: Vec::new(),
        }
    }

    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            normalized: None,
            errors: vec![error.into()],
        }
    }
}

/// Checks a value against a named format.
pub trait VerificationProvider: Send + Sync {
    fn verify(&self, value_type: &str, value: &Value) -> Verification;
}

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
        .expect("email format compiles")
});

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,}$")
        .expect("domain format compiles")
});

static USERNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.-]{3,32}$").expect("username format compiles")
});

static BITCOIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(bc1[a-z0-9]{25,39}|[13][a-km-zA-HJ-NP-Z1-9]{25,34})$")
        .expect("bitcoin format compiles")
});

static ETHEREUM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^0x[a-fA-F0-9]{40}$").expect("ethereum format compiles")
});

/// Verification types understood by [`FormatVerifier`].
pub const SUPPORTED_TYPES: &[&str] = &[
    "email", "phone", "url", "domain", "ip", "username", "crypto",
];

/// Built-in [`VerificationProvider`] doing local format checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatVerifier;

impl FormatVerifier {
    pub fn new() -> Self {
        Self
    }

    fn email(raw: &str) -> Verification {
        let lowered = raw.to_lowercase();
        if EMAIL.is_match(&lowered) {
            Verification::valid(lowered)
        } else {
            Verification::invalid(format!("'{raw}' is not a valid email address"))
        }
    }

    fn phone(raw: &str) -> Verification {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        let allowed = raw
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | ' ' | '(' | ')'));
        if !allowed {
            return Verification::invalid(format!("'{raw}' contains non-phone characters"));
        }
        if !(7..=15).contains(&digits.len()) {
            return Verification::invalid(format!(
                "phone number must have 7 to 15 digits, got {}",
                digits.len()
            ));
        }
        Verification::valid(format!("+{digits}"))
    }

    fn url(raw: &str) -> Verification {
        let Some((scheme, rest)) = raw.split_once("://") else {
            return Verification::invalid(format!("'{raw}' has no scheme"));
        };
        let scheme = scheme.to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Verification::invalid(format!("unsupported URL scheme '{scheme}'"));
        }
        let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(host_end);
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let host = host.split(':').next().unwrap_or(host).to_lowercase();
        let host_ok =
            DOMAIN.is_match(&host) || host.parse::<IpAddr>().is_ok() || host == "localhost";
        if host.is_empty() || !host_ok {
            return Verification::invalid(format!("'{raw}' has an invalid host"));
        }
        let port = authority.rsplit('@').next().unwrap_or(authority);
        let port = port.split_once(':').map(|(_, p)| format!(":{p}")).unwrap_or_default();
        Verification::valid(format!("{scheme}://{host}{port}{tail}"))
    }

    fn domain(raw: &str) -> Verification {
        let lowered = raw.trim_end_matches('.').to_lowercase();
        if DOMAIN.is_match(&lowered) && lowered.len() <= 253 {
            Verification::valid(lowered)
        } else {
            Verification::invalid(format!("'{raw}' is not a valid domain"))
        }
    }

    fn ip(raw: &str) -> Verification {
        match raw.parse::<IpAddr>() {
            Ok(addr) => Verification::valid(addr.to_string()),
            Err(_) => Verification::invalid(format!("'{raw}' is not a valid IP address")),
        }
    }

    fn username(raw: &str) -> Verification {
        if USERNAME.is_match(raw) {
            Verification::valid(raw)
        } else {
            Verification::invalid(format!(
                "'{raw}' must be 3 to 32 letters, digits, '.', '_' or '-'"
            ))
        }
    }

    fn crypto(raw: &str) -> Verification {
        if ETHEREUM.is_match(raw) {
            Verification::valid(raw.to_lowercase())
        } else if BITCOIN.is_match(raw) {
            Verification::valid(raw)
        } else {
            Verification::invalid(format!("'{raw}' is not a bitcoin or ethereum address"))
        }
    }
}

impl VerificationProvider for FormatVerifier {
    fn verify(&self, value_type: &str, value: &Value) -> Verification {
        let Some(raw) = value.as_str() else {
            return Verification::invalid(format!("expected a string value, got {value}"));
        };
        let raw = raw.trim();

        match value_type {
            "email" => Self::email(raw),
            "phone" => Self::phone(raw),
            "url" => Self::url(raw),
            "domain" => Self::domain(raw),
            "ip" => Self::ip(raw),
            "username" => Self::username(raw),
            "crypto" => Self::crypto(raw),
            other => Verification::invalid(format!("unsupported verification type '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verify(value_type: &str, value: &str) -> Verification {
        FormatVerifier::new().verify(value_type, &json!(value))
    }

    #[test]
    fn test_email_normalized_to_lowercase() {
        let v = verify("email", " Alice@Example.COM ");
        assert!(v.valid);
        assert_eq!(v.normalized, Some(json!("alice@example.com")));
        assert!(!verify("email", "not-an-email").valid);
    }

    #[test]
    fn test_valid_email_serializes_without_errors() {
        let v = serde_json::to_value(verify("email", "a@b.com")).unwrap();
        assert_eq!(v, json!({"valid": true, "normalized": "a@b.com"}));
    }

    #[test]
    fn test_phone_normalized_to_digits() {
        let v = verify("phone", "+1 (555) 010-9999");
        assert!(v.valid);
        assert_eq!(v.normalized, Some(json!("+15550109999")));
        assert!(!verify("phone", "12").valid);
        assert!(!verify("phone", "call me maybe").valid);
    }

    #[test]
    fn test_url_and_domain() {
        let v = verify("url", "HTTPS://Example.com:8443/path?q=1");
        assert!(v.valid);
        assert_eq!(v.normalized, Some(json!("https://example.com:8443/path?q=1")));
        assert!(!verify("url", "ftp://example.com").valid);
        assert!(!verify("url", "example.com").valid);

        assert_eq!(verify("domain", "Example.ORG.").normalized, Some(json!("example.org")));
        assert!(!verify("domain", "-bad-.com").valid);
    }

    #[test]
    fn test_ip_username_crypto() {
        assert!(verify("ip", "10.0.0.1").valid);
        assert!(verify("ip", "::1").valid);
        assert!(!verify("ip", "300.1.1.1").valid);

        assert!(verify("username", "alice_01").valid);
        assert!(!verify("username", "a").valid);

        let eth = verify("crypto", "0x52908400098527886E0F7030069857D2E4169EE7");
        assert!(eth.valid);
        assert_eq!(
            eth.normalized,
            Some(json!("0x52908400098527886e0f7030069857d2e4169ee7"))
        );
        assert!(verify("crypto", "1BoatSLRHtKNngkdXEeobR76b53LETtpyT").valid);
        assert!(!verify("crypto", "0x123").valid);
    }

    #[test]
    fn test_unsupported_type_and_non_string_value() {
        let v = verify("passport", "X123");
        assert!(!v.valid);
        assert!(v.errors[0].contains("unsupported"));

        let v = FormatVerifier::new().verify("email", &json!(42));
        assert!(!v.valid);
        assert!(v.normalized.is_none());
    }
}
