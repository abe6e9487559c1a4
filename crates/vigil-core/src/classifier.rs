//! Error taxonomy for provider failures.
//!
//! `classify` maps a raw `{code, message}` pair to an [`ErrorCategory`].
//! Rules are evaluated in a fixed precedence order and the first match wins,
//! so a `429` whose body says "not found" is still `rate_limited`.

use crate::error::VigilError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimited,
    AuthFailure,
    ConfigError,
    Transient,
    Unknown,
    /// Only produced when the adapter explicitly flags the error as permanent.
    Permanent,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::AuthFailure => "auth_failure",
            ErrorCategory::ConfigError => "config_error",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::Permanent => "permanent",
        }
    }

    /// Categories that never get another attempt within the same occurrence.
    pub fn is_terminal(self) -> bool {
        matches!(self, ErrorCategory::ConfigError | ErrorCategory::Permanent)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = VigilError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate_limited" => Ok(ErrorCategory::RateLimited),
            "auth_failure" => Ok(ErrorCategory::AuthFailure),
            "config_error" => Ok(ErrorCategory::ConfigError),
            "transient" => Ok(ErrorCategory::Transient),
            "unknown" => Ok(ErrorCategory::Unknown),
            "permanent" => Ok(ErrorCategory::Permanent),
            _ => Err(VigilError::UnknownCategory(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// RawError
// ---------------------------------------------------------------------------

/// The error half of the provider adapter contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawError {
    /// HTTP-like status code, when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub message: String,
    /// Set by adapters that know the failure can never succeed on retry.
    #[serde(default)]
    pub permanent: bool,
}

impl RawError {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            permanent: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            permanent: true,
        }
    }

    pub fn timeout(after_secs: u64) -> Self {
        Self::new(Some(408), format!("timeout after {after_secs}s"))
    }

    pub fn category(&self) -> ErrorCategory {
        if self.permanent {
            return ErrorCategory::Permanent;
        }
        classify(self.code, &self.message)
    }
}

impl std::fmt::Display for RawError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{code}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct Rule {
    category: ErrorCategory,
    codes: &'static [u16],
    pattern: Regex,
}

static RULES: OnceLock<Vec<Rule>> = OnceLock::new();

fn rules() -> &'static [Rule] {
    RULES.get_or_init(|| {
        let rule = |category: ErrorCategory, codes: &'static [u16], pattern: &str| Rule {
            category,
            codes,
            pattern: Regex::new(pattern).unwrap(),
        };
        vec![
            rule(
                ErrorCategory::RateLimited,
                &[429],
                r"(?i)rate limit|too many requests|quota exceeded",
            ),
            rule(
                ErrorCategory::AuthFailure,
                &[401, 403],
                r"(?i)unauthorized|forbidden|invalid token|token expired",
            ),
            rule(
                ErrorCategory::ConfigError,
                &[400, 404],
                r"(?i)not found|invalid config|missing required",
            ),
            rule(
                ErrorCategory::Transient,
                &[408, 500, 502, 503, 504],
                r"(?i)timeout|connection|network|temporary|server error",
            ),
        ]
    })
}

/// Classify a raw provider error. First matching rule wins; `Unknown` otherwise.
pub fn classify(code: Option<u16>, message: &str) -> ErrorCategory {
    for rule in rules() {
        let code_hit = code.is_some_and(|c| rule.codes.contains(&c));
        if code_hit || rule.pattern.is_match(message) {
            return rule.category;
        }
    }
    ErrorCategory::Unknown
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_categories() {
        assert_eq!(classify(Some(429), ""), ErrorCategory::RateLimited);
        assert_eq!(classify(Some(401), ""), ErrorCategory::AuthFailure);
        assert_eq!(classify(Some(403), ""), ErrorCategory::AuthFailure);
        assert_eq!(classify(Some(400), ""), ErrorCategory::ConfigError);
        assert_eq!(classify(Some(404), ""), ErrorCategory::ConfigError);
        for code in [408, 500, 502, 503, 504] {
            assert_eq!(classify(Some(code), ""), ErrorCategory::Transient);
        }
        assert_eq!(classify(Some(418), "teapot"), ErrorCategory::Unknown);
    }

    #[test]
    fn messages_match_case_insensitively() {
        assert_eq!(
            classify(None, "API Rate Limit hit"),
            ErrorCategory::RateLimited
        );
        assert_eq!(
            classify(None, "Token Expired at 12:00"),
            ErrorCategory::AuthFailure
        );
        assert_eq!(
            classify(None, "Missing required field: region"),
            ErrorCategory::ConfigError
        );
        assert_eq!(
            classify(None, "connection reset by peer"),
            ErrorCategory::Transient
        );
        assert_eq!(classify(None, "boom"), ErrorCategory::Unknown);
    }

    #[test]
    fn precedence_is_first_match_wins() {
        // Status 429 beats an auth-looking message.
        assert_eq!(
            classify(Some(429), "unauthorized"),
            ErrorCategory::RateLimited
        );
        // Message "quota exceeded" beats a 500.
        assert_eq!(
            classify(Some(500), "quota exceeded"),
            ErrorCategory::RateLimited
        );
        // Auth message beats a config status code.
        assert_eq!(
            classify(Some(404), "forbidden"),
            ErrorCategory::AuthFailure
        );
        // "not found" (config) is checked before "timeout" (transient).
        assert_eq!(
            classify(None, "endpoint not found after timeout"),
            ErrorCategory::ConfigError
        );
    }

    #[test]
    fn raw_error_permanent_flag_overrides_rules() {
        let err = RawError::permanent("account deleted");
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(err.category().is_terminal());
    }

    #[test]
    fn timeout_error_is_transient() {
        assert_eq!(RawError::timeout(30).category(), ErrorCategory::Transient);
    }

    #[test]
    fn category_string_roundtrip() {
        for cat in [
            ErrorCategory::RateLimited,
            ErrorCategory::AuthFailure,
            ErrorCategory::ConfigError,
            ErrorCategory::Transient,
            ErrorCategory::Unknown,
            ErrorCategory::Permanent,
        ] {
            let parsed: ErrorCategory = cat.as_str().parse().unwrap();
            assert_eq!(parsed, cat);
        }
    }

    #[test]
    fn unknown_category_is_rejected_as_invalid_input() {
        let err = "flaky".parse::<ErrorCategory>().unwrap_err();
        assert!(matches!(err, VigilError::UnknownCategory(ref s) if s == "flaky"));
        assert_eq!(err.to_string(), "unknown error category 'flaky'");
    }
}
