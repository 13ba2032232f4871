//! Classification of provisioning failures into transient vs fatal.

use regex::Regex;

/// Known transient provisioning failures: pattern and a short description.
///
/// Covers provider/plugin download hiccups, API throttling, IAM propagation
/// delays, and create races where a resource briefly appears to already exist.
pub const DEFAULT_RETRYABLE_ERRORS: &[(&str, &str)] = &[
    (
        r".*read: connection reset by peer.*",
        "connection reset by remote endpoint",
    ),
    (r".*transport is closing.*", "remote API transport closed"),
    (
        r".*unable to verify signature.*",
        "provider download interrupted",
    ),
    (
        r".*unable to verify checksum.*",
        "provider download interrupted",
    ),
    (
        r".*no provider exists with the given name.*",
        "provider registry lookup failed",
    ),
    (
        r".*registry service is unreachable.*",
        "provider registry unreachable",
    ),
    (r".*Error installing provider.*", "provider install failed"),
    (
        r".*Failed to query available provider packages.*",
        "provider registry query failed",
    ),
    (
        r".*timeout while waiting for plugin to start.*",
        "provider plugin start timed out",
    ),
    (
        r".*timed out waiting for server handshake.*",
        "provider plugin handshake timed out",
    ),
    (
        r"could not query provider registry for",
        "provider registry query failed",
    ),
    (
        r".*Client\.Timeout exceeded while awaiting headers.*",
        "client timeout awaiting headers",
    ),
    (
        r"(?s).*Could not download module.*The requested URL returned error: 429.*",
        "module download rate limited",
    ),
    (
        r".*(Throttling|ThrottlingException|Rate exceeded|TooManyRequests|RequestLimitExceeded).*",
        "API rate limited",
    ),
    (
        r".*(NoSuchEntity|InvalidClientTokenId).*",
        "IAM change not yet propagated",
    ),
    (
        r".*role .* cannot be assumed.*",
        "IAM role not yet assumable",
    ),
    (
        r".*(EntityAlreadyExists|AlreadyExists|already exists).*",
        "resource already exists race",
    ),
];

/// Outcome of classifying one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Safe to retry; `reason` is the matching predicate's description.
    Transient { reason: String },
    /// Retrying cannot help.
    Fatal,
}

/// Regex predicate set recognizing transient provisioning failures.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    predicates: Vec<(Regex, String)>,
}

impl ErrorClassifier {
    /// Build a classifier from `(pattern, description)` pairs.
    pub fn new<'a, I>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let predicates = patterns
            .into_iter()
            .map(|(pattern, reason)| Ok((Regex::new(pattern)?, reason.to_string())))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { predicates })
    }

    /// Defaults plus caller-supplied extra patterns (checked after the defaults).
    pub fn with_extra<'a, I>(extra: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut patterns: Vec<(&str, &str)> = DEFAULT_RETRYABLE_ERRORS.to_vec();
        patterns.extend(extra);
        Self::new(patterns)
    }

    /// Classify captured tool output. First matching predicate wins.
    pub fn classify(&self, output: &str) -> Classification {
        self.predicates
            .iter()
            .find(|(pattern, _)| pattern.is_match(output))
            .map(|(_, reason)| Classification::Transient {
                reason: reason.clone(),
            })
            .unwrap_or(Classification::Fatal)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        // The built-in patterns are static and covered by tests.
        Self::with_extra(std::iter::empty()).unwrap_or(Self {
            predicates: Vec::new(),
        })
    }
}
