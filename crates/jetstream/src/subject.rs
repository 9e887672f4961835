//! Subject types and wildcard matching
//!
//! Subjects are dot-separated tokens. Patterns may additionally contain the
//! wildcards `*` (exactly one token) and `>` (one or more trailing tokens,
//! only valid as the last token).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur with subject validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubjectError {
    /// Subject is empty
    #[error("Subject cannot be empty")]
    Empty,

    /// Subject contains invalid characters
    #[error("Subject contains invalid characters: {0}")]
    InvalidCharacters(String),

    /// Subject contains wildcards where they're not allowed
    #[error("Subject cannot contain wildcards: {0}")]
    ContainsWildcards(String),

    /// Invalid token in subject
    #[error("Invalid token in subject: {0}")]
    InvalidToken(String),

    /// Invalid wildcard usage
    #[error("Invalid wildcard usage: {0}")]
    InvalidWildcard(String),
}

/// A validated literal subject (no wildcards)
///
/// Examples: `orders.us.created`, `$KV.profiles.sue.color`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subject(String);

impl Subject {
    /// Create a new subject after validation
    pub fn new(subject: impl Into<String>) -> Result<Self, SubjectError> {
        let subject = subject.into();
        validate_subject(&subject)?;
        Ok(Self(subject))
    }

    /// Get the subject as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned string
    pub fn into_string(self) -> String {
        self.0
    }

    /// Iterate over the tokens of the subject
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Subject {
    type Error = SubjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.0
    }
}

/// A subject pattern (can contain wildcards)
///
/// Examples: `orders.*`, `events.>`, `*.user.*`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectPattern(String);

impl SubjectPattern {
    /// Create a new subject pattern after validation
    pub fn new(pattern: impl Into<String>) -> Result<Self, SubjectError> {
        let pattern = pattern.into();
        validate_subject_pattern(&pattern)?;
        Ok(Self(pattern))
    }

    /// Get the pattern as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned string
    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether the pattern contains any wildcard token
    pub fn has_wildcards(&self) -> bool {
        self.0.split('.').any(|token| token == "*" || token == ">")
    }

    /// Check if this pattern matches a subject
    pub fn matches(&self, subject: &str) -> bool {
        subject_matches_pattern(subject, &self.0)
    }

    /// Check if this pattern matches a Subject
    pub fn matches_subject(&self, subject: &Subject) -> bool {
        self.matches(subject.as_str())
    }

    /// Check if some concrete subject could match both patterns
    pub fn overlaps(&self, other: &Self) -> bool {
        patterns_overlap(&self.0, &other.0)
    }

    /// Check if every subject matched by this pattern is matched by `other`
    pub fn is_subset_of(&self, other: &Self) -> bool {
        pattern_is_subset(&self.0, &other.0)
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SubjectPattern {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubjectPattern {
    type Error = SubjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SubjectPattern> for String {
    fn from(pattern: SubjectPattern) -> Self {
        pattern.0
    }
}

impl From<Subject> for SubjectPattern {
    fn from(subject: Subject) -> Self {
        Self(subject.0)
    }
}

fn validate_literal_token(token: &str) -> Result<(), SubjectError> {
    if token.is_empty() {
        return Err(SubjectError::InvalidToken(
            "Empty token between dots".to_string(),
        ));
    }

    if token.contains(['*', '>']) {
        return Err(SubjectError::ContainsWildcards(format!(
            "Token '{token}' mixes wildcards with literal characters"
        )));
    }

    if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(SubjectError::InvalidCharacters(format!(
            "Token '{token}' contains whitespace or control characters"
        )));
    }

    Ok(())
}

/// Validates a literal subject (no wildcards allowed)
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() {
        return Err(SubjectError::Empty);
    }

    for token in subject.split('.') {
        if token == "*" || token == ">" {
            return Err(SubjectError::ContainsWildcards(
                "Use SubjectPattern for wildcards".to_string(),
            ));
        }
        validate_literal_token(token)?;
    }

    Ok(())
}

/// Validates a subject pattern
pub fn validate_subject_pattern(pattern: &str) -> Result<(), SubjectError> {
    if pattern.is_empty() {
        return Err(SubjectError::Empty);
    }

    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;

    for (i, token) in tokens.iter().enumerate() {
        match *token {
            ">" if i != last => {
                return Err(SubjectError::InvalidWildcard(
                    "'>' wildcard must be the last token".to_string(),
                ));
            }
            ">" | "*" => {}
            literal => validate_literal_token(literal)?,
        }
    }

    Ok(())
}

/// Check if a subject matches a pattern with wildcard support
pub fn subject_matches_pattern(subject: &str, pattern: &str) -> bool {
    let mut subject_tokens = subject.split('.');

    for pattern_token in pattern.split('.') {
        let Some(subject_token) = subject_tokens.next() else {
            return false;
        };

        match pattern_token {
            ">" => return true,
            "*" => {}
            literal if literal != subject_token => return false,
            _ => {}
        }
    }

    subject_tokens.next().is_none()
}

/// Check if some concrete subject matches both patterns
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');

    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (None, None) => return true,
            (Some(_), None) | (None, Some(_)) => return false,
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some("*"), Some(_)) | (Some(_), Some("*")) => {}
            (Some(x), Some(y)) if x != y => return false,
            _ => {}
        }
    }
}

/// Check if every subject matched by `sub` is also matched by `sup`
pub fn pattern_is_subset(sub: &str, sup: &str) -> bool {
    let mut sub_tokens = sub.split('.');

    for sup_token in sup.split('.') {
        let Some(sub_token) = sub_tokens.next() else {
            return false;
        };

        match (sub_token, sup_token) {
            (_, ">") => return true,
            (">", _) => return false,
            ("*", "*") => {}
            ("*", _) => return false,
            (_, "*") => {}
            (x, y) if x != y => return false,
            _ => {}
        }
    }

    sub_tokens.next().is_none()
}
