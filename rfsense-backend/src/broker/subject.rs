//! Subject syntax and wildcard matching.
//!
//! Subjects are hierarchical tokens separated by `.` or `/`
//! (`node.all`, `node/abc/stats`). Subscription patterns may use `*` for
//! exactly one token and `>` as the last token for "one or more".

use super::BrokerError;

const SEPARATORS: [char; 2] = ['.', '/'];

fn tokens(subject: &str) -> impl Iterator<Item = &str> {
    subject.split(SEPARATORS)
}

/// Checks a concrete subject used for publishing: no empty token, no wildcard.
pub fn validate_subject(subject: &str) -> Result<(), BrokerError> {
    if subject.is_empty() {
        return Err(BrokerError::InvalidSubject(subject.to_string()));
    }
    for token in tokens(subject) {
        if token.is_empty() || token == "*" || token == ">" {
            return Err(BrokerError::InvalidSubject(subject.to_string()));
        }
    }
    Ok(())
}

/// Checks a subscription pattern: no empty token, `>` only in last position.
pub fn validate_pattern(pattern: &str) -> Result<(), BrokerError> {
    if pattern.is_empty() {
        return Err(BrokerError::InvalidSubject(pattern.to_string()));
    }
    let parts: Vec<&str> = tokens(pattern).collect();
    for (i, token) in parts.iter().enumerate() {
        if token.is_empty() || (*token == ">" && i + 1 != parts.len()) {
            return Err(BrokerError::InvalidSubject(pattern.to_string()));
        }
    }
    Ok(())
}

/// Whether `pattern` would receive a message published on `subject`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = tokens(pattern);
    let mut sub = tokens(subject);

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
