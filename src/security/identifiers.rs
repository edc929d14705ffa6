//! Identifier handling for table references and policy patterns.
//!
//! Bracket (`[name]`) and backtick (`` `name` ``) quoting are removed, embedded
//! doubled delimiters are collapsed, and names are compared lowercased.

use crate::error::GuardError;
use std::fmt;

/// Maximum length of a single identifier part.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Dotted name such as `sales.orders`, stored lowercased and unquoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    parts: Vec<String>,
}

impl QualifiedName {
    pub fn new(parts: Vec<String>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Last part (the object name itself).
    pub fn object(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or("")
    }

    /// Schema part, when the name has exactly two parts.
    pub fn schema(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [schema, _] => Some(schema.as_str()),
            _ => None,
        }
    }

    /// Whether the name can be resolved without guessing: one or two
    /// non-empty parts.
    pub fn is_resolvable(&self) -> bool {
        (1..=2).contains(&self.parts.len()) && self.parts.iter().all(|p| !p.is_empty())
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.parts.join("."))
    }
}

/// Strip one level of bracket or backtick quoting and lowercase.
///
/// ```
/// use sqlguard::security::unquote_identifier;
///
/// assert_eq!(unquote_identifier("[Order Items]"), "order items");
/// assert_eq!(unquote_identifier("`a``b`"), "a`b");
/// assert_eq!(unquote_identifier("Users"), "users");
/// ```
pub fn unquote_identifier(identifier: &str) -> String {
    let trimmed = identifier.trim();
    let inner = if let Some(rest) = trimmed.strip_prefix('[') {
        rest.strip_suffix(']').unwrap_or(rest).replace("]]", "]")
    } else if let Some(rest) = trimmed.strip_prefix('`') {
        rest.strip_suffix('`').unwrap_or(rest).replace("``", "`")
    } else {
        trimmed.to_string()
    };
    inner.to_lowercase()
}

/// Parse a dotted identifier as it appears in a policy file.
///
/// Quoted parts may contain dots: `[my.schema].orders` has two parts.
pub fn parse_qualified_name(identifier: &str) -> Result<QualifiedName, GuardError> {
    if identifier.trim().is_empty() {
        return Err(GuardError::invalid_input("Identifier cannot be empty"));
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut closing: Option<char> = None;

    for ch in identifier.trim().chars() {
        match closing {
            Some(close) if ch == close => {
                closing = None;
                current.push(ch);
            }
            Some(_) => current.push(ch),
            None => match ch {
                '[' => {
                    closing = Some(']');
                    current.push(ch);
                }
                '`' => {
                    closing = Some('`');
                    current.push(ch);
                }
                '.' => parts.push(unquote_identifier(&std::mem::take(&mut current))),
                _ => current.push(ch),
            },
        }
    }
    parts.push(unquote_identifier(&current));

    for part in &parts {
        if part.len() > MAX_IDENTIFIER_LENGTH {
            return Err(GuardError::invalid_input(format!(
                "Identifier exceeds maximum length of {} characters",
                MAX_IDENTIFIER_LENGTH
            )));
        }
    }

    Ok(QualifiedName::new(parts))
}

/// Reject character sequences that never belong in an identifier.
pub fn validate_identifier(identifier: &str) -> Result<(), GuardError> {
    if identifier.is_empty() {
        return Err(GuardError::invalid_input("Identifier cannot be empty"));
    }

    let dangerous_patterns = [
        "--",   // SQL comment
        "/*",   // Multi-line comment start
        "*/",   // Multi-line comment end
        ";",    // Statement separator
        "'",    // String delimiter
        "\"",   // Quoted literal delimiter
        "\\",   // Escape character
        "\x00", // Null byte
    ];

    for pattern in &dangerous_patterns {
        if identifier.contains(pattern) {
            return Err(GuardError::invalid_input(format!(
                "Identifier contains forbidden character sequence: {}",
                pattern.escape_default()
            )));
        }
    }

    Ok(())
}
