//! Topic pattern compilation.
//!
//! A pattern is a `/`-separated template. Each segment is one of:
//!
//! | Segment  | Matches                                   | Captured |
//! |----------|-------------------------------------------|----------|
//! | `users`  | the literal segment                       | no       |
//! | `:id`    | exactly one non-empty segment             | as `id`  |
//! | `*`      | exactly one non-empty segment             | no       |
//! | `**`     | the rest of the topic (zero or more segs) | no       |
//!
//! `**` is only valid as the final segment. Patterns are compiled once into
//! an anchored [`Regex`].

use crate::errors::RegistrationError;
use conductor_common::Params;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;

/// A compiled topic pattern.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
    names: Vec<String>,
}

impl TopicPattern {
    /// Compile a pattern, rejecting malformed templates.
    pub fn compile(pattern: &str) -> Result<Self, RegistrationError> {
        let malformed = |reason: String| RegistrationError::MalformedPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if pattern.is_empty() {
            return Err(malformed("pattern is empty".to_string()));
        }

        let segments: Vec<&str> = pattern.split('/').collect();
        let last = segments.len() - 1;
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut expr = String::from("^");

        for (i, segment) in segments.iter().enumerate() {
            if *segment == "**" {
                if i != last {
                    return Err(malformed("'**' is only allowed as the final segment".to_string()));
                }
                expr.push_str(if i == 0 { ".*" } else { "(?:/.*)?" });
                continue;
            }

            if i > 0 {
                expr.push('/');
            }

            if *segment == "*" {
                expr.push_str("[^/]+");
            } else if let Some(name) = segment.strip_prefix(':') {
                if !is_valid_name(name) {
                    return Err(malformed(format!("invalid parameter name '{}'", name)));
                }
                if !seen.insert(name) {
                    return Err(malformed(format!("duplicate parameter name '{}'", name)));
                }
                expr.push_str(&format!("(?P<{}>[^/]+)", name));
                names.push(name.to_string());
            } else if segment.contains('*') {
                return Err(malformed(format!(
                    "wildcard must occupy a whole segment, found '{}'",
                    segment
                )));
            } else {
                expr.push_str(&regex::escape(segment));
            }
        }

        expr.push('$');
        let regex = Regex::new(&expr).map_err(|e| malformed(e.to_string()))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
            names,
        })
    }

    /// The pattern as it was registered.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names of the parameters this pattern captures, in order.
    pub fn param_names(&self) -> &[String] {
        &self.names
    }

    /// Whether a concrete topic matches.
    pub fn is_match(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    /// Match a concrete topic, returning the captured parameters.
    pub fn captures(&self, topic: &str) -> Option<Params> {
        let caps = self.regex.captures(topic)?;
        let params = self
            .names
            .iter()
            .filter_map(|name| {
                caps.name(name)
                    .map(|m| (name.clone(), m.as_str().to_string()))
            })
            .collect();
        Some(params)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
