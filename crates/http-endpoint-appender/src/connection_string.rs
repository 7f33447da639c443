// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `key=value;key=value` connection strings.
//!
//! Keys are trimmed and case-insensitive. A value may be wrapped in single or double
//! quotes, in which case it may contain `;` and a doubled quote stands for a literal
//! one. Unquoted values run to the next `;` and may contain `=`.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionStringError {
    #[error("Format of the connection string is invalid near '{0}'")]
    MissingSeparator(String),
    #[error("Connection string contains an empty key")]
    EmptyKey,
    #[error("Unterminated quoted value for key '{0}'")]
    UnterminatedQuote(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    values: HashMap<String, String>,
}

impl ConnectionString {
    /// Value of the first alias present, aliases compared case-insensitively.
    pub fn get(&self, aliases: &[&str]) -> Option<&str> {
        aliases
            .iter()
            .find_map(|alias| self.values.get(&alias.to_ascii_lowercase()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub fn parse(input: &str) -> Result<ConnectionString, ConnectionStringError> {
    let mut values = HashMap::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start_matches(|c: char| c == ';' || c.is_whitespace());
        if rest.is_empty() {
            break;
        }

        let segment_end = rest.find(';').unwrap_or(rest.len());
        let Some(eq) = rest[..segment_end].find('=') else {
            return Err(ConnectionStringError::MissingSeparator(
                rest[..segment_end].trim().to_string(),
            ));
        };
        let key = rest[..eq].trim();
        if key.is_empty() {
            return Err(ConnectionStringError::EmptyKey);
        }

        let after_eq = &rest[eq + 1..];
        let trimmed = after_eq.trim_start();
        let (value, remaining) = match trimmed.chars().next() {
            Some(quote @ ('"' | '\'')) => parse_quoted(&trimmed[1..], quote)
                .ok_or_else(|| ConnectionStringError::UnterminatedQuote(key.to_string()))?,
            _ => {
                let end = after_eq.find(';').unwrap_or(after_eq.len());
                (after_eq[..end].trim().to_string(), &after_eq[end..])
            }
        };

        values.insert(key.to_ascii_lowercase(), value);
        rest = remaining;
    }

    Ok(ConnectionString { values })
}

/// Returns the unescaped value and what follows the closing quote.
fn parse_quoted(input: &str, quote: char) -> Option<(String, &str)> {
    let mut value = String::new();
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != quote {
            value.push(c);
            continue;
        }
        if chars.peek().map(|&(_, next)| next) == Some(quote) {
            value.push(quote);
            chars.next();
            continue;
        }
        return Some((value, &input[i + c.len_utf8()..]));
    }
    None
}
