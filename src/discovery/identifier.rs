//! Identifier Sanitizer
//!
//! Phone-number-like strings are filtered into canonical `Identifier`s
//! before they can enter any candidate, confirmed or novel set. Malformed
//! input is dropped silently: sanitization is a filter, not a validator
//! with user-facing failure.
//!
//! Rules, in order:
//! 1. Starts with the international prefix `+`
//! 2. At least one character after the prefix
//! 3. First character after the prefix is not `0`
//! 4. The remainder parses as a positive 64-bit integer and is made of
//!    ASCII digits only. A signed integer parse alone would also accept
//!    `++15551234567` or `+-1`; those are rejected here, so this rule is
//!    deliberately stricter than a plain `i64` parse of the remainder.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// International prefix every identifier carries.
pub const INTERNATIONAL_PREFIX: char = '+';

/// A sanitized, queryable phone-number identifier (e.g. `+15551234567`).
///
/// Only constructible through [`Identifier::sanitize`], so holding one
/// proves the rules above were applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Sanitize a raw string, returning `None` when any rule fails.
    pub fn sanitize(raw: &str) -> Option<Self> {
        let digits = raw.strip_prefix(INTERNATIONAL_PREFIX)?;

        let first = digits.chars().next()?;
        if first == '0' {
            return None;
        }

        // Digits only: a bare integer parse would also admit a second sign.
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        match digits.parse::<i64>() {
            Ok(value) if value > 0 => Some(Self(raw.to_string())),
            _ => None,
        }
    }

    /// Borrow the canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identifier {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Identifier::sanitize(&raw).ok_or_else(|| format!("not a valid identifier: {:?}", raw))
    }
}

impl From<Identifier> for String {
    fn from(identifier: Identifier) -> Self {
        identifier.0
    }
}

/// Sanitize every raw string, keeping only those that pass.
pub fn sanitize_all<I, S>(raw: I) -> BTreeSet<Identifier>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|s| Identifier::sanitize(s.as_ref()))
        .collect()
}
