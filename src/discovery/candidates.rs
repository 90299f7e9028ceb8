//! Candidate Set Builder
//!
//! CandidateSet = sanitize(recipient numbers) ∪ sanitize(formatted contact numbers).
//! Pure: no side effects, recomputed on every refresh.

use super::identifier::{sanitize_all, Identifier};
use std::collections::BTreeSet;

/// Turns a system contact display number into something the sanitizer can accept.
pub trait NumberFormatter: Send + Sync {
    fn format(&self, display_number: &str) -> String;
}

/// Default formatter: drops visual separators, nothing else.
///
/// `"+1 (555) 123-4567"` becomes `"+15551234567"`. Numbers without an
/// international prefix are left for the sanitizer to reject.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeparatorStripping;

impl NumberFormatter for SeparatorStripping {
    fn format(&self, display_number: &str) -> String {
        display_number
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '\u{a0}'))
            .collect()
    }
}

/// Build the candidate set from recipient and contact numbers.
pub fn build_candidate_set<R, C>(
    recipient_numbers: R,
    contact_numbers: C,
    formatter: &dyn NumberFormatter,
) -> BTreeSet<Identifier>
where
    R: IntoIterator,
    R::Item: AsRef<str>,
    C: IntoIterator,
    C::Item: AsRef<str>,
{
    let mut candidates = sanitize_all(recipient_numbers);
    candidates.extend(sanitize_all(
        contact_numbers
            .into_iter()
            .map(|n| formatter.format(n.as_ref())),
    ));
    candidates
}

/// NovelSet = candidates − confirmed. Always disjoint from `confirmed`.
pub fn novel_identifiers(
    candidates: &BTreeSet<Identifier>,
    confirmed: &BTreeSet<Identifier>,
) -> BTreeSet<Identifier> {
    candidates.difference(confirmed).cloned().collect()
}
