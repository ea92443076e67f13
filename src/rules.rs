//! Literal search/replace rules applied to relayed chunks.

/// A literal search-and-replace pair.
///
/// Rules are applied in order, non-overlapping, to the full text of each
/// relayed chunk. A pattern that straddles a chunk boundary is not
/// replaced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
  /// The literal text to search for.
  pub search: String,
  /// The replacement text.
  pub replace: String,
}

impl Rule {
  /// Creates a rule from a literal pair.
  pub fn new(search: impl Into<String>, replace: impl Into<String>) -> Self {
    Self {
      search: search.into(),
      replace: replace.into(),
    }
  }

  /// Applies every rule in order to `text` and returns the result.
  pub fn apply_all(rules: &[Rule], text: &str) -> String {
    let mut out = text.to_owned();
    for rule in rules {
      out = out.replace(&rule.search, &rule.replace);
    }
    out
  }
}

/// Resolves the escape sequences accepted on the command line.
///
/// `\n` becomes a newline, `\r` a carriage return, `\t` a tab and `\\` a
/// single backslash.
pub fn unescape(pattern: &str) -> String {
  pattern
    .replace("\\n", "\n")
    .replace("\\r", "\r")
    .replace("\\t", "\t")
    .replace("\\\\", "\\")
}
