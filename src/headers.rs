//! Header bag for HTTP requests and responses.

use crate::errors::{Error, Result};

/// Case-normalised, insertion-ordered, multi-valued HTTP header store.
///
/// Keys are normalised to this project's convention, first letter
/// upper-case and all remaining letters lower-case, rather than RFC
/// canonical form. A bag built from a parsed request is read-only;
/// mutating it is a state error.
#[derive(Debug, Clone, Default)]
pub struct Headers {
  entries: Vec<(String, Vec<String>)>,
  read_only: bool,
}

impl Headers {
  /// Creates an empty, mutable bag.
  pub fn new() -> Self {
    Self::default()
  }

  /// Consumes the bag and returns a read-only copy of it.
  pub fn into_read_only(mut self) -> Self {
    self.read_only = true;
    self
  }

  /// Whether mutations are rejected.
  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  /// Sets `value` as the sole value for `key`, replacing any existing list.
  pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
    let key = self.writable_key(key)?;
    match self.entries.iter_mut().find(|(k, _)| *k == key) {
      Some((_, values)) => {
        values.clear();
        values.push(value.into());
      }
      None => self.entries.push((key, vec![value.into()])),
    }
    Ok(())
  }

  /// Appends `value` to the list of values for `key`.
  pub fn add(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
    let key = self.writable_key(key)?;
    match self.entries.iter_mut().find(|(k, _)| *k == key) {
      Some((_, values)) => values.push(value.into()),
      None => self.entries.push((key, vec![value.into()])),
    }
    Ok(())
  }

  /// Returns the first value stored under `key`, if any.
  pub fn first(&self, key: &str) -> Option<&str> {
    let key = normalize(key)?;
    self
      .entries
      .iter()
      .find(|(k, _)| *k == key)
      .and_then(|(_, values)| values.first())
      .map(String::as_str)
  }

  /// Whether a value is stored under `key`.
  pub fn contains(&self, key: &str) -> bool {
    match normalize(key) {
      Some(key) => self.entries.iter().any(|(k, _)| *k == key),
      None => false,
    }
  }

  /// Iterates over `(key, values)` pairs in insertion order of keys.
  pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
    self
      .entries
      .iter()
      .map(|(k, values)| (k.as_str(), values.as_slice()))
  }

  fn writable_key(&self, key: &str) -> Result<String> {
    if self.read_only {
      return Err(Error::state("headers are read-only"));
    }
    normalize(key).ok_or_else(|| Error::state(format!("invalid header key: {key:?}")))
  }
}

/// Normalises a header key: first character upper-cased, remaining letters
/// lower-cased, digits and separators untouched. Blank keys yield `None`.
fn normalize(key: &str) -> Option<String> {
  if key.trim().is_empty() {
    return None;
  }
  let mut out = String::with_capacity(key.len());
  for (i, c) in key.chars().enumerate() {
    if i == 0 {
      out.push(c.to_ascii_uppercase());
    } else {
      out.push(c.to_ascii_lowercase());
    }
  }
  Some(out)
}
