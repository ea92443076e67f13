//! Line-oriented message log.

use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;

/// Sink for the per-connection message dump.
///
/// The proxy reports every relayed chunk, routing decision and connection
/// event as one formatted line. The sink decouples that reporting from the
/// output channel: the CLI prints to stdout, tests collect lines into a
/// buffer.
#[derive(Clone)]
pub struct LogSink {
  inner: Arc<dyn Fn(String) + Send + Sync>,
}

impl LogSink {
  /// Creates a sink from a line consumer.
  pub fn new<F>(f: F) -> Self
  where
    F: Fn(String) + Send + Sync + 'static,
  {
    Self { inner: Arc::new(f) }
  }

  /// A sink that prints each line to stdout.
  pub fn stdout() -> Self {
    Self::new(|line| println!("{line}"))
  }

  /// Emits one line.
  pub fn emit(&self, line: impl Into<String>) {
    (self.inner)(line.into())
  }
}

impl Default for LogSink {
  fn default() -> Self {
    Self::stdout()
  }
}

impl std::fmt::Debug for LogSink {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LogSink").finish_non_exhaustive()
  }
}

/// Formats the current time as `yyyyMMdd-HHmmss.SSS` for log lines.
pub(crate) fn timestamp() -> String {
  let format =
    format_description!("[year][month][day]-[hour][minute][second].[subsecond digits:3]");
  OffsetDateTime::now_utc()
    .format(&format)
    .unwrap_or_else(|_| String::from("00000000-000000.000"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  #[test]
  fn sink_collects_lines() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let collected = lines.clone();
    let sink = LogSink::new(move |line| collected.lock().unwrap().push(line));
    sink.emit("one");
    sink.emit(String::from("two"));
    assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
  }

  #[test]
  fn timestamp_has_expected_shape() {
    let ts = timestamp();
    // yyyyMMdd-HHmmss.SSS
    assert_eq!(ts.len(), 19);
    assert_eq!(&ts[8..9], "-");
    assert_eq!(&ts[15..16], ".");
  }
}
