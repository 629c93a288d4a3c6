//! Logging facilities for Statecraft.
//!
//! Statecraft uses the `tracing` crate for instrumentation and never installs
//! a subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("statecraft_core::undo=debug")
//!         .init();
//! }
//! ```
//!
//! Change delivery and dependency bookkeeping log at `trace`, operation
//! lifecycle at `debug`, and protocol violations at `warn`.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Core crate target.
    pub const CORE: &str = "statecraft_core";
    /// Property change delivery.
    pub const PROPERTY: &str = "statecraft_core::property";
    /// Computed property evaluation and dependency capture.
    pub const COMPUTED: &str = "statecraft_core::computed";
    /// List property mutation events.
    pub const LIST: &str = "statecraft_core::list";
    /// Undo stack lifecycle.
    pub const UNDO: &str = "statecraft_core::undo";
    /// Performance spans.
    pub const PERF: &str = "statecraft_core::perf";
}

/// A guard that keeps a tracing span entered until dropped.
///
/// Used around undo/redo replays so their duration shows up in traces.
#[derive(Debug)]
pub struct PerfSpan {
    #[allow(dead_code)]
    span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Create a new performance span.
    ///
    /// The span will be active until the guard is dropped.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!(target: "statecraft_core::perf", "perf", operation = name);
        Self {
            span: span.entered(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_span() {
        // No subscriber installed; entering and leaving must not panic.
        let _span = PerfSpan::new("test_operation");
    }

    #[test]
    fn test_targets_are_namespaced() {
        for target in [
            targets::PROPERTY,
            targets::COMPUTED,
            targets::LIST,
            targets::UNDO,
            targets::PERF,
        ] {
            assert!(target.starts_with(targets::CORE));
        }
    }
}
