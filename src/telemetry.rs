//! Structured reporting for protocol oddities and broken invariants.
//!
//! Recoverable surprises (a stale packet, a truncated replay, an empty random
//! range) are not errors, but they are worth more than a free-form log line.
//! They are reported as [`Violation`] values to a [`ViolationObserver`]. The
//! default observer forwards them to `tracing`; tests swap in a
//! [`CollectingObserver`] to assert on them.
//!
//! # Example
//!
//! ```
//! use rollback_link::telemetry::{CollectingObserver, ViolationKind, ViolationObserver};
//! use rollback_link::report_violation_to;
//! use std::sync::Arc;
//!
//! let observer: Option<Arc<dyn ViolationObserver>> = Some(Arc::new(CollectingObserver::new()));
//! report_violation_to!(
//!     &observer,
//!     rollback_link::telemetry::ViolationSeverity::Warning,
//!     ViolationKind::NetworkProtocol,
//!     "dropped input for battle {}",
//!     3
//! );
//! ```

use crate::Tick;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How bad a reported violation is, from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but handled; the operation carried on.
    Warning,
    /// Something was dropped or a fallback value was used.
    Error,
    /// Session state can no longer be trusted.
    Critical,
}

impl ViolationSeverity {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of the crate noticed the violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Input pairing or queue bookkeeping.
    InputQueue,
    /// Rollback and re-simulation.
    Fastforward,
    /// Messages that arrived out of place or for the wrong battle.
    NetworkProtocol,
    /// Replay stream problems that did not stop reading.
    Replay,
    /// A parameter outside its valid range.
    Configuration,
    /// Latency measurement and pacing.
    Timing,
}

impl ViolationKind {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InputQueue => "input_queue",
            Self::Fastforward => "fastforward",
            Self::NetworkProtocol => "network_protocol",
            Self::Replay => "replay",
            Self::Configuration => "configuration",
            Self::Timing => "timing",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reported violation.
///
/// Serializes to a flat JSON object with `tick` as an integer or `null`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Violation {
    /// How bad it is.
    pub severity: ViolationSeverity,
    /// Where it came from.
    pub kind: ViolationKind,
    /// Human-readable description.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// The simulation tick involved, if any.
    pub tick: Option<Tick>,
    /// Extra key-value context.
    pub context: BTreeMap<String, String>,
}

impl Violation {
    /// Creates a violation with no tick and no context.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            tick: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches the tick the violation concerns.
    #[must_use]
    pub fn with_tick(mut self, tick: Tick) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes the violation as compact JSON.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(tick) = self.tick {
            write!(f, ", tick={tick}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Receives reported violations.
///
/// Called inline from session code, so implementations should return quickly.
pub trait ViolationObserver: Send + Sync {
    /// Called once per violation.
    fn on_violation(&self, violation: &Violation);
}

/// Logs violations through `tracing`: warnings at `warn`, the rest at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let tick = violation
            .tick
            .map_or_else(|| "null".to_owned(), |tick| tick.to_string());
        let context = violation
            .context
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");

        match violation.severity {
            ViolationSeverity::Warning => tracing::warn!(
                severity,
                kind,
                location,
                tick = %tick,
                context = %context,
                "{}",
                violation.message
            ),
            ViolationSeverity::Error | ViolationSeverity::Critical => tracing::error!(
                severity,
                kind,
                location,
                tick = %tick,
                context = %context,
                "{}",
                violation.message
            ),
        }
    }
}

/// Keeps every violation in memory for later inspection.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Whether nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Whether a violation of `kind` has been collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Forgets everything collected.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Sends `violation` to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &Violation,
) {
    match observer {
        Some(observer) => observer.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation straight to [`TracingObserver`].
///
/// ```text
/// report_violation!(severity, kind, "message");
/// report_violation!(severity, kind, "message with {}", args);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Reports a violation to an `Option<Arc<dyn ViolationObserver>>`, falling back
/// to [`TracingObserver`].
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::Violation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_tick_and_context() {
        let violation = Violation::new(
            ViolationSeverity::Warning,
            ViolationKind::NetworkProtocol,
            "stale input",
            "session.rs:1",
        )
        .with_tick(Tick::new(42))
        .with_context("battle", "2");
        let text = violation.to_string();
        assert!(text.starts_with("[warning/network_protocol] stale input"));
        assert!(text.contains("tick=42"));
        assert!(text.contains("battle"));
    }

    #[test]
    fn serializes_tick_as_integer_or_null() {
        let violation = Violation::new(
            ViolationSeverity::Error,
            ViolationKind::Replay,
            "truncated",
            "replay.rs:1",
        );
        let json = serde_json::to_string(&violation).unwrap();
        assert!(json.contains(r#""tick":null"#), "{json}");
        assert!(json.contains(r#""kind":"replay""#), "{json}");

        let json = serde_json::to_string(&violation.with_tick(Tick::new(7))).unwrap();
        assert!(json.contains(r#""tick":7"#), "{json}");
    }

    #[test]
    fn collecting_observer_records_reports() {
        let collector = Arc::new(CollectingObserver::new());
        let observer: Option<Arc<dyn ViolationObserver>> = Some(collector.clone());
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::InputQueue,
            "queue {} full",
            "p1"
        );
        assert_eq!(collector.len(), 1);
        assert!(collector.has_violation(ViolationKind::InputQueue));
        assert!(!collector.has_violation(ViolationKind::Replay));
        assert_eq!(collector.violations()[0].message, "queue p1 full");

        collector.clear();
        assert!(collector.is_empty());
    }

    #[test]
    fn missing_observer_falls_back_to_tracing() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            &observer,
            ViolationSeverity::Critical,
            ViolationKind::Fastforward,
            "no observer"
        );
    }

    #[test]
    fn severities_are_ordered() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }
}
