//! Structured telemetry for protocol violations.
//!
//! Violations are structured data rather than bare log lines. They can be:
//!
//! - Logged via tracing (default behavior)
//! - Collected programmatically for testing
//! - Sent to custom observers (metrics, alerting, etc.)
//!
//! # Example
//!
//! ```
//! use kart_netsync::telemetry::{CollectingObserver, ViolationKind};
//! use std::sync::Arc;
//!
//! let observer = Arc::new(CollectingObserver::new());
//! assert!(!observer.has_violation(ViolationKind::Trust));
//! ```

use crate::{NodeId, Tic};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Severity of a protocol violation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but recoverable. The offending input was dropped.
    Warning,
    /// Serious issue. A peer was refused, kicked or resynchronized.
    Error,
    /// Internal invariant broken. Local state may be inconsistent.
    Critical,
}

impl ViolationSeverity {
    /// Returns a string representation suitable for logging/metrics labels.
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

/// Categories of protocol violations, one per subsystem.
///
/// This enum is marked `#[non_exhaustive]`; always include a wildcard arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Tic ordering, ring buffer or consistency problems.
    ///
    /// Examples:
    /// - A ticcmd older than the ring depth
    /// - A client consistency value that differs from the server's
    TicSync,
    /// Acknowledgment or retransmission problems.
    Reliability,
    /// Malformed datagrams and unexpected packets.
    ///
    /// Examples:
    /// - Checksum mismatch
    /// - Unknown packet kind
    /// - A packet that is not valid in the sender's join state
    NetworkProtocol,
    /// File and gamestate transfer problems.
    FileTransfer,
    /// Signature, challenge and key problems.
    Trust,
    /// Node or player slot bookkeeping problems.
    Directory,
    /// Invalid configuration values.
    Configuration,
    /// Internal errors that indicate a bug in this library.
    InternalError,
}

impl ViolationKind {
    /// Returns a string representation suitable for logging/metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TicSync => "tic_sync",
            Self::Reliability => "reliability",
            Self::NetworkProtocol => "network_protocol",
            Self::FileTransfer => "file_transfer",
            Self::Trust => "trust",
            Self::Directory => "directory",
            Self::Configuration => "configuration",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured record of a protocol violation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProtocolViolation {
    /// The severity level of this violation.
    pub severity: ViolationSeverity,
    /// The subsystem where the violation occurred.
    pub kind: ViolationKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Source location where the violation was detected (file:line).
    pub location: &'static str,
    /// The tic at which the violation occurred, if applicable.
    pub tic: Option<Tic>,
    /// The remote node involved, if any.
    pub node: Option<NodeId>,
    /// Additional structured context as key-value pairs.
    pub context: BTreeMap<String, String>,
}

impl ProtocolViolation {
    /// Creates a new violation.
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
            tic: None,
            node: None,
            context: BTreeMap::new(),
        }
    }

    /// Sets the tic at which this violation occurred.
    #[must_use]
    pub fn with_tic(mut self, tic: Tic) -> Self {
        self.tic = Some(tic);
        self
    }

    /// Sets the node involved in this violation.
    #[must_use]
    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    /// Adds a context key-value pair.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Serializes this violation to a JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    /// Serializes this violation to a pretty-printed JSON string.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json_pretty(&self) -> Option<String> {
        serde_json::to_string_pretty(self).ok()
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        if let Some(tic) = self.tic {
            write!(f, ", tic={tic}")?;
        }
        if let Some(node) = self.node {
            write!(f, ", {node}")?;
        }
        if !self.context.is_empty() {
            write!(f, ", context={:?}", self.context)?;
        }
        write!(f, ")")
    }
}

/// Trait for observing protocol violations.
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called when a violation is detected. Should return quickly.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Trait for observing protocol violations.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Called when a violation is detected. Should return quickly.
    fn on_violation(&self, violation: &ProtocolViolation);
}

/// Built-in observer that logs violations via the `tracing` crate.
///
/// - `Warning` severity → `tracing::warn!`
/// - `Error` and `Critical` severity → `tracing::error!`
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a new tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        let severity = violation.severity.as_str();
        let kind = violation.kind.as_str();
        let location = violation.location;
        let tic = violation
            .tic
            .map_or_else(|| "null".to_owned(), |t| t.to_string());
        let node = violation
            .node
            .map_or_else(|| "null".to_owned(), |n| n.to_string());
        let context = if violation.context.is_empty() {
            "{}".to_owned()
        } else {
            let pairs: Vec<String> = violation
                .context
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        };

        match violation.severity {
            ViolationSeverity::Warning => {
                tracing::warn!(
                    severity,
                    kind,
                    location,
                    tic = %tic,
                    node = %node,
                    context = %context,
                    "{}",
                    violation.message
                );
            },
            ViolationSeverity::Error | ViolationSeverity::Critical => {
                tracing::error!(
                    severity,
                    kind,
                    location,
                    tic = %tic,
                    node = %node,
                    context = %context,
                    "{}",
                    violation.message
                );
            },
        }
    }
}

/// Built-in observer that collects violations for testing.
///
/// ```
/// use kart_netsync::telemetry::{
///     CollectingObserver, ProtocolViolation, ViolationKind, ViolationObserver, ViolationSeverity,
/// };
///
/// let observer = CollectingObserver::new();
/// observer.on_violation(&ProtocolViolation::new(
///     ViolationSeverity::Warning,
///     ViolationKind::NetworkProtocol,
///     "bad checksum",
///     "test.rs:1",
/// ));
/// assert_eq!(observer.len(), 1);
/// assert!(observer.has_violation(ViolationKind::NetworkProtocol));
/// ```
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<ProtocolViolation>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer with an empty violation list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every collected violation.
    #[must_use]
    pub fn violations(&self) -> Vec<ProtocolViolation> {
        self.violations.lock().clone()
    }

    /// Number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns `true` if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Returns `true` if a violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Returns every violation of `kind`.
    #[must_use]
    pub fn violations_of_kind(&self, kind: ViolationKind) -> Vec<ProtocolViolation> {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.kind == kind)
            .cloned()
            .collect()
    }

    /// Clears the collected violations.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &ProtocolViolation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Reports a violation to an optional observer, falling back to [`TracingObserver`] if `None`.
pub fn report_to_observer<O: ViolationObserver + ?Sized>(
    observer: Option<&Arc<O>>,
    violation: &ProtocolViolation,
) {
    match observer {
        Some(obs) => obs.on_violation(violation),
        None => TracingObserver.on_violation(violation),
    }
}

/// Reports a violation with the current source location through [`TracingObserver`].
///
/// ```
/// use kart_netsync::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::NetworkProtocol,
///     "dropped {} bytes from unknown peer", 12);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $msg:literal) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};

    ($severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        use $crate::telemetry::ViolationObserver as _;
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::TracingObserver.on_violation(&violation);
    }};
}

/// Reports a violation through a session's optional observer, falling back
/// to [`TracingObserver`].
///
/// ```
/// use kart_netsync::{report_violation_to, telemetry::{CollectingObserver, ViolationKind, ViolationObserver, ViolationSeverity}};
/// use std::sync::Arc;
///
/// let observer: Option<Arc<dyn ViolationObserver>> = Some(Arc::new(CollectingObserver::new()));
/// report_violation_to!(&observer, ViolationSeverity::Warning, ViolationKind::Trust,
///     "challenge from {} rejected", "10.0.0.1");
/// ```
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $msg:literal) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            $msg,
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};

    ($observer:expr, $severity:expr, $kind:expr, $fmt:literal, $($arg:tt)+) => {{
        let violation = $crate::telemetry::ProtocolViolation::new(
            $severity,
            $kind,
            format!($fmt, $($arg)+),
            concat!(file!(), ":", line!()),
        );
        $crate::telemetry::report_to_observer($observer.as_ref(), &violation);
    }};
}

/// Asserts that a violation of the specified kind was collected.
#[macro_export]
macro_rules! assert_violation {
    ($observer:expr, $kind:expr) => {{
        assert!(
            $observer.has_violation($kind),
            "Expected violation of kind {:?}, but found: {:#?}",
            $kind,
            $observer.violations()
        );
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
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_includes_tic_and_node() {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Error,
            ViolationKind::TicSync,
            "consistency mismatch",
            "server.rs:10",
        )
        .with_tic(Tic::new(42))
        .with_node(NodeId::new(3).unwrap())
        .with_context("local", "17");
        let text = violation.to_string();
        assert!(text.contains("[error/tic_sync]"));
        assert!(text.contains("tic=42"));
        assert!(text.contains("node3"));
        assert!(text.contains("local"));
    }

    #[test]
    fn collecting_observer_filters_by_kind() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            &observer,
            ViolationSeverity::Warning,
            ViolationKind::Directory,
            "falls back to tracing"
        );

        let collecting = Arc::new(CollectingObserver::new());
        report_to_observer(
            Some(&collecting),
            &ProtocolViolation::new(
                ViolationSeverity::Warning,
                ViolationKind::Reliability,
                "resend",
                "x.rs:1",
            ),
        );
        report_to_observer(
            Some(&collecting),
            &ProtocolViolation::new(
                ViolationSeverity::Error,
                ViolationKind::Trust,
                "bad signature",
                "x.rs:2",
            ),
        );
        assert_eq!(collecting.len(), 2);
        assert_eq!(collecting.violations_of_kind(ViolationKind::Trust).len(), 1);
        assert_violation!(collecting, ViolationKind::Reliability);
        collecting.clear();
        assert!(collecting.is_empty());
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_serialization_uses_snake_case() {
        let violation = ProtocolViolation::new(
            ViolationSeverity::Warning,
            ViolationKind::FileTransfer,
            "stale fragment",
            "x.rs:3",
        );
        let json = violation.to_json().unwrap();
        assert!(json.contains(r#""kind":"file_transfer""#));
    }
}
