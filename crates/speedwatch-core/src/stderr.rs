//! Pattern table for the measurement tool's diagnostics. The patterns are a
//! compatibility shim over free text; callers only see [`Diagnostic`].

use crate::tool_events::{Outcome, TerminalKind};
use crate::MeasurementError;
use regex::RegexSet;
use std::sync::OnceLock;

const NETWORK_PATTERNS: &[&str] = &[
    r"(?i)could not resolve",
    r"(?i)couldn't resolve",
    r"(?i)network is unreachable",
    r"(?i)no route to host",
    r"(?i)connection refused",
    r"(?i)name or service not known",
];

const SOCKET_PATTERNS: &[&str] = &[
    r"(?i)cannot open socket",
    r"(?i)operation not permitted",
    r"(?i)permission denied",
];

const OPAQUE_PATTERNS: &[&str] = &[
    r"(?i)limit reached",
    r"(?i)too many requests",
    r"(?i)configuration - could(n't| not) retrieve",
];

const NOISE_PATTERNS: &[&str] = &[
    r"(?i)timeout occurred in connect",
    r"(?i)cannot read from socket",
    r"(?i)latency test failed",
    r"(?i)server selection",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    Fatal(MeasurementError),
    Noise(MeasurementError),
    Unclassified,
}

struct PatternTable {
    network: RegexSet,
    socket: RegexSet,
    opaque: RegexSet,
    noise: RegexSet,
}

fn table() -> &'static PatternTable {
    static TABLE: OnceLock<PatternTable> = OnceLock::new();
    TABLE.get_or_init(|| PatternTable {
        network: build_set(NETWORK_PATTERNS),
        socket: build_set(SOCKET_PATTERNS),
        opaque: build_set(OPAQUE_PATTERNS),
        noise: build_set(NOISE_PATTERNS),
    })
}

fn build_set(patterns: &[&str]) -> RegexSet {
    // The pattern lists are literals covered by tests; an invalid one yields an empty set.
    RegexSet::new(patterns).unwrap_or_else(|_| RegexSet::empty())
}

/// Fatal patterns are checked before noise so a line carrying both is fatal.
pub fn classify_diagnostic(text: &str) -> Diagnostic {
    let detail = text.trim();
    if detail.is_empty() {
        return Diagnostic::Unclassified;
    }
    let table = table();
    if table.network.is_match(detail) {
        return Diagnostic::Fatal(MeasurementError::NetworkUnavailable {
            detail: detail.to_string(),
        });
    }
    if table.socket.is_match(detail) {
        return Diagnostic::Fatal(MeasurementError::socket(detail));
    }
    if table.opaque.is_match(detail) {
        return Diagnostic::Fatal(MeasurementError::UnknownToolError {
            detail: detail.to_string(),
        });
    }
    if table.noise.is_match(detail) {
        return Diagnostic::Noise(MeasurementError::ProtocolNoise {
            detail: detail.to_string(),
        });
    }
    Diagnostic::Unclassified
}

/// Maps one stderr line onto the dispatcher's outcome type.
pub fn classify_stderr_line(line: &str) -> Outcome {
    match classify_diagnostic(line) {
        Diagnostic::Fatal(err) => Outcome::Terminal(TerminalKind::Failed(err)),
        Diagnostic::Noise(err) => Outcome::Recoverable(err),
        Diagnostic::Unclassified => Outcome::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_lists_compile() {
        for patterns in [NETWORK_PATTERNS, SOCKET_PATTERNS, OPAQUE_PATTERNS, NOISE_PATTERNS] {
            assert!(RegexSet::new(patterns).is_ok());
        }
    }

    #[test]
    fn connectivity_failures_are_fatal() {
        let outcome = classify_stderr_line("[error] Could not resolve host: www.speedtest.net");
        assert!(matches!(
            outcome,
            Outcome::Terminal(TerminalKind::Failed(MeasurementError::NetworkUnavailable { .. }))
        ));
    }

    #[test]
    fn socket_failures_carry_firewall_hint() {
        match classify_diagnostic("[error] Cannot open socket: Operation not permitted") {
            Diagnostic::Fatal(MeasurementError::SocketError { hint, .. }) => {
                assert!(hint.contains("firewall"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn transient_noise_does_not_terminate() {
        let outcome =
            classify_stderr_line("[error] Error: [0] Timeout occurred in connect. (server 1234)");
        assert!(matches!(
            outcome,
            Outcome::Recoverable(MeasurementError::ProtocolNoise { .. })
        ));
        assert_eq!(classify_stderr_line("   "), Outcome::Ignored);
        assert_eq!(classify_stderr_line("[info] warming up"), Outcome::Ignored);
    }

    #[test]
    fn fatal_wins_over_noise_on_the_same_line() {
        let outcome = classify_stderr_line("Cannot read from socket: Network is unreachable");
        assert!(matches!(
            outcome,
            Outcome::Terminal(TerminalKind::Failed(MeasurementError::NetworkUnavailable { .. }))
        ));
    }

    #[test]
    fn rate_limits_are_opaque_and_retryable() {
        match classify_diagnostic("Limit reached: too many tests") {
            Diagnostic::Fatal(err) => {
                assert_eq!(err.code(), "unknown_tool_error");
                assert!(err.retryable());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
