//! C9 (ambient): structured audit records alongside the `log` crate's
//! leveled diagnostics (spec.md §7: code `SRVFL`, outcomes
//! `SUCCESS/INFORMATION/WARNING/FAILURE`).
//!
//! The teacher logs formatted, human-scannable lines through `log::info!`/
//! `log::warn!` everywhere rather than routing through a separate sink
//! object; this crate's audit trail follows the same convention; a
//! persistent audit *store* is out of scope (spec.md §1 Non-goals), the
//! structured log line is not.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Information,
    Warning,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "SUCCESS",
            Outcome::Information => "INFORMATION",
            Outcome::Warning => "WARNING",
            Outcome::Failure => "FAILURE",
        };
        write!(f, "{}", s)
    }
}

/// Emits one audit line. `code` is always `"SRVFL"` per spec.md §7; it is
/// still taken as a parameter rather than hardcoded so a future audit code
/// doesn't require touching every call site.
pub fn record(code: &str, outcome: Outcome, endpoint_tag: &str, message: &str) {
    match outcome {
        Outcome::Success | Outcome::Information => {
            log::info!(
                "audit code={} outcome={} endpoint={} msg={}",
                code,
                outcome,
                endpoint_tag,
                message
            );
        }
        Outcome::Warning => {
            log::warn!(
                "audit code={} outcome={} endpoint={} msg={}",
                code,
                outcome,
                endpoint_tag,
                message
            );
        }
        Outcome::Failure => {
            log::error!(
                "audit code={} outcome={} endpoint={} msg={}",
                code,
                outcome,
                endpoint_tag,
                message
            );
        }
    }
}
