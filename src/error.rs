//! Crate-wide error type.
//!
//! Configuration errors are fatal at load time (spec: "Configuration
//! invalid" policy); everything else is either recovered from by the state
//! machine itself or logged and dropped. Nothing in this crate panics on a
//! reachable error path.

use std::fmt;
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A configuration document failed to parse or failed validation.
    Config(String),
    /// A TLS certificate or key could not be loaded.
    Tls(String),
    /// Transport-level I/O failure (surfaced from `Transport::connect`).
    Io(io::Error),
    /// An operation was attempted before the control surface was ready,
    /// e.g. `start()` before `set_config()` completed.
    NotReady(&'static str),
    /// A command referenced a `(ca, ioa)` pair not present in the exchange
    /// table, or of an incompatible type.
    UnknownPoint { ca: u16, ioa: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Tls(msg) => write!(f, "tls error: {}", msg),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::NotReady(what) => write!(f, "not ready: {}", what),
            Error::UnknownPoint { ca, ioa } => {
                write!(f, "no exchange point for ca={} ioa={}", ca, ioa)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Config(s)
    }
}

impl<'a> From<&'a str> for Error {
    fn from(s: &'a str) -> Self {
        Error::Config(s.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_unknown_point() {
        let e = Error::UnknownPoint { ca: 1, ioa: 2000 };
        assert_eq!(e.to_string(), "no exchange point for ca=1 ioa=2000");
    }
}
