//! Logging setup and secret redaction.
//!
//! External-tool command lines can carry key passwords via `-pass` /
//! `-passin` arguments. Every log statement that prints a command line
//! must pass it through [`redact`] first.

use lazy_static::lazy_static;
use regex::Regex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

lazy_static! {
    static ref PASS_ARG: Regex =
        Regex::new(r"(-pass(?:in)?\s(?:pass|env):)\S+").expect("valid redaction pattern");
}

/// Replace password values in an external-tool command line with
/// `[REDACTED]`.
pub fn redact(text: &str) -> String {
    PASS_ARG.replace_all(text, "$1[REDACTED]").to_string()
}

/// Initialize the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_passin() {
        let cmd = "openssl ca -batch -keyfile /tmp/root/root.key -passin pass:hunter2";
        let redacted = redact(cmd);
        assert!(!redacted.contains("hunter2"));
        assert!(redacted.ends_with("-passin pass:[REDACTED]"));
    }

    #[test]
    fn test_redacts_pass_env() {
        let cmd = "openssl genpkey -algorithm RSA -pass env:KEY_PW";
        assert_eq!(
            redact(cmd),
            "openssl genpkey -algorithm RSA -pass env:[REDACTED]"
        );
    }

    #[test]
    fn test_leaves_other_args_alone() {
        let cmd = "openssl req -batch -new -config /tmp/a/a.conf -key /tmp/a/a.key";
        assert_eq!(redact(cmd), cmd);
    }

    #[test]
    fn test_redacts_multiple_occurrences() {
        let cmd = "tool -passin pass:one -pass pass:two";
        let redacted = redact(cmd);
        assert!(!redacted.contains("one"));
        assert!(!redacted.contains("two"));
    }
}
