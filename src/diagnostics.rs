//! Shared message formatting for errors and warnings.
//!
//! Errors are built with `anyhow` at the call site; this module only gives
//! them a uniform prefix. Warnings go through the `log` facade so they honour
//! `RUST_LOG`.

use std::fmt::Display;

const PREFIX: &str = "pylal";

/// Format a message for use in an `anyhow` error.
pub fn error_message(msg: impl Display) -> String {
    format!("{}: {}", PREFIX, msg)
}

/// Emit a non-fatal warning.
pub fn warn(msg: impl Display) {
    log::warn!("{}", msg);
}

/// Record an item that was skipped in a best-effort batch.
pub fn skipped(what: impl Display, why: impl Display) {
    log::debug!("skipping {}: {}", what, why);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_is_prefixed() {
        assert_eq!(error_message("boom"), "pylal: boom");
    }
}
