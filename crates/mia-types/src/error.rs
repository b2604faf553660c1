//! Machine-readable error codes.
//!
//! Every error enum in the host implements [`ErrorCode`]. Codes are
//! UPPER_SNAKE_CASE and carry a per-layer prefix:
//!
//! | Layer | Prefix |
//! |-------|--------|
//! | Process supervisor | `SUPERVISOR_` |
//! | Readiness prober | `PROBE_` |
//! | Channel gateway | `GATEWAY_` |
//! | Host orchestration | `HOST_` |
//!
//! Codes are part of the contract with the frontend (they are sent in
//! error replies), so they must not change once published.

/// Error code interface shared by all host errors.
///
/// # Example
///
/// ```
/// use mia_types::ErrorCode;
///
/// enum LinkError {
///     Refused,
///     BadPayload,
/// }
///
/// impl ErrorCode for LinkError {
///     fn code(&self) -> &'static str {
///         match self {
///             Self::Refused => "LINK_REFUSED",
///             Self::BadPayload => "LINK_BAD_PAYLOAD",
///         }
///     }
///
///     fn is_recoverable(&self) -> bool {
///         matches!(self, Self::Refused)
///     }
/// }
///
/// assert_eq!(LinkError::Refused.code(), "LINK_REFUSED");
/// assert!(!LinkError::BadPayload.is_recoverable());
/// ```
pub trait ErrorCode {
    /// Stable, prefixed, UPPER_SNAKE_CASE code.
    fn code(&self) -> &'static str;

    /// Whether retrying the same operation may succeed.
    fn is_recoverable(&self) -> bool;
}

/// Asserts that an error code is non-empty, prefixed, and UPPER_SNAKE_CASE.
///
/// Intended for tests that enumerate every variant of an error enum.
///
/// # Panics
///
/// Panics with a descriptive message when a check fails.
///
/// # Example
///
/// ```
/// use mia_types::{assert_error_code, ErrorCode};
///
/// struct Gone;
///
/// impl ErrorCode for Gone {
///     fn code(&self) -> &'static str { "HOST_GONE" }
///     fn is_recoverable(&self) -> bool { false }
/// }
///
/// assert_error_code(&Gone, "HOST_");
/// ```
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "error code '{code}' must start with prefix '{expected_prefix}'"
    );
    assert!(
        is_upper_snake_case(code),
        "error code '{code}' must be UPPER_SNAKE_CASE"
    );
}

/// Runs [`assert_error_code`] over every given error.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('_')
        && !s.ends_with('_')
        && !s.contains("__")
        && s
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum ProbeLike {
        Timeout,
        Cancelled,
    }

    impl ErrorCode for ProbeLike {
        fn code(&self) -> &'static str {
            match self {
                Self::Timeout => "PROBE_TIMEOUT",
                Self::Cancelled => "PROBE_CANCELLED",
            }
        }

        fn is_recoverable(&self) -> bool {
            matches!(self, Self::Timeout)
        }
    }

    #[test]
    fn codes_and_recoverability() {
        assert_eq!(ProbeLike::Timeout.code(), "PROBE_TIMEOUT");
        assert!(ProbeLike::Timeout.is_recoverable());
        assert!(!ProbeLike::Cancelled.is_recoverable());
    }

    #[test]
    fn all_variants_pass_validation() {
        assert_error_codes(&[ProbeLike::Timeout, ProbeLike::Cancelled], "PROBE_");
    }

    #[test]
    #[should_panic(expected = "must start with prefix")]
    fn wrong_prefix_panics() {
        assert_error_code(&ProbeLike::Timeout, "GATEWAY_");
    }

    #[test]
    fn upper_snake_case_rules() {
        assert!(is_upper_snake_case("HOST_FATAL"));
        assert!(is_upper_snake_case("A1_B2"));
        assert!(!is_upper_snake_case(""));
        assert!(!is_upper_snake_case("host_fatal"));
        assert!(!is_upper_snake_case("_HOST"));
        assert!(!is_upper_snake_case("HOST_"));
        assert!(!is_upper_snake_case("HOST__FATAL"));
    }
}
