//! Shared `Result` alias.
//!
//! Fallible blockflow APIs return `Result<T, E>` where `E` is the calling
//! crate's own error enum (`GraphError`, `RegistryError`, `ExecutorError`,
//! ...) wrapped in a rootcause [`Report`]. Callers match on
//! `report.current_context()` to branch on the error kind; the report keeps
//! any context added on the way up for logging.

use rootcause::Report;

/// `std::result::Result` with the error side wrapped in a [`Report`].
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug, PartialEq)]
    enum LookupError {
        Missing { key: String },
    }

    impl fmt::Display for LookupError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Missing { key } => write!(f, "no entry for {key}"),
            }
        }
    }

    impl std::error::Error for LookupError {}

    fn lookup(key: &str) -> Result<u32, LookupError> {
        match key {
            "a" => Ok(1),
            _ => Err(LookupError::Missing {
                key: key.to_string(),
            })?,
        }
    }

    #[test]
    fn domain_errors_become_reports_with_their_context() {
        assert_eq!(lookup("a").ok(), Some(1));

        let report = lookup("b").expect_err("missing key");
        assert_eq!(
            report.current_context(),
            &LookupError::Missing { key: "b".into() }
        );
        assert!(report.to_string().contains("no entry for b"));
    }
}
