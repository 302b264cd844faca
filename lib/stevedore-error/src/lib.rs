//! Application-level error primitives.
//!
//! Library crates in this workspace define typed errors with `snafu`. Once those errors cross into application code
//! (the CLI host, runtime adapters), they are usually only reported, not matched on, so they get folded into
//! [`GenericError`] with whatever context helps the operator figure out what went wrong.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{convert::Infallible, fmt::Display};

/// A type-erased error carrying a chain of causes.
pub type GenericError = anyhow::Error;

/// Constructs a [`GenericError`].
///
/// Accepts a string literal, a format string with arguments (same rules as `std::format!`), or a single value that
/// implements `Debug` and `Display`. When that value is an existing `std::error::Error`, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
    impl<T> Sealed for Option<T> {}
}

// Wraps `anyhow::Context` so the method names don't collide with `snafu::ResultExt`/`snafu::OptionExt` in modules that
// import both.
/// Extension trait for attaching context to fallible values.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error (or the missing value) with the given context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error (or the missing value) with context that is only built once a failure actually happens.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, f)
    }
}

impl<T> ErrorContext<T, Infallible> for Option<T> {
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, Infallible>>::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, Infallible>>::with_context(self, f)
    }
}

/// Renders an error and all of its causes on a single line, outermost first.
///
/// CI hosts usually capture one line per log event, so the multi-line `Debug` rendering of [`GenericError`] tends to
/// get split apart. This joins the chain with `: ` instead.
pub fn single_line_chain(error: &GenericError) -> String {
    error
        .chain()
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Refused;

    impl Display for Refused {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "connection refused")
        }
    }

    impl std::error::Error for Refused {}

    #[test]
    fn context_is_prepended_to_chain() {
        let result: Result<(), Refused> = Err(Refused);
        let error = result
            .error_context("Failed to reach runtime.")
            .with_error_context(|| format!("Failed to start service '{}'.", "api"))
            .unwrap_err();

        assert_eq!(
            single_line_chain(&error),
            "Failed to start service 'api'.: Failed to reach runtime.: connection refused"
        );
    }

    #[test]
    fn missing_value_becomes_error() {
        let value: Option<u32> = None;
        let error = value.error_context("No exit code reported.").unwrap_err();
        assert_eq!(error.to_string(), "No exit code reported.");

        assert_eq!(Some(7).error_context("unused").unwrap(), 7);
    }

    #[test]
    fn macro_forms() {
        let literal = generic_error!("plain");
        assert_eq!(literal.to_string(), "plain");

        let formatted = generic_error!("service '{}' missing", "db");
        assert_eq!(formatted.to_string(), "service 'db' missing");

        let wrapped = generic_error!(Refused);
        assert_eq!(wrapped.to_string(), "connection refused");
    }
}
