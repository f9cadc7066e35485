//! The single error channel threaded through every `Fail`, `Attempt`, and
//! `Callback::on_error`.
//!
//! A resolved [`crate::program::Attempt`] must be replayable to arbitrarily many
//! waiters (memoized nodes, `EvalOnce` caches), so `Error` has to be cheaply
//! `Clone`. That's why foreign errors are boxed behind an `Arc` rather than a
//! plain `Box`.

use std::any::Any;
use std::sync::Arc;

/// The unified failure type of a [`crate::program::Program`].
///
/// Carries either a plain message, a panic caught at a node boundary, or a
/// wrapped foreign error. `source()` chains through to the foreign error so
/// that `anyhow`-style error reports still show the full cause chain.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A plain, ad-hoc failure message.
    #[error("{0}")]
    Message(String),

    /// A panic that was caught at a thunk or bind boundary and reified into
    /// the error channel instead of unwinding through the run-loop.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A foreign error, preserved via `std::error::Error`.
    #[error(transparent)]
    Custom(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Builds a [`Error::Message`] from anything that formats as a string.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Message(message.into())
    }

    /// Wraps a foreign error so it can flow through the `Program` error channel.
    pub fn custom(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Custom(Arc::new(err))
    }

    /// Builds a [`Error::Panicked`] from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Error::Panicked(panic_message(&payload))
    }
}

/// Best-effort extraction of a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_formats_as_given() {
        let e = Error::msg("boom");
        assert_eq!(e.to_string(), "boom");
    }

    #[test]
    fn clone_is_cheap_and_preserves_display() {
        let e = Error::msg("boom");
        let e2 = e.clone();
        assert_eq!(e.to_string(), e2.to_string());
    }

    #[test]
    fn custom_wraps_foreign_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("domain failure")]
        struct DomainError;

        let e = Error::custom(DomainError);
        assert_eq!(e.to_string(), "domain failure");
    }
}
