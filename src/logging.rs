//! Logging setup and the exception-logging sink.
//!
//! Work scheduled by the engine (job execution, queued commands) never
//! propagates failures to its caller. Those failures are handed to an
//! [`ExceptionLogger`], which by default forwards them to `tracing`.

use anyhow::anyhow;
use std::any::Any;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Sink for failures that are contained instead of propagated
pub trait ExceptionLogger: Send + Sync {
    fn log_exception(&self, context: &str, error: &anyhow::Error);
}

/// Default logger reporting through `tracing::error!`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExceptionLogger;

impl ExceptionLogger for TracingExceptionLogger {
    fn log_exception(&self, context: &str, error: &anyhow::Error) {
        error!(context, "{:#}", error);
    }
}

/// Initialize the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling this more than
/// once is harmless; later calls leave the first subscriber in place.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

/// Convert a caught panic payload into an error carrying its message
pub(crate) fn panic_to_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };
    anyhow!("panicked: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;

    #[test]
    fn test_panic_to_error_keeps_message() {
        let payload = catch_unwind(|| {
            if true {
                panic!("boom {}", 7)
            }
        })
        .unwrap_err();
        assert_eq!(panic_to_error(payload).to_string(), "panicked: boom 7");

        let payload = catch_unwind(|| {
            if true {
                panic!("static")
            }
        })
        .unwrap_err();
        assert_eq!(panic_to_error(payload).to_string(), "panicked: static");
    }
}
