// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Side-effecting callbacks used to surface errors and trace messages.

use crate::errors::AppenderError;
use std::sync::Arc;
use tracing::error;

/// Receives every error the appender does not propagate to its caller.
///
/// Implementations must not panic: they run on the producer's call path when an
/// event is rejected at admission.
pub trait ErrorHandler: Send + Sync {
    fn error(&self, message: &str, error: Option<&AppenderError>);
}

impl<F> ErrorHandler for F
where
    F: Fn(&str, Option<&AppenderError>) + Send + Sync,
{
    fn error(&self, message: &str, error: Option<&AppenderError>) {
        self(message, error)
    }
}

/// Default handler, forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn error(&self, message: &str, error: Option<&AppenderError>) {
        match error {
            Some(e) => error!("{message}: {e}"),
            None => error!("{message}"),
        }
    }
}

/// Optional sink for the handler's trace messages ("Router started.", "Idle", ...).
pub type Tracer = Arc<dyn Fn(&str) + Send + Sync>;
