// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the appender and its events handler.

use crate::sink::SinkError;
use std::time::Duration;

/// Everything the appender can report.
///
/// Only [`AppenderError::AlreadyRunning`] is ever returned to a caller as a usage
/// error; every other variant is funnelled through the
/// [`ErrorHandler`](crate::ErrorHandler).
#[derive(Debug, thiserror::Error)]
pub enum AppenderError {
    #[error("{0} must be positive.")]
    InvalidSetting(&'static str),

    #[error("Error during configuration: {0}")]
    Configuration(String),

    #[error("Error during validation: {0}")]
    Validation(SinkError),

    #[error("Error during activation: {0}")]
    Activation(SinkError),

    #[error("Activation requires a running tokio runtime")]
    NoRuntime,

    #[error("This appender cannot process events.")]
    NotAccepting,

    #[error("Appender was not activated")]
    NotActivated,

    #[error("The handler is already running.")]
    AlreadyRunning,

    #[error("The events handler has stopped; {0} events were not admitted")]
    HandlerStopped(usize),

    #[error("Processing a batch of {batch_size} events failed: {source}")]
    Dispatch {
        batch_size: usize,
        #[source]
        source: SinkError,
    },

    #[error("Processor panicked while handling a batch of {batch_size} events: {message}")]
    ProcessorPanicked { batch_size: usize, message: String },

    #[error("Processors {running} termination timed out after {}ms during appender close.", timeout.as_millis())]
    CloseTimeout { running: usize, timeout: Duration },
}
