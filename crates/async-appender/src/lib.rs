// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous batching appender.
//!
//! Decouples a high-frequency event producer from a slow, fallible sink. Events are
//! admitted without blocking, grouped into batches by a dedicated router task and
//! delivered by a bounded pool of processor tasks.
//!
//! ```text
//!   append()  ──>  admission queue  ──>  router  ──>  batch  ──>  processor (≤ N)  ──>  Sink
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod appender;
pub mod error_handler;
pub mod errors;
pub mod handler;
pub mod settings;
pub mod sink;

pub use appender::{AsyncAppender, Configurator};
pub use error_handler::{ErrorHandler, Tracer, TracingErrorHandler};
pub use errors::AppenderError;
pub use handler::{
    EventsHandler, HandlerCallbacks, HandlerErrorCallback, HandlerState, LifecycleState,
};
pub use settings::AppenderSettings;
pub use sink::{Batch, Sink, SinkError};
