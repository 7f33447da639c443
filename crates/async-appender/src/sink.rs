// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The delivery seam between the appender and the outside world.

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// An ordered, immutable group of events handed to one processor.
pub type Batch<E> = Arc<[E]>;

pub type SinkError = Box<dyn Error + Send + Sync>;

/// Delivery target consuming one batch at a time.
///
/// The appender never retries a batch: a sink that wants retries owns that policy,
/// as well as its own timeouts. `process` may take arbitrarily long; `close` only
/// waits for it up to the configured close timeout.
///
/// `process` runs on the same tokio workers as the router, so it must not block the
/// executor: heavy synchronous work belongs in `tokio::task::spawn_blocking`.
///
/// The lifecycle hooks run in order during `activate_options`: `configure` (after the
/// injected configurator), `validate` (only when the appender's own settings are
/// valid), then `activate`.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    type Event: Send + Sync + 'static;

    /// Pre-activation adjustments. An error is reported and activation continues.
    fn configure(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Sink-specific checks. An error keeps the appender inactive.
    fn validate(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Last preparation step before the handler starts. An error keeps the appender
    /// inactive.
    fn activate(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Deliver `batch`. The token is cancelled when the appender closes, except for
    /// batches flushed by the final drain, which receive a token that never fires.
    async fn process(
        &self,
        batch: Batch<Self::Event>,
        cancel: CancellationToken,
    ) -> Result<(), SinkError>;
}
