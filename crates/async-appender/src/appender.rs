// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle facade owning one [`EventsHandler`].
//!
//! ```text
//!   activate_options():  configure ──> validate ──> activate ──> accepts events
//!   close():             stop admission ──> cancel ──> dispose ──> wait (≤ close timeout)
//! ```
//!
//! Nothing on the admission path blocks or returns an error to the producer: rejected
//! events and delivery failures are reported through the [`ErrorHandler`].

use crate::error_handler::{ErrorHandler, Tracer, TracingErrorHandler};
use crate::errors::AppenderError;
use crate::handler::{EventsHandler, HandlerCallbacks};
use crate::settings::AppenderSettings;
use crate::sink::{Sink, SinkError};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pre-activation hook allowed to rewrite the appender's settings and its sink.
pub trait Configurator<S: Sink>: Send + Sync {
    fn configure(&self, settings: &mut AppenderSettings, sink: &mut S) -> Result<(), SinkError>;
}

impl<S, F> Configurator<S> for F
where
    S: Sink,
    F: Fn(&mut AppenderSettings, &mut S) -> Result<(), SinkError> + Send + Sync,
{
    fn configure(&self, settings: &mut AppenderSettings, sink: &mut S) -> Result<(), SinkError> {
        self(settings, sink)
    }
}

pub struct AsyncAppender<S: Sink> {
    settings: AppenderSettings,
    sink: Arc<S>,
    configurator: Option<Box<dyn Configurator<S>>>,
    error_handler: Arc<dyn ErrorHandler>,
    tracer: Option<Tracer>,
    cancel: CancellationToken,
    handler: OnceLock<EventsHandler<S>>,
    activated: AtomicBool,
    accepts_events: AtomicBool,
    closing: AtomicBool,
}

impl<S: Sink> AsyncAppender<S> {
    pub fn new(sink: S) -> Self {
        Self {
            settings: AppenderSettings::default(),
            sink: Arc::new(sink),
            configurator: None,
            error_handler: Arc::new(TracingErrorHandler),
            tracer: None,
            cancel: CancellationToken::new(),
            handler: OnceLock::new(),
            activated: AtomicBool::new(false),
            accepts_events: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: AppenderSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_configurator(mut self, configurator: impl Configurator<S> + 'static) -> Self {
        self.configurator = Some(Box::new(configurator));
        self
    }

    #[must_use]
    pub fn with_error_handler(mut self, error_handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Arc::new(error_handler);
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Link the appender to a host token: cancelling it stops the router like `close`
    /// does, without waiting.
    #[must_use]
    pub fn with_cancellation_token(mut self, host: &CancellationToken) -> Self {
        self.cancel = host.child_token();
        self
    }

    pub fn settings(&self) -> &AppenderSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut AppenderSettings {
        &mut self.settings
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Mutable access to the sink, only available until activation.
    pub fn sink_mut(&mut self) -> Option<&mut S> {
        Arc::get_mut(&mut self.sink)
    }

    pub fn activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn accepts_events(&self) -> bool {
        self.accepts_events.load(Ordering::SeqCst)
    }

    pub fn is_processing(&self) -> bool {
        self.handler.get().is_some_and(EventsHandler::is_processing)
    }

    pub fn queued_events_count(&self) -> usize {
        self.handler
            .get()
            .map_or(0, EventsHandler::queued_events_count)
    }

    /// Configure, validate, then activate. Any failure is reported and leaves the
    /// appender inert.
    pub fn activate_options(&mut self) {
        if self.handler.get().is_some() {
            self.report(
                "This appender was already activated and cannot be restarted",
                Some(&AppenderError::AlreadyRunning),
            );
            return;
        }

        self.configure();

        if self.validate_self() {
            self.activate();
        }
    }

    fn configure(&mut self) {
        let Some(sink) = Arc::get_mut(&mut self.sink) else {
            return;
        };

        if let Some(configurator) = &self.configurator {
            let settings = &mut self.settings;
            let outcome = catch_unwind(AssertUnwindSafe(|| configurator.configure(settings, sink)));
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(AppenderError::Configuration(e.to_string())),
                Err(_) => Some(AppenderError::Configuration(
                    "configurator panicked".to_string(),
                )),
            };
            if let Some(error) = error {
                self.error_handler
                    .error("Error during configuration", Some(&error));
            }
        }

        if let Err(e) = sink.configure() {
            self.error_handler.error(
                "Error during configuration",
                Some(&AppenderError::Configuration(e.to_string())),
            );
        }
    }

    /// Own settings first; the sink is only asked when they are valid.
    fn validate_self(&self) -> bool {
        if let Err(e) = self.settings.validate() {
            self.report("Invalid appender settings", Some(&e));
            return false;
        }
        if let Err(e) = self.sink.validate() {
            self.report("Invalid sink configuration", Some(&AppenderError::Validation(e)));
            return false;
        }
        true
    }

    fn activate(&mut self) {
        if tokio::runtime::Handle::try_current().is_err() {
            self.report("Cannot activate appender", Some(&AppenderError::NoRuntime));
            return;
        }

        if let Some(sink) = Arc::get_mut(&mut self.sink) {
            if let Err(e) = sink.activate() {
                self.report(
                    "Cannot activate appender",
                    Some(&AppenderError::Activation(e)),
                );
                return;
            }
        }

        let error_handler = Arc::clone(&self.error_handler);
        let callbacks = HandlerCallbacks {
            on_error: Some(Arc::new(move |error: &AppenderError, _batch: &[S::Event]| {
                error_handler.error("An error occurred during events processing", Some(error));
            })),
            tracer: self.tracer.clone(),
        };
        let handler = EventsHandler::new(
            Arc::clone(&self.sink),
            self.settings.max_concurrent_processors_count,
            self.settings.max_batch_size,
            &self.cancel,
            callbacks,
        );
        if let Err(e) = handler.start() {
            self.report("Cannot start events handler", Some(&e));
            return;
        }
        if self.handler.set(handler).is_err() {
            self.report(
                "This appender was already activated and cannot be restarted",
                Some(&AppenderError::AlreadyRunning),
            );
            return;
        }

        self.activated.store(true, Ordering::SeqCst);
        self.accepts_events.store(true, Ordering::SeqCst);
        debug!(
            "Appender activated: max_batch_size={}, max_concurrent_processors_count={}",
            self.settings.max_batch_size, self.settings.max_concurrent_processors_count
        );
    }

    /// Admit one event. Never blocks, never fails: a rejected event is reported.
    pub fn append(&self, event: S::Event) {
        let Some(handler) = self.accepting_handler() else {
            return;
        };
        if let Err(e) = handler.handle(event) {
            self.report("Event was not admitted", Some(&e));
        }
    }

    /// Admit several events, preserving their order.
    pub fn append_many<I>(&self, events: I)
    where
        I: IntoIterator<Item = S::Event>,
    {
        let Some(handler) = self.accepting_handler() else {
            return;
        };
        if let Err(e) = handler.handle_many(events) {
            self.report("Events were not admitted", Some(&e));
        }
    }

    fn accepting_handler(&self) -> Option<&EventsHandler<S>> {
        let handler = self
            .handler
            .get()
            .filter(|_| self.activated() && self.accepts_events());
        if handler.is_none() {
            self.report(
                "This appender cannot process events.",
                Some(&AppenderError::NotAccepting),
            );
        }
        handler
    }

    /// Stop admission, cancel the router and wait up to the close timeout for every
    /// registered processor. Shutdown is best-effort: on timeout an error naming the
    /// processors still running is reported and the appender deactivates anyway.
    ///
    /// Calling `close` again, or on an appender that never activated, does nothing.
    pub async fn close(&self) {
        if !self.activated() || self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        self.accepts_events.store(false, Ordering::SeqCst);

        if let Some(handler) = self.handler.get() {
            self.cancel.cancel();
            handler.dispose();

            let close_timeout = self.settings.close_timeout();
            if tokio::time::timeout(close_timeout, handler.wait_for_processors())
                .await
                .is_err()
            {
                let error = AppenderError::CloseTimeout {
                    running: handler.live_processors_count(),
                    timeout: close_timeout,
                };
                self.report("Appender close did not complete", Some(&error));
            }
        }

        self.activated.store(false, Ordering::SeqCst);
        debug!("Appender closed");
    }

    /// Resolves when the handler goes from Idle to Active after this call (or is Active
    /// already).
    pub fn processing_started(
        &self,
    ) -> Result<impl Future<Output = ()> + Send + 'static, AppenderError> {
        self.handler
            .get()
            .map(EventsHandler::processing_started)
            .ok_or(AppenderError::NotActivated)
    }

    /// Resolves when the handler is Idle.
    pub fn processing_terminated(
        &self,
    ) -> Result<impl Future<Output = ()> + Send + 'static, AppenderError> {
        self.handler
            .get()
            .map(EventsHandler::processing_terminated)
            .ok_or(AppenderError::NotActivated)
    }

    fn report(&self, message: &str, error: Option<&AppenderError>) {
        self.error_handler.error(message, error);
    }
}
