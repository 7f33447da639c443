// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Router and bounded processor pool turning an event stream into delivered batches.
//!
//! # Architecture
//!
//! ```text
//!   handle()          ┌──────────┐   sealed batch   ┌─────────────┐
//!   ───────> queue ──>│  router  │ ───────────────> │ processor 1 │ ──> Sink
//!   (unbounded)       │ (1 task) │    (slot wait)   │     ...     │
//!                     └──────────┘                  │ processor N │ ──> Sink
//!                                                   └─────────────┘
//! ```
//!
//! The router drains the queue greedily: it keeps moving events into its buffer until
//! the queue is observed empty or the buffer holds `max_batch_size` events, then seals
//! the buffer. A sealed batch waits for one of `max_concurrent_processors_count`
//! slots; while it waits the router keeps draining into the next buffer, so neither
//! producers nor the queue are ever gated by the dispatch limit.
//!
//! # Idle / Active
//!
//! The handler is Idle exactly when the queue is empty, nothing is buffered and no
//! processor is alive. Both transitions happen inside `watch::Sender::send_if_modified`,
//! which is the single critical section of the handler. Counters are always moved so
//! that their sum never transiently reaches zero while work exists: an admitted event
//! is counted as queued before it is sent, as buffered before it stops being queued,
//! and its processor is counted as live before the batch stops being buffered.

use crate::error_handler::Tracer;
use crate::errors::AppenderError;
use crate::sink::{Batch, Sink};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace};

/// Receives the error of a failed batch together with the batch itself.
pub type HandlerErrorCallback<E> = Arc<dyn Fn(&AppenderError, &[E]) + Send + Sync>;

/// Whether any work is queued, buffered or in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    /// Cancellation was observed, the router is flushing what it already admitted.
    Cancelling,
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Activity {
    state: HandlerState,
    /// Incremented on every Idle -> Active transition.
    wave: u64,
}

/// Optional callbacks installed when the handler is built.
pub struct HandlerCallbacks<E> {
    pub on_error: Option<HandlerErrorCallback<E>>,
    pub tracer: Option<Tracer>,
}

impl<E> Default for HandlerCallbacks<E> {
    fn default() -> Self {
        Self {
            on_error: None,
            tracer: None,
        }
    }
}

struct Shared<S: Sink> {
    sink: Arc<S>,
    max_batch_size: usize,
    max_concurrent_processors_count: usize,
    slots: Arc<Semaphore>,
    queued: AtomicUsize,
    buffered: AtomicUsize,
    live: AtomicUsize,
    activity: watch::Sender<Activity>,
    lifecycle: Mutex<LifecycleState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    callbacks: HandlerCallbacks<S::Event>,
}

/// Admission queue, router and processor pool for one sink.
///
/// A handler is started once. Dropping it closes the admission queue, which makes the
/// router flush what it holds and exit.
pub struct EventsHandler<S: Sink> {
    shared: Arc<Shared<S>>,
    tx: mpsc::UnboundedSender<S::Event>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<S::Event>>>,
}

impl<S: Sink> EventsHandler<S> {
    /// `cancel` is the host token; the handler links its own dispose token to it.
    /// Limits below one are raised to one.
    pub fn new(
        sink: Arc<S>,
        max_concurrent_processors_count: usize,
        max_batch_size: usize,
        cancel: &CancellationToken,
        callbacks: HandlerCallbacks<S::Event>,
    ) -> Self {
        let max_concurrent_processors_count = max_concurrent_processors_count.max(1);
        let max_batch_size = max_batch_size.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let (activity, _) = watch::channel(Activity {
            state: HandlerState::Idle,
            wave: 0,
        });

        let shared = Arc::new(Shared {
            sink,
            max_batch_size,
            max_concurrent_processors_count,
            slots: Arc::new(Semaphore::new(max_concurrent_processors_count)),
            queued: AtomicUsize::new(0),
            buffered: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            activity,
            lifecycle: Mutex::new(LifecycleState::NotStarted),
            cancel: cancel.child_token(),
            tracker: TaskTracker::new(),
            callbacks,
        });

        Self {
            shared,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.shared.max_batch_size
    }

    pub fn max_concurrent_processors_count(&self) -> usize {
        self.shared.max_concurrent_processors_count
    }

    pub fn queued_events_count(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn live_processors_count(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn is_processing(&self) -> bool {
        self.state() == HandlerState::Active
    }

    pub fn state(&self) -> HandlerState {
        self.shared.activity.borrow().state
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.shared.lifecycle()
    }

    /// Admit one event. Never blocks; fails only once the router has stopped.
    pub fn handle(&self, event: S::Event) -> Result<(), AppenderError> {
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(event).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(AppenderError::HandlerStopped(1));
        }
        Ok(())
    }

    /// Admit every event of `events`, in order. Returns how many were admitted.
    pub fn handle_many<I>(&self, events: I) -> Result<usize, AppenderError>
    where
        I: IntoIterator<Item = S::Event>,
    {
        let mut admitted = 0;
        let mut rejected = 0;
        for event in events {
            match self.handle(event) {
                Ok(()) => admitted += 1,
                Err(_) => rejected += 1,
            }
        }
        if rejected > 0 {
            return Err(AppenderError::HandlerStopped(rejected));
        }
        Ok(admitted)
    }

    /// Spawn the router on the current tokio runtime.
    ///
    /// Starting a running handler is a usage error. Starting a drained handler does
    /// nothing: a handler cannot be restarted.
    pub fn start(&self) -> Result<(), AppenderError> {
        let mut lifecycle = self
            .shared
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *lifecycle {
            LifecycleState::Running | LifecycleState::Cancelling => {
                return Err(AppenderError::AlreadyRunning)
            }
            LifecycleState::Drained => {
                self.shared.trace("Handler already drained, not restarting.");
                return Ok(());
            }
            LifecycleState::NotStarted => {}
        }

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AppenderError::NoRuntime);
        }
        let Some(rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Err(AppenderError::AlreadyRunning);
        };

        *lifecycle = LifecycleState::Running;
        drop(lifecycle);

        let shared = Arc::clone(&self.shared);
        self.shared.tracker.spawn(route(shared, rx));
        Ok(())
    }

    /// Resolves once a wave of processing started after this call, or immediately if
    /// the handler is already Active.
    pub fn processing_started(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.activity.subscribe();
        let wave = rx.borrow_and_update().wave;
        async move {
            let _ = rx
                .wait_for(|a| a.state == HandlerState::Active || a.wave > wave)
                .await;
        }
    }

    /// Resolves once the handler is Idle.
    pub fn processing_terminated(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.activity.subscribe();
        async move {
            let _ = rx.wait_for(|a| a.state == HandlerState::Idle).await;
        }
    }

    /// Request cancellation: the router stops waiting for events, flushes what was
    /// already admitted and exits. In-flight processors keep running.
    pub fn dispose(&self) {
        let running = self.live_processors_count();
        if running > 0 {
            self.shared.trace(&format!(
                "Disposing events handler with {running} processors."
            ));
        }

        self.shared.cancel.cancel();
        self.shared.tracker.close();

        let mut lifecycle = self
            .shared
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *lifecycle == LifecycleState::NotStarted {
            // Nothing will ever drain these.
            if let Some(mut rx) = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                rx.close();
                let mut discarded = 0;
                while rx.try_recv().is_ok() {
                    discarded += 1;
                }
                self.shared.queued.fetch_sub(discarded, Ordering::SeqCst);
                if discarded > 0 {
                    debug!("Discarded {discarded} events admitted to a handler that never started");
                }
            }
            *lifecycle = LifecycleState::Drained;
        }
    }

    /// Wait for the router and every processor it registered. Only resolves after
    /// [`dispose`](Self::dispose).
    pub async fn wait_for_processors(&self) {
        self.shared.tracker.wait().await;
    }
}

impl<S: Sink> Shared<S> {
    fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_lifecycle(&self, state: LifecycleState) {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn trace(&self, message: &str) {
        trace!("{message}");
        if let Some(tracer) = &self.callbacks.tracer {
            tracer(message);
        }
    }

    fn report(&self, error: &AppenderError, batch: &[S::Event]) {
        match &self.callbacks.on_error {
            Some(on_error) => on_error(error, batch),
            None => error!("An error occurred during events processing: {error}"),
        }
    }

    fn buffer_event(&self, buffer: &mut Vec<S::Event>, event: S::Event) {
        buffer.push(event);
        self.buffered.fetch_add(1, Ordering::SeqCst);
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.mark_active();
    }

    /// Move events into `buffer` until the queue is observed empty or the buffer is
    /// full. Returns true once the queue is closed and empty.
    fn drain_into(
        &self,
        rx: &mut mpsc::UnboundedReceiver<S::Event>,
        buffer: &mut Vec<S::Event>,
    ) -> bool {
        while buffer.len() < self.max_batch_size {
            match rx.try_recv() {
                Ok(event) => self.buffer_event(buffer, event),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
        false
    }

    fn mark_active(&self) {
        if self.activity.borrow().state == HandlerState::Active {
            return;
        }
        let started = self.activity.send_if_modified(|activity| {
            if activity.state == HandlerState::Idle {
                activity.state = HandlerState::Active;
                activity.wave += 1;
                true
            } else {
                false
            }
        });
        if started {
            self.trace("Active");
        }
    }

    fn complete_processor(&self) {
        let idle = self.activity.send_if_modified(|activity| {
            self.live.fetch_sub(1, Ordering::SeqCst);
            // Read in the order the router moves work: queued, buffered, live.
            let quiescent = self.queued.load(Ordering::SeqCst) == 0
                && self.buffered.load(Ordering::SeqCst) == 0
                && self.live.load(Ordering::SeqCst) == 0;
            if quiescent && activity.state == HandlerState::Active {
                activity.state = HandlerState::Idle;
                true
            } else {
                false
            }
        });
        if idle {
            self.trace("Idle");
        }
    }
}

fn dispatch<S: Sink>(
    shared: &Arc<Shared<S>>,
    events: Vec<S::Event>,
    permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) {
    let batch: Batch<S::Event> = events.into();
    shared.live.fetch_add(1, Ordering::SeqCst);
    shared.buffered.fetch_sub(batch.len(), Ordering::SeqCst);

    let processor = Processor {
        shared: Arc::clone(shared),
        _permit: permit,
    };
    shared.tracker.spawn(async move { processor.run(batch, cancel).await });
}

/// One unit of dispatch concurrency. Dropping it frees the slot and re-evaluates
/// idleness, whatever the outcome of the sink call.
struct Processor<S: Sink> {
    shared: Arc<Shared<S>>,
    _permit: OwnedSemaphorePermit,
}

impl<S: Sink> Processor<S> {
    async fn run(self, batch: Batch<S::Event>, cancel: CancellationToken) {
        self.shared.trace("Processor started.");

        let outcome = AssertUnwindSafe(self.shared.sink.process(Arc::clone(&batch), cancel))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                let error = AppenderError::Dispatch {
                    batch_size: batch.len(),
                    source,
                };
                self.shared.report(&error, &batch);
            }
            Err(panic) => {
                let error = AppenderError::ProcessorPanicked {
                    batch_size: batch.len(),
                    message: panic_message(panic.as_ref()),
                };
                self.shared.report(&error, &batch);
            }
        }

        self.shared.trace("Processor completed.");
    }
}

impl<S: Sink> Drop for Processor<S> {
    fn drop(&mut self) {
        self.shared.complete_processor();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn route<S: Sink>(shared: Arc<Shared<S>>, mut rx: mpsc::UnboundedReceiver<S::Event>) {
    shared.trace("Router started.");

    let max = shared.max_batch_size;
    let mut buffer: Vec<S::Event> = Vec::with_capacity(max);
    // A batch that stopped buffering and now waits for a processor slot.
    let mut sealed: Option<Vec<S::Event>> = None;

    loop {
        let closed = shared.drain_into(&mut rx, &mut buffer);
        if sealed.is_none() && !buffer.is_empty() {
            shared.trace(&format!("Dequeued {} events.", buffer.len()));
            sealed = Some(mem::replace(&mut buffer, Vec::with_capacity(max)));
        }
        if closed {
            break;
        }

        match sealed.take() {
            Some(batch) => {
                let full = buffer.len() >= max;
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => {
                        sealed = Some(batch);
                        break;
                    }
                    permit = Arc::clone(&shared.slots).acquire_owned() => match permit {
                        Ok(permit) => dispatch(&shared, batch, permit, shared.cancel.clone()),
                        Err(_) => {
                            sealed = Some(batch);
                            break;
                        }
                    },
                    received = rx.recv(), if !full => {
                        sealed = Some(batch);
                        match received {
                            Some(event) => shared.buffer_event(&mut buffer, event),
                            None => break,
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(event) => shared.buffer_event(&mut buffer, event),
                        None => break,
                    },
                }
            }
        }
    }

    shared.set_lifecycle(LifecycleState::Cancelling);
    let pending = shared.buffered.load(Ordering::SeqCst) + shared.queued.load(Ordering::SeqCst);
    if pending > 0 {
        shared.trace(&format!(
            "Cancellation requested, with {pending} events buffered."
        ));
    } else {
        shared.trace("Cancellation requested.");
    }

    // Anything admitted from here on is rejected at the call site.
    rx.close();
    if let Some(batch) = sealed.take() {
        dispatch_final(&shared, batch).await;
    }
    loop {
        shared.drain_into(&mut rx, &mut buffer);
        if buffer.is_empty() {
            // A producer counted as queued either lands its event or backs out.
            if shared.queued.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::task::yield_now().await;
            continue;
        }
        let batch = mem::replace(&mut buffer, Vec::with_capacity(max));
        dispatch_final(&shared, batch).await;
    }

    shared.set_lifecycle(LifecycleState::Drained);
    shared.trace("Router stopped.");
}

/// Batches flushed after cancellation wait for their slot regardless of the token and
/// are delivered with a token that never fires, so admitted data is not abandoned.
async fn dispatch_final<S: Sink>(shared: &Arc<Shared<S>>, batch: Vec<S::Event>) {
    match Arc::clone(&shared.slots).acquire_owned().await {
        Ok(permit) => dispatch(shared, batch, permit, CancellationToken::new()),
        Err(_) => {
            // Slots are never closed; keep the counters honest anyway.
            shared.buffered.fetch_sub(batch.len(), Ordering::SeqCst);
            error!("Dropping {} events: processor slots closed", batch.len());
        }
    }
}
