// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_appender::{AppenderError, AppenderSettings, AsyncAppender, Batch, Sink, SinkError};
use async_trait::async_trait;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct CollectingSink {
    batches: Mutex<Vec<Vec<u64>>>,
    delay: Duration,
    fail_on_call: Option<usize>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    high_water_mark: AtomicUsize,
}

impl CollectingSink {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    fn delivered(&self) -> Vec<u64> {
        let mut events: Vec<u64> = self.batches.lock().unwrap().iter().flatten().copied().collect();
        events.sort_unstable();
        events
    }
}

#[async_trait]
impl Sink for CollectingSink {
    type Event = u64;

    async fn process(&self, batch: Batch<u64>, _cancel: CancellationToken) -> Result<(), SinkError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water_mark.fetch_max(in_flight, Ordering::SeqCst);
        self.batches.lock().unwrap().push(batch.to_vec());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_on_call == Some(call) {
            return Err(format!("endpoint unavailable on call {call}").into());
        }
        Ok(())
    }
}

type Errors = Arc<Mutex<Vec<String>>>;

fn activated(sink: CollectingSink, settings: AppenderSettings) -> (AsyncAppender<CollectingSink>, Errors) {
    let errors = Errors::default();
    let errors_clone = Arc::clone(&errors);
    let mut appender = AsyncAppender::new(sink)
        .with_settings(settings)
        .with_error_handler(move |message: &str, error: Option<&AppenderError>| {
            let line = match error {
                Some(e) => format!("{message}: {e}"),
                None => message.to_string(),
            };
            errors_clone.lock().unwrap().push(line);
        });
    appender.activate_options();
    (appender, errors)
}

fn settings(max_concurrent_processors_count: usize, max_batch_size: usize) -> AppenderSettings {
    AppenderSettings {
        max_concurrent_processors_count,
        max_batch_size,
        ..Default::default()
    }
}

async fn run_to_idle(appender: &AsyncAppender<CollectingSink>, events: impl IntoIterator<Item = u64>) {
    let started = appender.processing_started().expect("not activated");
    appender.append_many(events);
    timeout(WAIT, started).await.expect("processing never started");
    timeout(WAIT, appender.processing_terminated().expect("not activated"))
        .await
        .expect("processing never terminated");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_appended_event_is_delivered_once(
        count in 0u64..300,
        processors in 1usize..5,
        batch_size in 1usize..40,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let delivered = runtime.block_on(async {
            let (appender, errors) = activated(CollectingSink::default(), settings(processors, batch_size));
            for event in 0..count {
                appender.append(event);
            }
            appender.close().await;
            assert!(errors.lock().unwrap().is_empty());
            assert!(appender.sink().batch_sizes().iter().all(|&size| size >= 1 && size <= batch_size));
            appender.sink().delivered()
        });
        prop_assert_eq!(delivered, (0..count).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn full_batches_then_a_remainder_with_one_processor() {
    let (appender, _) = activated(CollectingSink::default(), settings(1, 8));

    run_to_idle(&appender, 0..(3 * 8 + 1)).await;

    assert_eq!(appender.sink().batch_sizes(), vec![8, 8, 8, 1]);
    assert!(!appender.is_processing());
    appender.close().await;
}

#[tokio::test]
async fn lone_event_is_delivered_without_waiting_for_a_full_batch() {
    let (appender, _) = activated(CollectingSink::default(), settings(3, 512));

    run_to_idle(&appender, [42]).await;

    assert_eq!(appender.sink().batch_sizes(), vec![1]);
    appender.close().await;
}

#[tokio::test]
async fn large_burst_is_split_into_bounded_batches() {
    let (appender, _) = activated(CollectingSink::default(), settings(10, 512));

    run_to_idle(&appender, 0..1025).await;

    let sizes = appender.sink().batch_sizes();
    assert_eq!(sizes.iter().sum::<usize>(), 1025);
    assert!(sizes.len() >= 3);
    assert!(sizes.iter().all(|&size| size <= 512));
    appender.close().await;
}

#[tokio::test]
async fn started_and_terminated_track_each_wave() {
    let (appender, _) = activated(CollectingSink::with_delay(Duration::from_millis(20)), settings(2, 4));

    timeout(Duration::from_millis(50), appender.processing_terminated().unwrap())
        .await
        .expect("a fresh appender is idle");

    run_to_idle(&appender, 0..10).await;
    assert!(!appender.is_processing());

    let started = appender.processing_started().unwrap();
    assert!(
        timeout(Duration::from_millis(50), appender.processing_started().unwrap())
            .await
            .is_err(),
        "no new wave without new events"
    );
    appender.append(10);
    timeout(WAIT, started).await.expect("second wave never started");
    assert!(appender.is_processing());
    timeout(WAIT, appender.processing_terminated().unwrap())
        .await
        .expect("second wave never terminated");

    assert_eq!(appender.sink().delivered(), (0..11).collect::<Vec<_>>());
    appender.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_processors_are_bounded() {
    let (appender, _) = activated(CollectingSink::with_delay(Duration::from_millis(10)), settings(3, 2));
    let appender = Arc::new(appender);

    let producers: Vec<_> = (0..4u64)
        .map(|producer| {
            let appender = Arc::clone(&appender);
            tokio::spawn(async move {
                for i in 0..50u64 {
                    appender.append(producer * 1000 + i);
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    appender.close().await;

    assert!(appender.sink().high_water_mark.load(Ordering::SeqCst) <= 3);
    assert_eq!(appender.sink().delivered().len(), 200);
}

#[tokio::test]
async fn failed_batch_does_not_stop_later_batches() {
    let sink = CollectingSink {
        fail_on_call: Some(1),
        ..Default::default()
    };
    let (appender, errors) = activated(sink, settings(1, 2));

    run_to_idle(&appender, 0..6).await;

    assert_eq!(appender.sink().batch_sizes(), vec![2, 2, 2]);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("An error occurred during events processing"));
    assert!(errors[0].contains("endpoint unavailable on call 1"));
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_later_events() {
    let (appender, errors) = activated(CollectingSink::default(), settings(2, 16));
    appender.append_many(0..5);

    appender.close().await;
    assert!(!appender.activated());
    assert!(!appender.accepts_events());
    appender.close().await;

    appender.append(99);
    assert_eq!(appender.sink().delivered(), (0..5).collect::<Vec<_>>());
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("This appender cannot process events."));
}

#[tokio::test]
async fn close_gives_up_after_its_timeout() {
    let settings = AppenderSettings {
        max_concurrent_processors_count: 1,
        max_batch_size: 8,
        close_timeout_millis: 100,
    };
    let (appender, errors) = activated(CollectingSink::with_delay(Duration::from_secs(2)), settings);
    appender.append(1);

    let begin = Instant::now();
    appender.close().await;

    assert!(begin.elapsed() < Duration::from_secs(1));
    assert!(!appender.activated());
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Processors 1 termination timed out after 100ms"));
}

#[tokio::test]
async fn invalid_settings_leave_the_appender_inert() {
    let (appender, errors) = activated(CollectingSink::default(), settings(3, 0));

    assert!(!appender.activated());
    appender.append(1);
    appender.append_many([2, 3]);

    assert!(appender.sink().delivered().is_empty());
    assert!(matches!(
        appender.processing_terminated(),
        Err(AppenderError::NotActivated)
    ));
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 3);
    assert!(errors[0].contains("max_batch_size must be positive."));
    assert!(errors[1..]
        .iter()
        .all(|e| e.contains("This appender cannot process events.")));
}
