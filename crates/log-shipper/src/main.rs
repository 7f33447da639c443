// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::future::Future;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use async_appender::{AppenderSettings, AsyncAppender, Sink};
use http_endpoint_appender::{
    ElasticsearchSink, EndpointSettings, HttpEndpointSink, Level, LogEvent,
};

const DEFAULT_LOGGER_NAME: &str = "stdin";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_SHIPPER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let settings = AppenderSettings::from_env();
    let logger_name =
        env::var("LOG_SHIPPER_LOGGER_NAME").unwrap_or_else(|_| DEFAULT_LOGGER_NAME.to_string());

    if let Ok(connection_string) = env::var("ES_CONNECTION_STRING") {
        info!("Shipping stdin to Elasticsearch");
        let mut sink = ElasticsearchSink::for_log_events();
        sink.connection_string = Some(connection_string);
        sink.http.ensure_success_status = true;
        run(sink, settings, logger_name).await;
    } else if let Ok(url) = env::var("LOG_SHIPPER_ENDPOINT_URL") {
        info!("Shipping stdin to {url}");
        let mut sink: HttpEndpointSink<LogEvent> =
            HttpEndpointSink::json_array(EndpointSettings::from_url(url));
        sink.ensure_success_status = true;
        run(sink, settings, logger_name).await;
    } else {
        error!("Neither ES_CONNECTION_STRING nor LOG_SHIPPER_ENDPOINT_URL is set. Shutting down.");
    }
}

async fn run<S>(sink: S, settings: AppenderSettings, logger_name: String)
where
    S: Sink<Event = LogEvent>,
{
    let mut appender = AsyncAppender::new(sink).with_settings(settings);
    appender.activate_options();
    if !appender.activated() {
        error!("Appender could not be activated. Shutting down.");
        return;
    }

    let admitted = ship_lines(
        &appender,
        &logger_name,
        BufReader::new(io::stdin()),
        tokio::signal::ctrl_c(),
    )
    .await;

    appender.close().await;
    info!("Shipped {admitted} lines");
}

/// Append every parsed line of `input` until it ends or `shutdown` resolves.
/// Returns how many events were appended.
async fn ship_lines<S, R, F>(
    appender: &AsyncAppender<S>,
    logger_name: &str,
    input: R,
    shutdown: F,
) -> u64
where
    S: Sink<Event = LogEvent>,
    R: AsyncBufRead + Unpin,
    F: Future,
{
    let mut lines = input.lines();
    let mut admitted: u64 = 0;
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(event) = parse_line(logger_name, &line) {
                        appender.append(event);
                        admitted += 1;
                    }
                }
                Ok(None) => {
                    debug!("End of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from stdin: {e}");
                    break;
                }
            },
            _ = &mut shutdown => {
                info!("Interrupted");
                break;
            }
        }
    }
    admitted
}

/// A line starting with a level word (`WARN disk almost full`) keeps that level;
/// anything else is logged at INFO. Blank lines are skipped.
fn parse_line(logger_name: &str, line: &str) -> Option<LogEvent> {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return None;
    }

    let leading_level = line.split_once(char::is_whitespace).and_then(|(first, rest)| {
        first
            .trim_matches(|c| c == '[' || c == ']' || c == ':')
            .parse::<Level>()
            .ok()
            .map(|level| (level, rest.trim_start()))
    });
    let (level, message) = leading_level.unwrap_or((Level::Info, line));

    Some(LogEvent::new(level, logger_name, message))
}
