// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Elasticsearch `_bulk` sink.
//!
//! The endpoint can be given as a URL or through a connection string such as
//! `Scheme=https;Server=es.local;Port=9200;Index=logs;Rolling=true;User=u;Pwd=p`.
//! Every batch is posted to `{base path}/{index}[-yyyy.MM.dd]/logEvent/_bulk`.

use crate::connection_string::{self, ConnectionString};
use crate::endpoint::EndpointSettings;
use crate::event::LogEvent;
use crate::http_sink::{redacted, BulkFormat, HttpEndpointSink, HttpSinkError};
use crate::serializer::{EventSerializer, SerializeError};
use async_appender::{Batch, Sink, SinkError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::env;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug)]
pub struct ElasticsearchSink<E = LogEvent> {
    pub http: HttpEndpointSink<E, BulkFormat>,
    pub connection_string: Option<String>,
    pub index: Option<String>,
    /// Append the UTC date to the index: `logs-2024.03.01`.
    pub rolling_index: bool,
    pub routing: Option<String>,
    /// Ask for `took,errors` only, which lets item failures be detected cheaply.
    pub request_slim_response: bool,
    pub content_type: Option<String>,
}

impl<E> Default for ElasticsearchSink<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ElasticsearchSink<E> {
    pub fn new() -> Self {
        Self {
            http: HttpEndpointSink::new(
                EndpointSettings::default(),
                BulkFormat::elasticsearch(DEFAULT_CONTENT_TYPE),
            ),
            connection_string: None,
            index: None,
            rolling_index: false,
            routing: None,
            request_slim_response: true,
            content_type: None,
        }
    }

    pub fn from_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: Some(connection_string.into()),
            ..Self::new()
        }
    }

    fn apply_connection_string(&mut self, cs: &ConnectionString) {
        let owned = |aliases: &[&str]| cs.get(aliases).map(str::to_string);
        let endpoint = &mut self.http.endpoint;
        endpoint.scheme = owned(&["Scheme"]).or_else(|| Some("http".to_string()));
        endpoint.user_name = owned(&["UserName", "User"]);
        endpoint.password = owned(&["Password", "Pwd"]);
        endpoint.host = owned(&["Host", "Server"]);
        endpoint.port = owned(&["Port"]);
        endpoint.path = owned(&["Path"]);
        endpoint.query = owned(&["Query"]);
        self.rolling_index = cs
            .get(&["Rolling"])
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        self.index = owned(&["Index"]);
        self.routing = owned(&["Routing"]);
    }

    /// Bulk URL for a batch sent at `now`.
    pub fn bulk_url(&self, now: DateTime<Utc>) -> Result<Url, HttpSinkError> {
        let mut url = match self.http.endpoint_url() {
            Some(url) => url.clone(),
            None => self.http.endpoint.to_url()?,
        };
        let index = self
            .index
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty())
            .ok_or(HttpSinkError::MissingIndex)?;
        let index = if self.rolling_index {
            format!("{index}-{}", now.format("%Y.%m.%d"))
        } else {
            index.to_string()
        };

        let mut path = url.path().to_string();
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(&index);
        path.push_str("/logEvent/_bulk");
        url.set_path(&path);

        let routing = self
            .routing
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        let mut pairs: Vec<String> = url
            .query()
            .unwrap_or_default()
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter(|pair| {
                let key = pair.split('=').next().unwrap_or_default();
                !(routing.is_some() && key == "routing")
                    && !(self.request_slim_response && key == "filter_path")
            })
            .map(str::to_string)
            .collect();
        if let Some(routing) = routing {
            pairs.push(format!("routing={routing}"));
        }
        if self.request_slim_response {
            pairs.push("filter_path=took,errors".to_string());
        }
        url.set_query((!pairs.is_empty()).then(|| pairs.join("&")).as_deref());

        Ok(url)
    }
}

impl ElasticsearchSink<LogEvent> {
    /// Sink for [`LogEvent`]s projected with [`ElasticProjection`].
    pub fn for_log_events() -> Self {
        let mut sink = Self::new();
        sink.http = sink.http.with_serializer(ElasticProjection::new());
        sink
    }
}

#[derive(Debug, Deserialize)]
struct SlimBulkResponse {
    #[serde(default)]
    errors: bool,
}

#[async_trait]
impl<E> Sink for ElasticsearchSink<E>
where
    E: Serialize + Send + Sync + 'static,
{
    type Event = E;

    fn configure(&mut self) -> Result<(), SinkError> {
        let mut parse_error = None;
        if let Some(raw) = self
            .connection_string
            .clone()
            .filter(|cs| !cs.trim().is_empty())
        {
            match connection_string::parse(&raw) {
                Ok(cs) => self.apply_connection_string(&cs),
                Err(e) => parse_error = Some(e),
            }
        }

        self.http.configure()?;

        let content_type = self
            .content_type
            .get_or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string())
            .clone();
        self.http.format_mut().set_content_type(content_type);

        match parse_error {
            Some(e) => Err(format!("Invalid connection string: {e}").into()),
            None => Ok(()),
        }
    }

    fn validate(&self) -> Result<(), SinkError> {
        self.http.validate()?;
        if self
            .index
            .as_deref()
            .map_or(true, |index| index.trim().is_empty())
        {
            return Err(HttpSinkError::MissingIndex.into());
        }
        Ok(())
    }

    fn activate(&mut self) -> Result<(), SinkError> {
        self.http.activate()?;
        if let Ok(url) = self.bulk_url(Utc::now()) {
            debug!("Elasticsearch bulk endpoint: {}", redacted(&url));
        }
        Ok(())
    }

    async fn process(&self, batch: Batch<E>, _cancel: CancellationToken) -> Result<(), SinkError> {
        let url = self.bulk_url(Utc::now())?;
        let response = self.http.deliver(&url, &batch).await?;

        if !response.status().is_success() {
            self.http.handle_unsuccessful(&url, response).await?;
            return Ok(());
        }

        if self.request_slim_response {
            let body = response.text().await.unwrap_or_default();
            let has_item_errors = serde_json::from_str::<SlimBulkResponse>(&body)
                .map(|r| r.errors)
                .unwrap_or(false);
            if has_item_errors {
                warn!(
                    "Elasticsearch reported item errors for a batch of {} events: {body}",
                    batch.len()
                );
                if self.http.ensure_success_status {
                    return Err(HttpSinkError::BulkItems {
                        url: redacted(&url),
                        body,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// Maps a [`LogEvent`] to the document stored in Elasticsearch.
#[derive(Debug, Clone)]
pub struct ElasticProjection {
    machine_name: String,
}

impl Default for ElasticProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl ElasticProjection {
    pub fn new() -> Self {
        Self {
            machine_name: machine_name(),
        }
    }

    pub fn with_machine_name(machine_name: impl Into<String>) -> Self {
        Self {
            machine_name: machine_name.into(),
        }
    }

    pub fn project(&self, event: &LogEvent) -> Value {
        let timestamp = event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        let location = event.location.clone().unwrap_or_default();

        let mut properties: Map<String, Value> = event.properties.clone();
        properties.insert("@timestamp".to_string(), json!(timestamp));

        json!({
            "@timestamp": timestamp,
            "timeStamp": timestamp,
            "loggerName": event.logger_name,
            "threadName": event.thread_name,
            "userName": event.user_name,
            "machineName": self.machine_name,
            "level": event.level.to_string(),
            "message": event.message,
            "exception": event.exception,
            "className": location.class_name,
            "fileName": location.file_name,
            "lineNumber": location.line_number,
            "methodName": location.method_name,
            "properties": properties,
        })
    }
}

impl EventSerializer<LogEvent> for ElasticProjection {
    fn serialize(&self, event: &LogEvent) -> Result<String, SerializeError> {
        Ok(serde_json::to_string(&self.project(event))?)
    }
}

fn machine_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| env::var(var).ok())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
