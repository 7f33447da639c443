// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sink posting each batch as one HTTP request.
//!
//! ```text
//!   batch ──> EventSerializer (per event) ──> BodyFormat (whole body) ──> POST endpoint
//! ```
//!
//! The request is never cancelled once sent: batches flushed during shutdown still
//! reach the endpoint.

use crate::endpoint::{EndpointError, EndpointSettings};
use crate::http::{get_client, DEFAULT_REQUEST_TIMEOUT};
use crate::serializer::{EventSerializer, JsonEventSerializer, SerializeError};
use async_appender::{Batch, Sink, SinkError};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum HttpSinkError {
    #[error("Missing event to json serializer.")]
    MissingSerializer,
    #[error("Missing index.")]
    MissingIndex,
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("The sink was not activated, no endpoint resolved")]
    NotActivated,
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Request to {url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("Bulk request to {url} reported item errors: {body}")]
    BulkItems { url: String, body: String },
}

/// How a batch of serialized events becomes a request body.
pub trait BodyFormat<E>: Send + Sync + 'static {
    fn content_type(&self) -> &str;

    fn encode(
        &self,
        events: &[E],
        serializer: &dyn EventSerializer<E>,
    ) -> Result<String, SerializeError>;
}

/// `[doc,doc,...]`
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonArrayFormat;

impl<E> BodyFormat<E> for JsonArrayFormat {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn encode(
        &self,
        events: &[E],
        serializer: &dyn EventSerializer<E>,
    ) -> Result<String, SerializeError> {
        let mut body = String::from("[");
        for (i, event) in events.iter().enumerate() {
            if i > 0 {
                body.push(',');
            }
            body.push_str(&serializer.serialize(event)?);
        }
        body.push(']');
        Ok(body)
    }
}

/// One document per line, each optionally preceded by an action line.
#[derive(Debug, Clone)]
pub struct BulkFormat {
    action: Option<String>,
    content_type: String,
}

impl BulkFormat {
    pub fn ndjson() -> Self {
        Self {
            action: None,
            content_type: "application/x-ndjson".to_string(),
        }
    }

    /// Elasticsearch `_bulk` body: an `index` action before every document and an
    /// empty line at the end.
    pub fn elasticsearch(content_type: impl Into<String>) -> Self {
        Self {
            action: Some(r#"{"index":{}}"#.to_string()),
            content_type: content_type.into(),
        }
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }
}

impl<E> BodyFormat<E> for BulkFormat {
    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn encode(
        &self,
        events: &[E],
        serializer: &dyn EventSerializer<E>,
    ) -> Result<String, SerializeError> {
        let mut body = String::new();
        for event in events {
            if let Some(action) = &self.action {
                body.push_str(action);
                body.push('\n');
            }
            body.push_str(&serializer.serialize(event)?);
            body.push('\n');
        }
        if self.action.is_some() {
            body.push('\n');
        }
        Ok(body)
    }
}

pub struct HttpEndpointSink<E, F = JsonArrayFormat> {
    pub endpoint: EndpointSettings,
    /// Install [`JsonEventSerializer`] during `configure` when no serializer is set.
    pub use_default_serializer_when_missing: bool,
    /// Turn non-success statuses into errors instead of only logging them.
    pub ensure_success_status: bool,
    pub request_timeout: Duration,
    serializer: Option<Arc<dyn EventSerializer<E>>>,
    format: F,
    client: Option<reqwest::Client>,
    resolved: Option<Url>,
}

impl<E, F: fmt::Debug> fmt::Debug for HttpEndpointSink<E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEndpointSink")
            .field("endpoint", &self.endpoint)
            .field("use_default_serializer_when_missing", &self.use_default_serializer_when_missing)
            .field("ensure_success_status", &self.ensure_success_status)
            .field("request_timeout", &self.request_timeout)
            .field("serializer", &self.serializer.as_ref().map(|_| "<serializer>"))
            .field("format", &self.format)
            .field("resolved", &self.resolved.as_ref().map(Url::as_str))
            .finish_non_exhaustive()
    }
}

impl<E> HttpEndpointSink<E, JsonArrayFormat> {
    pub fn json_array(endpoint: EndpointSettings) -> Self {
        Self::new(endpoint, JsonArrayFormat)
    }
}

impl<E> HttpEndpointSink<E, BulkFormat> {
    pub fn format_mut(&mut self) -> &mut BulkFormat {
        &mut self.format
    }
}

impl<E, F: BodyFormat<E>> HttpEndpointSink<E, F> {
    pub fn new(endpoint: EndpointSettings, format: F) -> Self {
        Self {
            endpoint,
            use_default_serializer_when_missing: true,
            ensure_success_status: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            serializer: None,
            format,
            client: None,
            resolved: None,
        }
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: impl EventSerializer<E> + 'static) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    /// Use a caller-provided client instead of building one on activation.
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn has_serializer(&self) -> bool {
        self.serializer.is_some()
    }

    /// The endpoint resolved by `activate`.
    pub fn endpoint_url(&self) -> Option<&Url> {
        self.resolved.as_ref()
    }

    pub fn content_type(&self) -> &str {
        self.format.content_type()
    }

    pub fn encode(&self, events: &[E]) -> Result<String, HttpSinkError> {
        let serializer = self
            .serializer
            .as_deref()
            .ok_or(HttpSinkError::MissingSerializer)?;
        Ok(self.format.encode(events, serializer)?)
    }

    fn install_default_serializer(&mut self)
    where
        E: Serialize + 'static,
    {
        if self.serializer.is_none() && self.use_default_serializer_when_missing {
            self.serializer = Some(Arc::new(JsonEventSerializer));
        }
    }

    fn check(&self) -> Result<(), HttpSinkError> {
        if self.serializer.is_none() {
            return Err(HttpSinkError::MissingSerializer);
        }
        self.endpoint.validate()?;
        Ok(())
    }

    fn resolve(&mut self) -> Result<(), HttpSinkError> {
        self.resolved = Some(self.endpoint.to_url()?);
        if self.client.is_none() {
            self.client = Some(get_client(self.request_timeout));
        }
        Ok(())
    }

    /// POST `body` to `url`. Credentials in the URL's user info are sent as basic
    /// auth. Only transport failures are errors here.
    pub async fn post(
        &self,
        url: &Url,
        body: String,
        content_type: &str,
    ) -> Result<reqwest::Response, HttpSinkError> {
        let client = self.client.as_ref().ok_or(HttpSinkError::NotActivated)?;

        let mut target = url.clone();
        let user_name = target.username().to_string();
        let password = target.password().map(str::to_string);
        // set_username/set_password only fail for URLs that cannot carry credentials.
        let _ = target.set_username("");
        let _ = target.set_password(None);

        let mut request = client
            .post(target)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body);
        if !user_name.is_empty() {
            request = request.basic_auth(user_name, password);
        }

        let response = request
            .send()
            .await
            .map_err(|source| HttpSinkError::Transport {
                url: redacted(url),
                source,
            })?;
        debug!("POST {} returned {}", redacted(url), response.status());
        Ok(response)
    }

    /// Log a non-success response with its body; an error only when
    /// `ensure_success_status` is set.
    pub async fn handle_unsuccessful(
        &self,
        url: &Url,
        response: reqwest::Response,
    ) -> Result<(), HttpSinkError> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(
            "Endpoint {} rejected batch with status {status}: {body}",
            redacted(url)
        );
        if self.ensure_success_status {
            return Err(HttpSinkError::Status {
                url: redacted(url),
                status,
                body,
            });
        }
        Ok(())
    }

    pub(crate) async fn deliver(&self, url: &Url, events: &[E]) -> Result<reqwest::Response, HttpSinkError> {
        let body = self.encode(events)?;
        self.post(url, body, self.format.content_type()).await
    }
}

/// The URL without its password, for logs and error messages.
pub(crate) fn redacted(url: &Url) -> String {
    if url.password().is_none() {
        return url.to_string();
    }
    let mut url = url.clone();
    let _ = url.set_password(Some("***"));
    url.to_string()
}

#[async_trait]
impl<E, F> Sink for HttpEndpointSink<E, F>
where
    E: Serialize + Send + Sync + 'static,
    F: BodyFormat<E>,
{
    type Event = E;

    fn configure(&mut self) -> Result<(), SinkError> {
        self.install_default_serializer();
        Ok(())
    }

    fn validate(&self) -> Result<(), SinkError> {
        Ok(self.check()?)
    }

    fn activate(&mut self) -> Result<(), SinkError> {
        Ok(self.resolve()?)
    }

    async fn process(&self, batch: Batch<E>, _cancel: CancellationToken) -> Result<(), SinkError> {
        let url = self.resolved.as_ref().ok_or(HttpSinkError::NotActivated)?;
        let response = self.deliver(url, &batch).await?;
        if !response.status().is_success() {
            self.handle_unsuccessful(url, response).await?;
        }
        Ok(())
    }
}
