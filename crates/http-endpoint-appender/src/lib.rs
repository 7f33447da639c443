// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP sinks for [`async_appender`]: a generic JSON endpoint sink and an
//! Elasticsearch `_bulk` sink.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod connection_string;
pub mod elasticsearch;
pub mod endpoint;
pub mod event;
pub mod http;
pub mod http_sink;
pub mod serializer;

pub use elasticsearch::{ElasticProjection, ElasticsearchSink};
pub use endpoint::{EndpointError, EndpointSettings};
pub use event::{Level, Location, LogEvent};
pub use http_sink::{BodyFormat, BulkFormat, HttpEndpointSink, HttpSinkError, JsonArrayFormat};
pub use serializer::{EventSerializer, JsonEventSerializer, SerializeError};
