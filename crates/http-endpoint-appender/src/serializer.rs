// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("Failed to serialize event to JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to serialize event: {0}")]
    Custom(String),
}

/// Turns one event into one JSON document.
pub trait EventSerializer<E>: Send + Sync {
    fn serialize(&self, event: &E) -> Result<String, SerializeError>;
}

impl<E, F> EventSerializer<E> for F
where
    F: Fn(&E) -> Result<String, SerializeError> + Send + Sync,
{
    fn serialize(&self, event: &E) -> Result<String, SerializeError> {
        self(event)
    }
}

/// `serde_json` rendering of the event's own `Serialize` impl.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEventSerializer;

impl<E: Serialize> EventSerializer<E> for JsonEventSerializer {
    fn serialize(&self, event: &E) -> Result<String, SerializeError> {
        Ok(serde_json::to_string(event)?)
    }
}
