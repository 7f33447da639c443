// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::AppenderError;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_CONCURRENT_PROCESSORS_COUNT: usize = 3;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 512;
pub const DEFAULT_CLOSE_TIMEOUT_MILLIS: u64 = 5000;

/// Limits applied by the events handler, validated before activation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppenderSettings {
    /// Upper bound of processors delivering batches at the same time
    pub max_concurrent_processors_count: usize,
    /// Upper bound of events in a single batch
    pub max_batch_size: usize,
    /// How long `close` waits for in-flight processors
    pub close_timeout_millis: u64,
}

impl Default for AppenderSettings {
    fn default() -> Self {
        Self {
            max_concurrent_processors_count: DEFAULT_MAX_CONCURRENT_PROCESSORS_COUNT,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            close_timeout_millis: DEFAULT_CLOSE_TIMEOUT_MILLIS,
        }
    }
}

impl AppenderSettings {
    /// Read settings from `ASYNC_APPENDER_*` environment variables, keeping the
    /// default for anything unset or unparseable.
    pub fn from_env() -> Self {
        Self {
            max_concurrent_processors_count: env_or(
                "ASYNC_APPENDER_MAX_CONCURRENT_PROCESSORS",
                DEFAULT_MAX_CONCURRENT_PROCESSORS_COUNT,
            ),
            max_batch_size: env_or("ASYNC_APPENDER_MAX_BATCH_SIZE", DEFAULT_MAX_BATCH_SIZE),
            close_timeout_millis: env_or(
                "ASYNC_APPENDER_CLOSE_TIMEOUT_MILLIS",
                DEFAULT_CLOSE_TIMEOUT_MILLIS,
            ),
        }
    }

    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), AppenderError> {
        if self.max_concurrent_processors_count < 1 {
            return Err(AppenderError::InvalidSetting(
                "max_concurrent_processors_count",
            ));
        }
        if self.max_batch_size < 1 {
            return Err(AppenderError::InvalidSetting("max_batch_size"));
        }
        if self.close_timeout_millis == 0 {
            return Err(AppenderError::InvalidSetting("close_timeout_millis"));
        }
        Ok(())
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_millis)
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring {key}='{raw}': not a valid number, using {default}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = AppenderSettings::default();
        assert_eq!(settings.max_concurrent_processors_count, 3);
        assert_eq!(settings.max_batch_size, 512);
        assert_eq!(settings.close_timeout_millis, 5000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_first_violation() {
        let settings = AppenderSettings {
            max_concurrent_processors_count: 0,
            max_batch_size: 0,
            close_timeout_millis: 0,
        };
        assert!(matches!(
            settings.validate(),
            Err(AppenderError::InvalidSetting("max_concurrent_processors_count"))
        ));

        let settings = AppenderSettings {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(AppenderError::InvalidSetting("max_batch_size"))
        ));

        let settings = AppenderSettings {
            close_timeout_millis: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(AppenderError::InvalidSetting("close_timeout_millis"))
        ));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let settings: AppenderSettings =
            serde_json::from_str(r#"{"max_batch_size": 64}"#).expect("failed to deserialize");
        assert_eq!(settings.max_batch_size, 64);
        assert_eq!(settings.max_concurrent_processors_count, 3);
        assert_eq!(settings.close_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("ASYNC_APPENDER_TEST_GARBAGE", "twelve");
        assert_eq!(env_or("ASYNC_APPENDER_TEST_GARBAGE", 7usize), 7);
        env::set_var("ASYNC_APPENDER_TEST_NUMBER", " 12 ");
        assert_eq!(env_or("ASYNC_APPENDER_TEST_NUMBER", 7usize), 12);
        assert_eq!(env_or("ASYNC_APPENDER_TEST_UNSET", 7usize), 7);
    }
}
