use crate::{config::ConfigurationError, env_var};
use actix_web::http::header::HeaderName;
use std::{
    env::{self, VarError},
    time::Duration,
};

/// Gateway wide settings shared by every frontend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BffOptions {
    pub antiforgery_header_name: String,
    /// `None` accepts any non-empty header value.
    pub antiforgery_header_value: Option<String>,
    /// Used by routes without their own `activity_timeout`.
    pub default_activity_timeout: Duration,
    /// Largest inbound body, in bytes, accepted for a proxied request.
    pub max_request_body: usize,
}

impl Default for BffOptions {
    fn default() -> Self {
        Self {
            antiforgery_header_name: Self::DEFAULT_ANTIFORGERY_HEADER_NAME.to_string(),
            antiforgery_header_value: Some(Self::DEFAULT_ANTIFORGERY_HEADER_VALUE.to_string()),
            default_activity_timeout: Self::DEFAULT_ACTIVITY_TIMEOUT,
            max_request_body: Self::DEFAULT_MAX_REQUEST_BODY,
        }
    }
}

impl BffOptions {
    pub const DEFAULT_ANTIFORGERY_HEADER_NAME: &'static str = "X-CSRF";
    pub const DEFAULT_ANTIFORGERY_HEADER_VALUE: &'static str = "1";
    pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(100);
    pub const DEFAULT_MAX_REQUEST_BODY: usize = 4 * 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self::from_vars(
            env::var(env_var::BFF_ANTIFORGERY_HEADER_NAME),
            env::var(env_var::BFF_ANTIFORGERY_HEADER_VALUE),
            env::var(env_var::BFF_ACTIVITY_TIMEOUT_SECONDS),
            env::var(env_var::BFF_MAX_REQUEST_BODY_BYTES),
        )
    }

    fn from_vars(
        header_name: Result<String, VarError>,
        header_value: Result<String, VarError>,
        timeout_seconds: Result<String, VarError>,
        max_body_bytes: Result<String, VarError>,
    ) -> Self {
        let defaults = Self::default();

        let antiforgery_header_name = header_name
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or(defaults.antiforgery_header_name);

        let antiforgery_header_value = match header_value {
            Ok(value) if value.trim().is_empty() => None,
            Ok(value) => Some(value.trim().to_string()),
            Err(_) => defaults.antiforgery_header_value,
        };

        let default_activity_timeout = match timeout_seconds {
            Ok(seconds) => match seconds.trim().parse::<u64>() {
                Ok(seconds) if seconds > 0 => Duration::from_secs(seconds),
                _ => {
                    log::warn!(
                        "{} is not a positive number of seconds, using {:?}.",
                        env_var::BFF_ACTIVITY_TIMEOUT_SECONDS,
                        defaults.default_activity_timeout
                    );
                    defaults.default_activity_timeout
                }
            },
            Err(_) => defaults.default_activity_timeout,
        };

        let max_request_body = match max_body_bytes {
            Ok(bytes) => bytes.trim().parse::<usize>().unwrap_or_else(|_| {
                log::warn!(
                    "{} is not a number of bytes, using {}.",
                    env_var::BFF_MAX_REQUEST_BODY_BYTES,
                    defaults.max_request_body
                );
                defaults.max_request_body
            }),
            Err(_) => defaults.max_request_body,
        };

        Self {
            antiforgery_header_name,
            antiforgery_header_value,
            default_activity_timeout,
            max_request_body,
        }
    }

    pub fn with_antiforgery_header(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.antiforgery_header_name = name.into();
        self.antiforgery_header_value = value;
        self
    }

    pub fn with_default_activity_timeout(mut self, timeout: Duration) -> Self {
        self.default_activity_timeout = timeout;
        self
    }

    pub fn with_max_request_body(mut self, bytes: usize) -> Self {
        self.max_request_body = bytes;
        self
    }

    pub(crate) fn antiforgery_header(&self) -> Result<HeaderName, ConfigurationError> {
        HeaderName::from_bytes(self.antiforgery_header_name.as_bytes()).map_err(|_| {
            ConfigurationError::InvalidAntiForgeryHeader {
                name: self.antiforgery_header_name.clone(),
            }
        })
    }
}
