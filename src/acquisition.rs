use crate::route::UserTokenRequestParameters;
use actix_web::HttpRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Outcome of asking the token-acquisition collaborator for a token.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenAcquisitionResult {
    Token(String),
    /// The request carries no usable user session.
    NoSession,
    Error {
        error: String,
        error_description: Option<String>,
    },
}

impl fmt::Debug for TokenAcquisitionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(..)"),
            Self::NoSession => f.write_str("NoSession"),
            Self::Error {
                error,
                error_description,
            } => f
                .debug_struct("Error")
                .field("error", error)
                .field("error_description", error_description)
                .finish(),
        }
    }
}

/// Obtains access tokens on behalf of the gateway. How tokens are stored,
/// cached or renewed is up to the implementation.
#[async_trait(?Send)]
pub trait TokenAcquisition: Send + Sync {
    async fn get_user_access_token(
        &self,
        req: &HttpRequest,
        parameters: &UserTokenRequestParameters,
    ) -> TokenAcquisitionResult;

    async fn get_client_access_token(
        &self,
        parameters: &UserTokenRequestParameters,
    ) -> TokenAcquisitionResult;
}

/// Tokens of the signed in user. The host's authentication layer inserts it
/// into the request extensions.
#[derive(Clone)]
pub struct UserSession {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: Option<String>,
}

impl UserSession {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
            refresh_token: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub(crate) fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}
