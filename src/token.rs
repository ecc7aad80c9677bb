use crate::{
    acquisition::{TokenAcquisition, TokenAcquisitionResult},
    config::ConfigurationError,
    frontend::Frontend,
    route::{RemoteApiRoute, RequiredTokenType, UserTokenRequestParameters},
};
use actix_web::HttpRequest;
use async_trait::async_trait;
use std::{collections::HashMap, fmt, sync::Arc};

/// The credential to attach to a proxied request.
#[derive(Clone, PartialEq, Eq)]
pub enum AccessTokenResult {
    NoAccessToken,
    BearerToken { access_token: String },
    RetrievalError(AccessTokenRetrievalError),
}

impl fmt::Debug for AccessTokenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAccessToken => f.write_str("NoAccessToken"),
            Self::BearerToken { .. } => f.write_str("BearerToken { .. }"),
            Self::RetrievalError(err) => f.debug_tuple("RetrievalError").field(err).finish(),
        }
    }
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{error}")]
pub struct AccessTokenRetrievalError {
    pub error: String,
    pub error_description: Option<String>,
}

impl AccessTokenRetrievalError {
    pub const MISSING_USER_SESSION: &'static str = "missing_user_session";
    const UNAUTHENTICATED_ERRORS: [&'static str; 3] =
        [Self::MISSING_USER_SESSION, "invalid_grant", "invalid_token"];

    pub fn new(error: impl Into<String>, error_description: Option<String>) -> Self {
        Self {
            error: error.into(),
            error_description,
        }
    }

    /// Whether the failure means the caller lacks a usable authentication.
    pub fn is_unauthenticated(&self) -> bool {
        Self::UNAUTHENTICATED_ERRORS.contains(&self.error.as_str())
    }
}

impl From<AccessTokenRetrievalError> for AccessTokenResult {
    fn from(value: AccessTokenRetrievalError) -> Self {
        AccessTokenResult::RetrievalError(value)
    }
}

pub struct AccessTokenRetrievalContext<'a> {
    pub request: &'a HttpRequest,
    pub frontend: &'a Frontend,
    pub route: &'a RemoteApiRoute,
    pub token_acquisition: &'a dyn TokenAcquisition,
}

impl AccessTokenRetrievalContext<'_> {
    pub fn user_token_request_parameters(&self) -> UserTokenRequestParameters {
        self.route
            .user_access_token_parameters()
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait(?Send)]
pub trait AccessTokenRetriever: Send + Sync {
    async fn get_access_token(&self, context: &AccessTokenRetrievalContext<'_>)
        -> AccessTokenResult;
}

/// Built-in strategies keyed on [`RequiredTokenType`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAccessTokenRetriever {
    token_type: Option<RequiredTokenType>,
}

impl DefaultAccessTokenRetriever {
    /// Follows the token type of the route being proxied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always applies `token_type` regardless of the route.
    pub fn with_token_type(token_type: RequiredTokenType) -> Self {
        Self {
            token_type: Some(token_type),
        }
    }

    pub fn user() -> Self {
        Self::with_token_type(RequiredTokenType::User)
    }

    async fn user_token(context: &AccessTokenRetrievalContext<'_>) -> TokenAcquisitionResult {
        let parameters = context.user_token_request_parameters();
        context
            .token_acquisition
            .get_user_access_token(context.request, &parameters)
            .await
    }

    async fn client_token(context: &AccessTokenRetrievalContext<'_>) -> AccessTokenResult {
        let parameters = context.user_token_request_parameters();
        match context
            .token_acquisition
            .get_client_access_token(&parameters)
            .await
        {
            TokenAcquisitionResult::Token(access_token) => {
                AccessTokenResult::BearerToken { access_token }
            }
            TokenAcquisitionResult::NoSession => AccessTokenRetrievalError::new(
                "missing_client_token",
                Some("No client access token could be acquired.".to_string()),
            )
            .into(),
            TokenAcquisitionResult::Error {
                error,
                error_description,
            } => AccessTokenRetrievalError::new(error, error_description).into(),
        }
    }
}

#[async_trait(?Send)]
impl AccessTokenRetriever for DefaultAccessTokenRetriever {
    async fn get_access_token(
        &self,
        context: &AccessTokenRetrievalContext<'_>,
    ) -> AccessTokenResult {
        let token_type = self
            .token_type
            .unwrap_or_else(|| context.route.required_token_type());

        if token_type == RequiredTokenType::None {
            return AccessTokenResult::NoAccessToken;
        }
        if token_type == RequiredTokenType::Client {
            return Self::client_token(context).await;
        }

        match Self::user_token(context).await {
            TokenAcquisitionResult::Token(access_token) => {
                AccessTokenResult::BearerToken { access_token }
            }
            TokenAcquisitionResult::NoSession => match token_type {
                RequiredTokenType::UserOrClient => {
                    log::debug!(
                        "no user session for {}, falling back to client token.",
                        context.route.local_path()
                    );
                    Self::client_token(context).await
                }
                RequiredTokenType::UserOrNone => AccessTokenResult::NoAccessToken,
                _ => AccessTokenRetrievalError::new(
                    AccessTokenRetrievalError::MISSING_USER_SESSION,
                    Some("The request has no active user session.".to_string()),
                )
                .into(),
            },
            TokenAcquisitionResult::Error {
                error,
                error_description,
            } => AccessTokenRetrievalError::new(error, error_description).into(),
        }
    }
}

type RetrieverFactory = Arc<dyn Fn() -> Arc<dyn AccessTokenRetriever> + Send + Sync>;

/// Custom retrievers addressable by a stable key from route configuration.
#[derive(Clone, Default)]
pub struct AccessTokenRetrieverRegistry {
    factories: HashMap<String, RetrieverFactory>,
}

impl AccessTokenRetrieverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, key: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn AccessTokenRetriever> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub(crate) fn create(
        &self,
        frontend: &Frontend,
        route: &RemoteApiRoute,
        key: &str,
    ) -> Result<Arc<dyn AccessTokenRetriever>, ConfigurationError> {
        self.factories
            .get(key)
            .map(|factory| factory())
            .ok_or_else(|| ConfigurationError::UnknownAccessTokenRetriever {
                frontend: frontend.name().to_string(),
                local_path: route.local_path().to_string(),
                key: key.to_string(),
            })
    }
}

impl fmt::Debug for AccessTokenRetrieverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}
