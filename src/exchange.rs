use crate::{
    acquisition::TokenAcquisitionResult,
    token::{
        AccessTokenResult, AccessTokenRetrievalContext, AccessTokenRetrievalError,
        AccessTokenRetriever, DefaultAccessTokenRetriever,
    },
};
use async_trait::async_trait;
use oauth2::url::Url;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Whether the exchanged token only represents the user, or the user with
/// the gateway acting on its behalf.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TokenExchangeMode {
    #[default]
    Impersonation,
    /// Sends the gateway's client-credentials token as `actor_token`.
    Delegation,
}

#[derive(Clone, Debug)]
pub struct TokenExchangeOptions {
    pub token_endpoint: Url,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub audience: Option<String>,
    pub resource: Option<String>,
    pub scope: Option<String>,
    pub mode: TokenExchangeMode,
}

impl TokenExchangeOptions {
    pub fn new(token_endpoint: Url, client_id: impl Into<String>) -> Self {
        Self {
            token_endpoint,
            client_id: client_id.into(),
            client_secret: None,
            audience: None,
            resource: None,
            scope: None,
            mode: TokenExchangeMode::Impersonation,
        }
    }

    pub fn with_client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn delegation(mut self) -> Self {
        self.mode = TokenExchangeMode::Delegation;
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TokenExchangeError {
    #[error("Token endpoint rejected the exchange: {error}")]
    Endpoint {
        error: String,
        error_description: Option<String>,
    },
    #[error("Token endpoint response has no access_token")]
    MissingAccessToken,
    #[error("Token endpoint could not be called: {0}")]
    Request(#[source] reqwest::Error),
    #[error("Actor token could not be acquired: {0}")]
    ActorToken(#[source] AccessTokenRetrievalError),
}

impl From<TokenExchangeError> for AccessTokenRetrievalError {
    fn from(value: TokenExchangeError) -> Self {
        match value {
            TokenExchangeError::Endpoint {
                error,
                error_description,
            } => AccessTokenRetrievalError::new(error, error_description),
            err @ TokenExchangeError::MissingAccessToken => {
                AccessTokenRetrievalError::new("invalid_token_response", Some(err.to_string()))
            }
            TokenExchangeError::Request(_) => AccessTokenRetrievalError::new(
                "token_exchange_unavailable",
                Some("The token endpoint could not be reached.".to_string()),
            ),
            TokenExchangeError::ActorToken(err) => err,
        }
    }
}

#[derive(Deserialize)]
struct TokenExchangeResponse {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenEndpointError {
    error: String,
    error_description: Option<String>,
}

/// Exchanges the token of an inner retriever at an RFC 8693 token endpoint,
/// so the remote API receives a token issued for it. Results other than a
/// bearer token pass through unchanged.
pub struct TokenExchangeRetriever {
    inner: Arc<dyn AccessTokenRetriever>,
    options: TokenExchangeOptions,
    http: Client,
}

impl TokenExchangeRetriever {
    /// Exchanges the user's token.
    pub fn new(options: TokenExchangeOptions, http: Client) -> Self {
        Self {
            inner: Arc::new(DefaultAccessTokenRetriever::user()),
            options,
            http,
        }
    }

    pub fn with_inner(mut self, inner: Arc<dyn AccessTokenRetriever>) -> Self {
        self.inner = inner;
        self
    }

    async fn actor_token(
        &self,
        context: &AccessTokenRetrievalContext<'_>,
    ) -> Result<Option<String>, TokenExchangeError> {
        if self.options.mode == TokenExchangeMode::Impersonation {
            return Ok(None);
        }
        let parameters = context.user_token_request_parameters();
        match context
            .token_acquisition
            .get_client_access_token(&parameters)
            .await
        {
            TokenAcquisitionResult::Token(token) => Ok(Some(token)),
            TokenAcquisitionResult::NoSession => Err(TokenExchangeError::ActorToken(
                AccessTokenRetrievalError::new("missing_client_token", None),
            )),
            TokenAcquisitionResult::Error {
                error,
                error_description,
            } => Err(TokenExchangeError::ActorToken(
                AccessTokenRetrievalError::new(error, error_description),
            )),
        }
    }

    async fn exchange(
        &self,
        subject_token: &str,
        actor_token: Option<&str>,
    ) -> Result<String, TokenExchangeError> {
        let options = &self.options;
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", subject_token),
            ("subject_token_type", TOKEN_TYPE_ACCESS_TOKEN),
        ];
        if let Some(actor_token) = actor_token {
            form.push(("actor_token", actor_token));
            form.push(("actor_token_type", TOKEN_TYPE_ACCESS_TOKEN));
        }
        for (name, value) in [
            ("audience", &options.audience),
            ("resource", &options.resource),
            ("scope", &options.scope),
        ] {
            if let Some(value) = value {
                form.push((name, value.as_str()));
            }
        }

        let mut request = self.http.post(options.token_endpoint.clone());
        request = match &options.client_secret {
            Some(secret) => request.basic_auth(&options.client_id, Some(secret)),
            None => {
                form.push(("client_id", options.client_id.as_str()));
                request
            }
        };

        log::debug!("exchanging token at {}.", options.token_endpoint);
        let response = request
            .form(&form)
            .send()
            .await
            .map_err(TokenExchangeError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response
                .json::<TokenEndpointError>()
                .await
                .unwrap_or_else(|_| TokenEndpointError {
                    error: "token_exchange_failed".to_string(),
                    error_description: Some(format!("Token endpoint responded with {}.", status)),
                });
            return Err(TokenExchangeError::Endpoint {
                error: error.error,
                error_description: error.error_description,
            });
        }

        response
            .json::<TokenExchangeResponse>()
            .await
            .map_err(TokenExchangeError::Request)?
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(TokenExchangeError::MissingAccessToken)
    }
}

#[async_trait(?Send)]
impl AccessTokenRetriever for TokenExchangeRetriever {
    async fn get_access_token(
        &self,
        context: &AccessTokenRetrievalContext<'_>,
    ) -> AccessTokenResult {
        let subject_token = match self.inner.get_access_token(context).await {
            AccessTokenResult::BearerToken { access_token } => access_token,
            other => return other,
        };

        let exchanged = match self.actor_token(context).await {
            Ok(actor_token) => self.exchange(&subject_token, actor_token.as_deref()).await,
            Err(err) => Err(err),
        };

        match exchanged {
            Ok(access_token) => AccessTokenResult::BearerToken { access_token },
            Err(err) => {
                log::warn!(
                    "Token exchange for {} failed: {}.",
                    context.route.local_path(),
                    err
                );
                AccessTokenRetrievalError::from(err).into()
            }
        }
    }
}
