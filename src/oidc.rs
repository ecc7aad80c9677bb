use crate::{
    acquisition::{TokenAcquisition, TokenAcquisitionResult, UserSession},
    env_var,
    route::UserTokenRequestParameters,
};
use actix_web::{HttpMessage, HttpRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use oauth2::{
    ClientId, ClientSecret, ErrorResponseType, RefreshToken, RequestTokenError, Scope,
    StandardErrorResponse,
};
use openidconnect::{
    core::{CoreClient, CoreProviderMetadata},
    reqwest::async_http_client,
    IssuerUrl, OAuth2TokenResponse,
};
use std::{
    collections::HashSet,
    env::{self, VarError},
    time::Duration,
};

/// Client tokens are renewed this long before they expire.
const CLIENT_TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct CachedClientToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedClientToken {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match (self.expires_at, chrono::Duration::from_std(CLIENT_TOKEN_EXPIRY_SKEW)) {
            (Some(expires_at), Ok(skew)) => now + skew < expires_at,
            (Some(expires_at), Err(_)) => now < expires_at,
            (None, _) => true,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SessionDecision {
    NoSession,
    Use(String),
    Refresh(String),
}

fn decide(
    session: Option<&UserSession>,
    force_renewal: bool,
    now: DateTime<Utc>,
) -> SessionDecision {
    let Some(session) = session else {
        return SessionDecision::NoSession;
    };
    let expired = session.is_expired_at(now);
    if !expired && !force_renewal {
        return SessionDecision::Use(session.access_token().to_string());
    }

    match session.refresh_token() {
        Some(refresh_token) => SessionDecision::Refresh(refresh_token.to_string()),
        None if expired => {
            log::debug!("user token has expired but no refresh token exists.");
            SessionDecision::NoSession
        }
        None => SessionDecision::Use(session.access_token().to_string()),
    }
}

fn expiry_from(now: DateTime<Utc>, expires_in: Option<Duration>) -> Option<DateTime<Utc>> {
    expires_in
        .and_then(|expires_in| chrono::Duration::from_std(expires_in).ok())
        .and_then(|expires_in| now.checked_add_signed(expires_in))
}

fn token_error<RE, T>(err: RequestTokenError<RE, StandardErrorResponse<T>>) -> TokenAcquisitionResult
where
    RE: std::error::Error + 'static,
    T: ErrorResponseType + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => TokenAcquisitionResult::Error {
            error: serde_json::to_value(response.error())
                .ok()
                .and_then(|code| code.as_str().map(str::to_string))
                .unwrap_or_else(|| "invalid_request".to_string()),
            error_description: response.error_description().cloned(),
        },
        other => TokenAcquisitionResult::Error {
            error: "token_endpoint_unavailable".to_string(),
            error_description: Some(other.to_string()),
        },
    }
}

/// [`TokenAcquisition`] backed by an OpenID Connect provider.
///
/// User tokens come from the [`UserSession`] the host's login flow put in the
/// request extensions. Expired sessions, or requests asking for
/// `force_renewal`, are refreshed with the session's refresh token and the
/// renewed session replaces the old one in the extensions.
///
/// Client tokens are obtained with the client-credentials grant and cached per
/// `resource` until shortly before they expire.
pub struct OidcTokenAcquisition {
    client: CoreClient,
    scopes: HashSet<Scope>,
    client_tokens: DashMap<String, CachedClientToken>,
}

impl OidcTokenAcquisition {
    pub fn new(client: CoreClient, scopes: HashSet<Scope>) -> Self {
        Self {
            client,
            scopes,
            client_tokens: DashMap::new(),
        }
    }

    /// Discovers the provider at `AUTHORITY` and authenticates as `CLIENT_ID`
    /// with the optional `CLIENT_SECRET`.
    pub async fn from_env() -> Result<Self, OidcError> {
        let authority =
            env::var(env_var::AUTHORITY).map_err(|_| OidcError::MissingEnvVar(env_var::AUTHORITY))?;
        let client_id =
            env::var(env_var::CLIENT_ID).map_err(|_| OidcError::MissingEnvVar(env_var::CLIENT_ID))?;
        let client_secret = env::var(env_var::CLIENT_SECRET).ok().map(ClientSecret::new);

        let issuer =
            IssuerUrl::new(authority).map_err(|err| OidcError::InvalidIssuer(err.to_string()))?;

        let provider_metadata = CoreProviderMetadata::discover_async(issuer, async_http_client)
            .await
            .map_err(|err| OidcError::Discovery(err.to_string()))?;

        let client = CoreClient::from_provider_metadata(
            provider_metadata,
            ClientId::new(client_id),
            client_secret,
        );

        Ok(Self::new(
            client,
            Self::make_scopes_from_env(env::var(env_var::CLIENT_SCOPES)),
        ))
    }

    fn make_scopes_from_env(env_var_client_scopes: Result<String, VarError>) -> HashSet<Scope> {
        if let Ok(env_scopes) = env_var_client_scopes {
            env_scopes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Scope::new(s.to_string()))
                .collect()
        } else {
            HashSet::new()
        }
    }

    async fn refresh(&self, refresh_token: String) -> Result<UserSession, TokenAcquisitionResult> {
        log::debug!("Starting fetching new token using refresh token.");

        let now = Utc::now();
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
            .request_async(async_http_client)
            .await
            .map_err(|err| {
                log::warn!("Refreshing user token failed: {}.", err);
                token_error(err)
            })?;

        log::debug!("Exchange using refresh token succeeded.");

        let mut renewed = UserSession::new(response.access_token().secret().to_owned())
            .with_refresh_token(
                response
                    .refresh_token()
                    .map(|t| t.secret().to_owned())
                    .unwrap_or(refresh_token),
            );
        if let Some(expires_at) = expiry_from(now, response.expires_in()) {
            renewed = renewed.with_expiry(expires_at);
        }
        Ok(renewed)
    }
}

#[async_trait(?Send)]
impl TokenAcquisition for OidcTokenAcquisition {
    async fn get_user_access_token(
        &self,
        req: &HttpRequest,
        parameters: &UserTokenRequestParameters,
    ) -> TokenAcquisitionResult {
        let session = req.extensions().get::<UserSession>().cloned();
        match decide(session.as_ref(), parameters.force_renewal, Utc::now()) {
            SessionDecision::NoSession => TokenAcquisitionResult::NoSession,
            SessionDecision::Use(access_token) => TokenAcquisitionResult::Token(access_token),
            SessionDecision::Refresh(refresh_token) => match self.refresh(refresh_token).await {
                Ok(renewed) => {
                    let access_token = renewed.access_token().to_string();
                    req.extensions_mut().insert(renewed);
                    TokenAcquisitionResult::Token(access_token)
                }
                Err(result) => result,
            },
        }
    }

    async fn get_client_access_token(
        &self,
        parameters: &UserTokenRequestParameters,
    ) -> TokenAcquisitionResult {
        let key = parameters.resource.clone().unwrap_or_default();
        let now = Utc::now();

        if !parameters.force_renewal {
            if let Some(cached) = self.client_tokens.get(&key) {
                if cached.is_valid_at(now) {
                    return TokenAcquisitionResult::Token(cached.access_token.clone());
                }
            }
        }

        log::debug!("fetching client token for resource {:?}.", key);
        let mut request = self
            .client
            .exchange_client_credentials()
            .add_scopes(self.scopes.clone());
        if let Some(resource) = &parameters.resource {
            request = request.add_extra_param("resource", resource.clone());
        }

        match request.request_async(async_http_client).await {
            Ok(response) => {
                let access_token = response.access_token().secret().to_owned();
                self.client_tokens.insert(
                    key,
                    CachedClientToken {
                        access_token: access_token.clone(),
                        expires_at: expiry_from(now, response.expires_in()),
                    },
                );
                TokenAcquisitionResult::Token(access_token)
            }
            Err(err) => {
                log::warn!("Client credentials request failed: {}.", err);
                token_error(err)
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum OidcError {
    #[error("{0} must be set.")]
    MissingEnvVar(&'static str),
    #[error("Invalid issuer url: {0}.")]
    InvalidIssuer(String),
    #[error("Provider discovery failed: {0}.")]
    Discovery(String),
}
