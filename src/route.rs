use crate::config::ConfigurationError;
use oauth2::url::Url;
use serde::Deserialize;
use std::time::Duration;

/// Which credential, if any, is attached when a request is proxied.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RequiredTokenType {
    #[default]
    None,
    User,
    Client,
    UserOrClient,
    UserOrNone,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct UserTokenRequestParameters {
    pub sign_in_scheme: Option<String>,
    pub challenge_scheme: Option<String>,
    #[serde(default)]
    pub force_renewal: bool,
    pub resource: Option<String>,
}

/// A local path prefix proxied to a remote API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteApiRoute {
    local_path: String,
    target_uri: Url,
    required_token_type: RequiredTokenType,
    access_token_retriever: Option<String>,
    user_access_token_parameters: Option<UserTokenRequestParameters>,
    activity_timeout: Option<Duration>,
    allow_response_buffering: bool,
    skip_antiforgery: bool,
}

impl RemoteApiRoute {
    pub fn new(local_path: &str, target_uri: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            local_path: normalize_local_path(local_path)?,
            target_uri: parse_target_uri(local_path, target_uri)?,
            required_token_type: RequiredTokenType::None,
            access_token_retriever: None,
            user_access_token_parameters: None,
            activity_timeout: None,
            allow_response_buffering: false,
            skip_antiforgery: false,
        })
    }

    pub fn require_token(mut self, required_token_type: RequiredTokenType) -> Self {
        self.required_token_type = required_token_type;
        self
    }

    /// Uses the retriever registered under `key` instead of the built-in strategy.
    pub fn with_access_token_retriever(mut self, key: impl Into<String>) -> Self {
        self.access_token_retriever = Some(key.into());
        self
    }

    pub fn with_user_access_token_parameters(
        mut self,
        parameters: UserTokenRequestParameters,
    ) -> Self {
        self.user_access_token_parameters = Some(parameters);
        self
    }

    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = Some(timeout);
        self
    }

    pub fn allow_response_buffering(mut self, allow: bool) -> Self {
        self.allow_response_buffering = allow;
        self
    }

    pub fn skip_antiforgery(mut self) -> Self {
        self.skip_antiforgery = true;
        self
    }

    pub fn local_path(&self) -> &str {
        &self.local_path
    }

    pub fn target_uri(&self) -> &Url {
        &self.target_uri
    }

    pub fn required_token_type(&self) -> RequiredTokenType {
        self.required_token_type
    }

    pub fn access_token_retriever(&self) -> Option<&str> {
        self.access_token_retriever.as_deref()
    }

    pub fn user_access_token_parameters(&self) -> Option<&UserTokenRequestParameters> {
        self.user_access_token_parameters.as_ref()
    }

    pub fn activity_timeout(&self) -> Option<Duration> {
        self.activity_timeout
    }

    pub fn response_buffering_allowed(&self) -> bool {
        self.allow_response_buffering
    }

    pub fn requires_antiforgery(&self) -> bool {
        !self.skip_antiforgery
    }

    pub fn matches(&self, path: &str) -> bool {
        matches_path_prefix(path, &self.local_path)
    }
}

/// Route shape accepted from dynamic configuration sources.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub struct RemoteApiRouteConfig {
    pub local_path: String,
    pub target_uri: String,
    #[serde(default)]
    pub required_token_type: RequiredTokenType,
    pub access_token_retriever: Option<String>,
    pub user_access_token_parameters: Option<UserTokenRequestParameters>,
    pub activity_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub allow_response_buffering: bool,
    #[serde(default)]
    pub skip_antiforgery: bool,
}

impl TryFrom<RemoteApiRouteConfig> for RemoteApiRoute {
    type Error = ConfigurationError;

    fn try_from(value: RemoteApiRouteConfig) -> Result<Self, Self::Error> {
        let mut route = RemoteApiRoute::new(&value.local_path, &value.target_uri)?
            .require_token(value.required_token_type)
            .allow_response_buffering(value.allow_response_buffering);
        route.access_token_retriever = value.access_token_retriever;
        route.user_access_token_parameters = value.user_access_token_parameters;
        route.activity_timeout = value.activity_timeout_seconds.map(Duration::from_secs);
        route.skip_antiforgery = value.skip_antiforgery;
        Ok(route)
    }
}

fn normalize_local_path(local_path: &str) -> Result<String, ConfigurationError> {
    if !local_path.starts_with('/') {
        return Err(ConfigurationError::InvalidLocalPath {
            local_path: local_path.to_string(),
        });
    }
    let trimmed = local_path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }
    Ok(trimmed.to_string())
}

fn parse_target_uri(local_path: &str, target_uri: &str) -> Result<Url, ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::InvalidTargetUri {
        local_path: local_path.to_string(),
        target_uri: target_uri.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(target_uri).map_err(|err| invalid(&err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("host is missing"));
    }
    Ok(url)
}

/// Case-insensitive prefix test that only accepts a match ending at a path segment boundary.
pub(crate) fn matches_path_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    let (path, prefix) = (path.as_bytes(), prefix.as_bytes());
    if path.len() < prefix.len() || !path[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return false;
    }
    path.len() == prefix.len() || path[prefix.len()] == b'/'
}
