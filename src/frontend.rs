use crate::{
    config::ConfigurationError,
    route::{matches_path_prefix, RemoteApiRoute},
};
use actix_web::{http::header, HttpRequest};
use oauth2::url::Url;
use std::fmt;

/// How a request is attributed to a frontend. Values are normalized when built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrontendMatchingCriteria {
    PathPrefix(String),
    Host(String),
    Origin(String),
}

impl FrontendMatchingCriteria {
    fn path_prefix(frontend: &str, prefix: &str) -> Result<Self, ConfigurationError> {
        if !prefix.starts_with('/') {
            return Err(ConfigurationError::invalid_criteria(
                frontend,
                format!("path prefix {:?} must start with '/'", prefix),
            ));
        }
        let trimmed = prefix.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::PathPrefix("/".to_string()));
        }
        Ok(Self::PathPrefix(trimmed.to_ascii_lowercase()))
    }

    fn host(frontend: &str, host: &str) -> Result<Self, ConfigurationError> {
        let host = strip_port(host.trim()).to_ascii_lowercase();
        if host.is_empty() {
            return Err(ConfigurationError::invalid_criteria(
                frontend,
                "host must not be empty".to_string(),
            ));
        }
        Ok(Self::Host(host))
    }

    fn origin(frontend: &str, origin: &str) -> Result<Self, ConfigurationError> {
        normalize_origin(origin).map(Self::Origin).ok_or_else(|| {
            ConfigurationError::invalid_criteria(
                frontend,
                format!("origin {:?} must be an absolute http(s) origin", origin),
            )
        })
    }

    pub(crate) fn matches(&self, target: &RequestTarget) -> bool {
        match self {
            Self::PathPrefix(prefix) => matches_path_prefix(&target.path, prefix),
            Self::Host(host) => target
                .host
                .as_deref()
                .is_some_and(|h| strip_port(h).eq_ignore_ascii_case(host)),
            Self::Origin(origin) => target.origin.as_deref() == Some(origin.as_str()),
        }
    }

    /// True when both criteria could select the same request.
    pub(crate) fn overlaps(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::PathPrefix(a), Self::PathPrefix(b)) => {
                matches_path_prefix(a, b) || matches_path_prefix(b, a)
            }
            (Self::Host(a), Self::Host(b)) | (Self::Origin(a), Self::Origin(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for FrontendMatchingCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PathPrefix(prefix) => write!(f, "path prefix {}", prefix),
            Self::Host(host) => write!(f, "host {}", host),
            Self::Origin(origin) => write!(f, "origin {}", origin),
        }
    }
}

/// The parts of an incoming request frontends are matched against.
#[derive(Clone, Debug, Default)]
pub struct RequestTarget {
    pub path: String,
    pub host: Option<String>,
    pub origin: Option<String>,
}

impl From<&HttpRequest> for RequestTarget {
    fn from(req: &HttpRequest) -> Self {
        let host = request_host(req);
        let origin = host
            .as_ref()
            .and_then(|host| normalize_origin(&format!("{}://{}", connection_scheme(req), host)));
        Self {
            path: req.path().to_string(),
            host,
            origin,
        }
    }
}

/// `Host` header, or the uri authority on HTTP/2.
pub(crate) fn request_host(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

/// Scheme of the connection to the gateway. `Forwarded` and
/// `X-Forwarded-Proto` sent by the client are not trusted.
pub(crate) fn connection_scheme(req: &HttpRequest) -> &'static str {
    if req.app_config().secure() {
        "https"
    } else {
        "http"
    }
}

#[derive(Clone, Debug)]
pub struct Frontend {
    name: String,
    criteria: FrontendMatchingCriteria,
    remote_apis: Vec<RemoteApiRoute>,
}

impl Frontend {
    pub fn builder(name: impl Into<String>) -> FrontendBuilder {
        FrontendBuilder {
            name: name.into(),
            criteria: Vec::new(),
            remote_apis: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn criteria(&self) -> &FrontendMatchingCriteria {
        &self.criteria
    }

    pub fn remote_apis(&self) -> &[RemoteApiRoute] {
        &self.remote_apis
    }

    pub fn matches(&self, target: &RequestTarget) -> bool {
        self.criteria.matches(target)
    }

    /// First route, in declaration order, whose local path prefixes `path`.
    pub fn match_route(&self, path: &str) -> Option<&RemoteApiRoute> {
        self.remote_apis.iter().find(|route| route.matches(path))
    }

    pub(crate) fn with_remote_apis(&self, remote_apis: Vec<RemoteApiRoute>) -> Frontend {
        Frontend {
            name: self.name.clone(),
            criteria: self.criteria.clone(),
            remote_apis,
        }
    }
}

enum RawCriteria {
    PathPrefix(String),
    Host(String),
    Origin(String),
}

pub struct FrontendBuilder {
    name: String,
    criteria: Vec<RawCriteria>,
    remote_apis: Vec<RemoteApiRoute>,
}

impl FrontendBuilder {
    pub fn match_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.criteria.push(RawCriteria::PathPrefix(prefix.into()));
        self
    }

    pub fn match_host(mut self, host: impl Into<String>) -> Self {
        self.criteria.push(RawCriteria::Host(host.into()));
        self
    }

    pub fn match_origin(mut self, origin: impl Into<String>) -> Self {
        self.criteria.push(RawCriteria::Origin(origin.into()));
        self
    }

    /// Appends a route unless an equal route is already declared.
    pub fn remote_api(mut self, route: RemoteApiRoute) -> Self {
        if !self.remote_apis.contains(&route) {
            self.remote_apis.push(route);
        }
        self
    }

    pub fn remote_apis(self, routes: impl IntoIterator<Item = RemoteApiRoute>) -> Self {
        routes.into_iter().fold(self, |builder, route| builder.remote_api(route))
    }

    pub fn build(self) -> Result<Frontend, ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::InvalidFrontendName);
        }
        let mut criteria = self.criteria.into_iter();
        let (raw, extra) = (criteria.next(), criteria.next());
        let criteria = match (raw, extra) {
            (Some(_), Some(_)) => {
                return Err(ConfigurationError::invalid_criteria(
                    &self.name,
                    "exactly one matching criterion must be configured".to_string(),
                ))
            }
            (None, _) => {
                return Err(ConfigurationError::invalid_criteria(
                    &self.name,
                    "a matching criterion is required".to_string(),
                ))
            }
            (Some(RawCriteria::PathPrefix(p)), None) => {
                FrontendMatchingCriteria::path_prefix(&self.name, &p)?
            }
            (Some(RawCriteria::Host(h)), None) => FrontendMatchingCriteria::host(&self.name, &h)?,
            (Some(RawCriteria::Origin(o)), None) => {
                FrontendMatchingCriteria::origin(&self.name, &o)?
            }
        };
        Ok(Frontend {
            name: self.name,
            criteria,
            remote_apis: self.remote_apis,
        })
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

fn normalize_origin(origin: &str) -> Option<String> {
    let url = Url::parse(origin.trim_end_matches('/')).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    Some(url.origin().ascii_serialization())
}

#[cfg(test)]
mod test {
    use super::*;
    use actix_web::test::TestRequest;

    fn target(path: &str, host: Option<&str>, origin: Option<&str>) -> RequestTarget {
        RequestTarget {
            path: path.to_string(),
            host: host.map(str::to_string),
            origin: origin.map(str::to_string),
        }
    }

    #[test]
    fn given_path_prefix_when_matches_then_segment_boundary_and_case_respected() {
        // Arrange
        let frontend = Frontend::builder("app")
            .match_path_prefix("/App/")
            .build()
            .unwrap();

        // Assert
        assert_eq!(
            frontend.criteria(),
            &FrontendMatchingCriteria::PathPrefix("/app".to_string())
        );
        assert!(frontend.matches(&target("/APP/index.html", None, None)));
        assert!(frontend.matches(&target("/app", None, None)));
        assert!(!frontend.matches(&target("/application", None, None)));
    }

    #[test]
    fn given_host_criteria_when_matches_then_port_and_case_ignored() {
        // Arrange
        let frontend = Frontend::builder("shop")
            .match_host("Shop.Example.com:8443")
            .build()
            .unwrap();

        // Assert
        assert!(frontend.matches(&target("/", Some("shop.example.COM:443"), None)));
        assert!(frontend.matches(&target("/", Some("shop.example.com"), None)));
        assert!(!frontend.matches(&target("/", Some("admin.example.com"), None)));
        assert!(!frontend.matches(&target("/", None, None)));
    }

    #[test]
    fn given_origin_criteria_when_matches_then_scheme_host_and_port_compared() {
        // Arrange
        let frontend = Frontend::builder("admin")
            .match_origin("https://Admin.example.com:443/")
            .build()
            .unwrap();

        // Assert
        assert_eq!(
            frontend.criteria(),
            &FrontendMatchingCriteria::Origin("https://admin.example.com".to_string())
        );
        assert!(frontend.matches(&target("/", None, Some("https://admin.example.com"))));
        assert!(!frontend.matches(&target("/", None, Some("http://admin.example.com"))));
        assert!(!frontend.matches(&target("/", None, Some("https://admin.example.com:8443"))));
    }

    #[test]
    fn given_no_criteria_when_build_then_error() {
        // Act
        let result = Frontend::builder("empty").build();

        // Assert
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidMatchingCriteria { frontend, .. }) if frontend == "empty"
        ));
    }

    #[test]
    fn given_two_criteria_when_build_then_error() {
        // Act
        let result = Frontend::builder("twice")
            .match_host("a.example.com")
            .match_path_prefix("/a")
            .build();

        // Assert
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidMatchingCriteria { .. })
        ));
    }

    #[test]
    fn given_duplicate_routes_when_build_then_deduplicated_in_order() {
        // Arrange
        let orders = RemoteApiRoute::new("/api/orders", "https://orders/").unwrap();
        let all = RemoteApiRoute::new("/api", "https://api/").unwrap();

        // Act
        let frontend = Frontend::builder("app")
            .match_host("app.example.com")
            .remote_apis([orders.clone(), all.clone(), orders.clone()])
            .build()
            .unwrap();

        // Assert
        assert_eq!(frontend.remote_apis(), &[orders, all]);
    }

    #[test]
    fn given_ordered_routes_when_match_route_then_first_match_wins() {
        // Arrange
        let frontend = Frontend::builder("app")
            .match_host("app.example.com")
            .remote_api(RemoteApiRoute::new("/api", "https://api/").unwrap())
            .remote_api(RemoteApiRoute::new("/api/orders", "https://orders/").unwrap())
            .build()
            .unwrap();

        // Act
        let route = frontend.match_route("/api/orders/1").unwrap();

        // Assert
        assert_eq!(route.local_path(), "/api");
        assert!(frontend.match_route("/other").is_none());
    }

    #[test]
    fn test_overlaps() {
        let a = FrontendMatchingCriteria::PathPrefix("/app".to_string());
        let b = FrontendMatchingCriteria::PathPrefix("/app/admin".to_string());
        let c = FrontendMatchingCriteria::PathPrefix("/apple".to_string());
        let h = FrontendMatchingCriteria::Host("app".to_string());

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&h));
        assert!(h.overlaps(&h.clone()));
    }

    #[test]
    fn given_http_request_when_request_target_then_host_and_origin_extracted() {
        // Arrange
        let req = TestRequest::with_uri("/shop/cart")
            .insert_header((header::HOST, "Shop.example.com:8080"))
            .to_http_request();

        // Act
        let target = RequestTarget::from(&req);

        // Assert
        assert_eq!(target.path, "/shop/cart");
        assert_eq!(target.host.as_deref(), Some("Shop.example.com:8080"));
        assert_eq!(
            target.origin.as_deref(),
            Some("http://shop.example.com:8080")
        );
    }

    #[test]
    fn given_client_forwarded_headers_when_request_target_then_ignored() {
        // Arrange
        let req = TestRequest::with_uri("/")
            .insert_header((header::HOST, "shop.example.com"))
            .insert_header((header::FORWARDED, "proto=https;host=admin.example.com"))
            .insert_header((header::X_FORWARDED_PROTO, "https"))
            .insert_header((header::X_FORWARDED_HOST, "admin.example.com"))
            .to_http_request();

        // Act
        let target = RequestTarget::from(&req);

        // Assert
        assert_eq!(target.host.as_deref(), Some("shop.example.com"));
        assert_eq!(target.origin.as_deref(), Some("http://shop.example.com"));
    }
}
