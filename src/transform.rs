use crate::{
    frontend::{connection_scheme, request_host},
    route::RemoteApiRoute,
};
use actix_web::HttpRequest;
use dashmap::DashMap;
use oauth2::url::Url;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONNECTION},
    Method,
};
use std::sync::Arc;
use thiserror::Error;

const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Never copied from the inbound request: the client computes them, or the
/// gateway owns them.
const GATEWAY_OWNED_HEADERS: [&str; 8] = [
    "host",
    "content-length",
    "cookie",
    "authorization",
    "forwarded",
    X_FORWARDED_PROTO,
    X_FORWARDED_HOST,
    X_FORWARDED_PREFIX,
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("target_uri {0} cannot be used as a base uri")]
    TargetNotABase(String),
    #[error("Unable to build outbound uri: {0}")]
    Uri(String),
    #[error("Invalid {name} header: {reason}")]
    Header { name: String, reason: String },
    #[error("Path {0} contains a dot segment")]
    DotSegment(String),
}

pub(crate) fn is_hop_by_hop_header(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// True when a segment of `path` is `.` or `..`, plain or percent-encoded.
/// The outbound uri would resolve such a segment and could leave the target path.
pub(crate) fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// The rewritten request sent to a remote API.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

/// Rewrites requests for one remote API route. Depends only on the route.
#[derive(Debug)]
pub struct RouteTransform {
    local_path: String,
    target: Url,
}

impl RouteTransform {
    pub fn build(route: &RemoteApiRoute) -> Result<Self, TransformError> {
        let target = route.target_uri().clone();
        if target.cannot_be_a_base() {
            return Err(TransformError::TargetNotABase(target.to_string()));
        }
        Ok(Self {
            local_path: route.local_path().to_string(),
            target,
        })
    }

    /// Target uri for `path` with the local path prefix removed. Paths with
    /// dot segments are refused.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Result<Url, TransformError> {
        if has_dot_segment(path) {
            return Err(TransformError::DotSegment(path.to_string()));
        }
        let remainder = if self.local_path == "/" {
            path
        } else {
            path.get(self.local_path.len()..).unwrap_or_default()
        };
        let base = self.target.path().trim_end_matches('/');
        let mut url = self.target.clone();
        let joined = format!("{}{}", base, remainder);
        url.set_path(if joined.is_empty() { "/" } else { &joined });
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    pub fn apply(
        &self,
        req: &HttpRequest,
        access_token: Option<&str>,
    ) -> Result<OutboundRequest, TransformError> {
        let method = Method::from_bytes(req.method().as_str().as_bytes())
            .map_err(|err| TransformError::Uri(err.to_string()))?;
        let url = self.target_url(req.path(), req.uri().query())?;
        let headers = self.outbound_headers(req, access_token)?;

        Ok(OutboundRequest {
            method,
            url,
            headers,
        })
    }

    fn outbound_headers(
        &self,
        req: &HttpRequest,
        access_token: Option<&str>,
    ) -> Result<HeaderMap, TransformError> {
        let connection_listed: Vec<String> = req
            .headers()
            .get_all(CONNECTION.as_str())
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_ascii_lowercase())
            .collect();

        let mut headers = HeaderMap::new();
        for (name, value) in req.headers().iter() {
            let name = name.as_str();
            if is_hop_by_hop_header(name)
                || GATEWAY_OWNED_HEADERS.contains(&name)
                || connection_listed.iter().any(|c| c == name)
            {
                continue;
            }
            headers.append(
                header_name(name)?,
                HeaderValue::from_bytes(value.as_bytes()).map_err(|err| header_error(name, err))?,
            );
        }

        if let Some(peer) = req.peer_addr() {
            let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{}, {}", existing, peer.ip()),
                None => peer.ip().to_string(),
            };
            insert(&mut headers, X_FORWARDED_FOR, &forwarded_for)?;
        }
        insert(&mut headers, X_FORWARDED_PROTO, connection_scheme(req))?;
        let host = request_host(req).unwrap_or_else(|| req.app_config().host().to_string());
        insert(&mut headers, X_FORWARDED_HOST, &host)?;
        if self.local_path != "/" {
            insert(&mut headers, X_FORWARDED_PREFIX, &self.local_path)?;
        }

        if let Some(token) = access_token {
            insert(
                &mut headers,
                AUTHORIZATION.as_str(),
                &format!("Bearer {}", token),
            )?;
        }
        Ok(headers)
    }
}

fn header_name(name: &str) -> Result<HeaderName, TransformError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|err| header_error(name, err))
}

fn header_error(name: &str, err: impl std::fmt::Display) -> TransformError {
    TransformError::Header {
        name: name.to_string(),
        reason: err.to_string(),
    }
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), TransformError> {
    let value = HeaderValue::from_str(value).map_err(|err| header_error(name, err))?;
    headers.insert(header_name(name)?, value);
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct TransformKey {
    frontend: String,
    local_path: String,
}

/// Lazily built transforms, one per frontend and local path.
#[derive(Debug, Default)]
pub struct TransformCache {
    entries: DashMap<TransformKey, Arc<RouteTransform>>,
}

impl TransformCache {
    /// Concurrent builders for the same key converge on the first inserted transform.
    pub fn get_or_build(
        &self,
        frontend: &str,
        route: &RemoteApiRoute,
    ) -> Result<Arc<RouteTransform>, TransformError> {
        let key = TransformKey {
            frontend: frontend.to_string(),
            local_path: route.local_path().to_string(),
        };
        if let Some(existing) = self.entries.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let built = Arc::new(RouteTransform::build(route)?);
        log::debug!("built transform for {}:{}.", frontend, route.local_path());
        Ok(Arc::clone(self.entries.entry(key).or_insert(built).value()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
