/// Name of the request header carrying the anti-forgery marker.
pub(crate) const BFF_ANTIFORGERY_HEADER_NAME: &str = "BFF_ANTIFORGERY_HEADER_NAME";
/// Expected marker value. Empty means any non-empty value is accepted.
pub(crate) const BFF_ANTIFORGERY_HEADER_VALUE: &str = "BFF_ANTIFORGERY_HEADER_VALUE";
pub(crate) const BFF_ACTIVITY_TIMEOUT_SECONDS: &str = "BFF_ACTIVITY_TIMEOUT_SECONDS";
pub(crate) const BFF_MAX_REQUEST_BODY_BYTES: &str = "BFF_MAX_REQUEST_BODY_BYTES";

pub(crate) const AUTHORITY: &str = "AUTHORITY";
pub(crate) const CLIENT_ID: &str = "CLIENT_ID";
pub(crate) const CLIENT_SECRET: &str = "CLIENT_SECRET";

/// Comma seperated list of scopes requested with client credentials.
pub(crate) const CLIENT_SCOPES: &str = "CLIENT_SCOPES";
