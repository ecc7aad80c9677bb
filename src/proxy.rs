use crate::{
    acquisition::TokenAcquisition,
    antiforgery::AntiForgeryGuard,
    config::ConfigurationError,
    forwarder::{self, HttpClientFactory},
    options::BffOptions,
    resolver::SelectedFrontend,
    route::RemoteApiRoute,
    token::{
        AccessTokenResult, AccessTokenRetrievalContext, AccessTokenRetrievalError,
        AccessTokenRetriever, DefaultAccessTokenRetriever,
    },
    transform::{has_dot_segment, TransformError},
};
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, StatusCode},
    Error, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use futures_util::future::LocalBoxFuture;
use serde_json::json;
use std::{
    future::{ready, Ready},
    rc::Rc,
    sync::Arc,
    time::Duration,
};

/// Failures while proxying a matched request. None of them reach the remote
/// API except [`ProxyError::Downstream`] and [`ProxyError::ActivityTimeout`],
/// which happen during the call itself.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("Anti-forgery check failed for {route_id}.")]
    AntiForgery { route_id: String },
    #[error("Access token could not be retrieved: {0}.")]
    TokenRetrieval(#[source] AccessTokenRetrievalError),
    #[error("Access token retriever {key} is not available.")]
    UnknownRetriever { key: String },
    #[error("Request could not be transformed: {0}")]
    Transform(#[from] TransformError),
    #[error("Remote API call failed: {0}")]
    Downstream(#[source] reqwest::Error),
    #[error("Remote API returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("Request body could not be read: {0}")]
    RequestBody(String),
    #[error("Request body exceeds {limit} bytes.")]
    PayloadTooLarge { limit: usize },
    #[error("Request path {0} contains a dot segment.")]
    InvalidPath(String),
    #[error("No activity on the remote API call for {0:?}.")]
    ActivityTimeout(Duration),
}

impl ProxyError {
    fn error_code(&self) -> &str {
        match self {
            Self::AntiForgery { .. } => "antiforgery_check_failed",
            Self::TokenRetrieval(err) => err.error.as_str(),
            Self::UnknownRetriever { .. } => "unknown_access_token_retriever",
            Self::Transform(_) => "transform_failed",
            Self::Downstream(_) | Self::InvalidResponse(_) => "bad_gateway",
            Self::RequestBody(_) => "invalid_request_body",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::InvalidPath(_) => "invalid_request_path",
            Self::ActivityTimeout(_) => "activity_timeout",
        }
    }

    fn error_description(&self) -> Option<String> {
        match self {
            Self::TokenRetrieval(err) => err.error_description.clone(),
            // Reqwest errors carry the target url, which stays internal.
            Self::Downstream(_) => Some("The remote API could not be reached.".to_string()),
            _ => Some(self.to_string()),
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::AntiForgery { .. } => StatusCode::UNAUTHORIZED,
            Self::TokenRetrieval(err) if err.is_unauthenticated() => StatusCode::UNAUTHORIZED,
            Self::TokenRetrieval(_) => StatusCode::BAD_GATEWAY,
            Self::UnknownRetriever { .. } | Self::Transform(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Downstream(_) | Self::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            Self::RequestBody(_) | Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ActivityTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.error_code(),
            "error_description": self.error_description(),
        }))
    }
}

/// The remote API a request was matched to. Available as a request
/// extension once [`RemoteRouteHandler::match_request`] succeeds.
#[derive(Clone, Debug)]
pub struct MatchedRemoteApi {
    frontend: SelectedFrontend,
    route: usize,
}

impl MatchedRemoteApi {
    pub fn frontend(&self) -> &SelectedFrontend {
        &self.frontend
    }

    pub fn route(&self) -> &RemoteApiRoute {
        &self.frontend.frontend().remote_apis()[self.route]
    }

    /// `frontend:local_path`, used in logs.
    pub fn route_id(&self) -> String {
        format!("{}:{}", self.frontend.name(), self.route().local_path())
    }
}

pub enum HandleOutcome {
    Forwarded(HttpResponse),
    NotMatched,
}

/// Proxies requests of the selected frontend to its remote APIs.
pub struct RemoteRouteHandler {
    token_acquisition: Arc<dyn TokenAcquisition>,
    client_factory: Arc<dyn HttpClientFactory>,
    antiforgery: AntiForgeryGuard,
    default_activity_timeout: Duration,
    max_request_body: usize,
    default_retriever: DefaultAccessTokenRetriever,
}

impl RemoteRouteHandler {
    pub fn new(
        token_acquisition: Arc<dyn TokenAcquisition>,
        client_factory: Arc<dyn HttpClientFactory>,
        options: &BffOptions,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            token_acquisition,
            client_factory,
            antiforgery: AntiForgeryGuard::from_options(options)?,
            default_activity_timeout: options.default_activity_timeout,
            max_request_body: options.max_request_body,
            default_retriever: DefaultAccessTokenRetriever::new(),
        })
    }

    /// Finds the first remote API of the selected frontend whose local path
    /// prefixes the request path and records it on the request.
    pub fn match_request(&self, req: &HttpRequest) -> Option<MatchedRemoteApi> {
        let frontend = req.extensions().get::<SelectedFrontend>().cloned()?;
        let route = frontend
            .frontend()
            .remote_apis()
            .iter()
            .position(|route| route.matches(req.path()))?;

        let matched = MatchedRemoteApi { frontend, route };
        req.extensions_mut().insert(matched.clone());
        Some(matched)
    }

    pub async fn handle(&self, req: &HttpRequest, payload: Payload) -> HandleOutcome {
        match self.match_request(req) {
            Some(matched) => HandleOutcome::Forwarded(self.respond(req, &matched, payload).await),
            None => HandleOutcome::NotMatched,
        }
    }

    async fn respond(
        &self,
        req: &HttpRequest,
        matched: &MatchedRemoteApi,
        payload: Payload,
    ) -> HttpResponse {
        match self.forward(req, matched, payload).await {
            Ok(response) => response,
            Err(err) => {
                let route_id = matched.route_id();
                if err.status_code().is_server_error() {
                    log::error!("Proxying {} to {} failed: {}", req.path(), route_id, err);
                } else {
                    log::warn!("Proxying {} to {} rejected: {}", req.path(), route_id, err);
                }
                err.error_response()
            }
        }
    }

    pub async fn forward(
        &self,
        req: &HttpRequest,
        matched: &MatchedRemoteApi,
        payload: Payload,
    ) -> Result<HttpResponse, ProxyError> {
        let route = matched.route();

        if has_dot_segment(req.path()) {
            return Err(ProxyError::InvalidPath(req.path().to_string()));
        }

        if route.requires_antiforgery() && self.antiforgery.check(req).is_err() {
            return Err(ProxyError::AntiForgery {
                route_id: matched.route_id(),
            });
        }

        let declared_length = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared_length.is_some_and(|length| length > self.max_request_body) {
            return Err(ProxyError::PayloadTooLarge {
                limit: self.max_request_body,
            });
        }

        let access_token = self.access_token(req, matched).await?;

        let snapshot = matched.frontend().snapshot();
        let transform = snapshot
            .transforms()
            .get_or_build(matched.frontend().name(), route)?;
        let outbound = transform.apply(req, access_token.as_deref())?;

        let client = self.client_factory.create_client(route);
        let activity_timeout = route
            .activity_timeout()
            .unwrap_or(self.default_activity_timeout);

        log::debug!(
            "forwarding {} {} to {}.",
            outbound.method,
            req.path(),
            outbound.url.host_str().unwrap_or_default()
        );

        let body = forwarder::read_body(payload, activity_timeout, self.max_request_body).await?;
        forwarder::forward(
            client,
            outbound,
            body,
            activity_timeout,
            route.response_buffering_allowed(),
        )
        .await
    }

    async fn access_token(
        &self,
        req: &HttpRequest,
        matched: &MatchedRemoteApi,
    ) -> Result<Option<String>, ProxyError> {
        let route = matched.route();
        let retriever: &dyn AccessTokenRetriever = match route.access_token_retriever() {
            Some(key) => matched
                .frontend()
                .snapshot()
                .retriever(key)
                .map(|retriever| retriever.as_ref())
                .ok_or_else(|| ProxyError::UnknownRetriever {
                    key: key.to_string(),
                })?,
            None => &self.default_retriever,
        };

        let context = AccessTokenRetrievalContext {
            request: req,
            frontend: matched.frontend().frontend(),
            route,
            token_acquisition: self.token_acquisition.as_ref(),
        };

        match retriever.get_access_token(&context).await {
            AccessTokenResult::NoAccessToken => Ok(None),
            AccessTokenResult::BearerToken { access_token } => Ok(Some(access_token)),
            AccessTokenResult::RetrievalError(err) => Err(ProxyError::TokenRetrieval(err)),
        }
    }
}

/// Proxies requests matching a remote API of the selected frontend. Needs
/// [`crate::resolver::FrontendResolution`] to run first; everything else is
/// passed on to the wrapped service.
pub struct BffRemoteApis {
    handler: Arc<RemoteRouteHandler>,
}

impl BffRemoteApis {
    pub fn new(handler: RemoteRouteHandler) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for BffRemoteApis
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = BffRemoteApisMiddleware<S>;

    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(BffRemoteApisMiddleware {
            service: Rc::new(service),
            handler: Arc::clone(&self.handler),
        }))
    }
}

pub struct BffRemoteApisMiddleware<S> {
    service: Rc<S>,
    handler: Arc<RemoteRouteHandler>,
}

impl<S, B> Service<ServiceRequest> for BffRemoteApisMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;

    type Error = Error;

    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let handler = Arc::clone(&self.handler);

        Box::pin(async move {
            let matched = match handler.match_request(req.request()) {
                Some(matched) => matched,
                None => {
                    let res = service.call(req).await?;
                    return Ok(res.map_into_left_body());
                }
            };

            let (request, payload) = req.into_parts();
            let response = handler.respond(&request, &matched, payload).await;
            Ok(ServiceResponse::new(request, response).map_into_right_body())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acquisition::{test::MockTokenAcquisitionStruct, TokenAcquisitionResult},
        config::{FrontendConfiguration, FrontendStore},
        forwarder::PooledHttpClientFactory,
        frontend::Frontend,
        resolver::FrontendResolution,
        route::RequiredTokenType,
        token::AccessTokenRetrieverRegistry,
    };
    use actix_web::{test, web, App};
    use async_trait::async_trait;
    use mockito::Matcher;
    use reqwest::Client;
    use serde_json::Value;

    macro_rules! gateway {
        ($store:expr, $acquisition:expr) => {
            gateway!($store, $acquisition, BffOptions::default())
        };
        ($store:expr, $acquisition:expr, $options:expr) => {
            test::init_service(
                App::new()
                    .wrap(BffRemoteApis::new(handler_with_options(
                        $acquisition,
                        &$options,
                    )))
                    .wrap(FrontendResolution::new(Arc::new($store)))
                    .default_service(web::to(|| async { HttpResponse::Ok().body("local") })),
            )
            .await
        };
    }

    fn handler(acquisition: MockTokenAcquisitionStruct) -> RemoteRouteHandler {
        handler_with_options(acquisition, &BffOptions::default())
    }

    fn handler_with_options(
        acquisition: MockTokenAcquisitionStruct,
        options: &BffOptions,
    ) -> RemoteRouteHandler {
        let client = Client::builder().no_proxy().build().unwrap();
        RemoteRouteHandler::new(
            Arc::new(acquisition),
            Arc::new(PooledHttpClientFactory::from_client(client)),
            options,
        )
        .unwrap()
    }

    fn store(route: RemoteApiRoute) -> FrontendStore {
        store_with_registry(route, AccessTokenRetrieverRegistry::new())
    }

    fn store_with_registry(
        route: RemoteApiRoute,
        registry: AccessTokenRetrieverRegistry,
    ) -> FrontendStore {
        let frontend = Frontend::builder("app")
            .match_path_prefix("/")
            .remote_api(route)
            .build()
            .unwrap();
        FrontendStore::new(FrontendConfiguration::new().frontend(frontend), registry).unwrap()
    }

    fn route(target: &str, token_type: RequiredTokenType) -> RemoteApiRoute {
        RemoteApiRoute::new("/api/orders", target)
            .unwrap()
            .require_token(token_type)
    }

    #[actix_web::test]
    async fn given_token_type_none_when_proxied_then_path_stripped_and_no_credentials_sent() {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/42")
            .match_query(Matcher::UrlEncoded("x".into(), "1".into()))
            .match_header("authorization", Matcher::Missing)
            .match_header("cookie", Matcher::Missing)
            .match_header("x-forwarded-prefix", "/api/orders")
            .with_status(200)
            .with_body("order 42")
            .expect(1)
            .create_async()
            .await;
        let acquisition = MockTokenAcquisitionStruct::new();
        let srv = gateway!(
            store(route(&format!("{}/", server.url()), RequiredTokenType::None)),
            acquisition
        );

        // Act
        let req = test::TestRequest::with_uri("/api/orders/42?x=1")
            .insert_header(("X-CSRF", "1"))
            .insert_header(("Cookie", "session=secret"))
            .insert_header(("Authorization", "Bearer from-browser"))
            .to_request();
        let body = test::call_and_read_body(&srv, req).await;

        // Assert
        mock.assert_async().await;
        assert_eq!(body, "order 42");
    }

    #[actix_web::test]
    async fn given_user_route_without_session_when_proxied_then_unauthorized_and_not_forwarded() {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let mut acquisition = MockTokenAcquisitionStruct::new();
        acquisition
            .expect_get_user_access_token()
            .times(1)
            .returning(|_, _| TokenAcquisitionResult::NoSession);
        let srv = gateway!(
            store(route(&server.url(), RequiredTokenType::User)),
            acquisition
        );

        // Act
        let req = test::TestRequest::with_uri("/api/orders")
            .insert_header(("X-CSRF", "1"))
            .to_request();
        let resp = test::call_service(&srv, req).await;

        // Assert
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "missing_user_session");
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn given_user_route_with_session_when_proxied_then_bearer_token_forwarded() {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/orders")
            .match_header("authorization", "Bearer user-token")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let mut acquisition = MockTokenAcquisitionStruct::new();
        acquisition
            .expect_get_user_access_token()
            .times(1)
            .returning(|_, _| TokenAcquisitionResult::Token("user-token".to_string()));
        let srv = gateway!(
            store(route(
                &format!("{}/orders", server.url()),
                RequiredTokenType::User
            )),
            acquisition
        );

        // Act
        let req = test::TestRequest::with_uri("/api/orders")
            .insert_header(("X-CSRF", "1"))
            .to_request();
        let resp = test::call_service(&srv, req).await;

        // Assert
        assert_eq!(resp.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn given_user_or_client_without_session_when_proxied_then_client_token_forwarded() {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("authorization", "Bearer client-token")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        let mut acquisition = MockTokenAcquisitionStruct::new();
        acquisition
            .expect_get_user_access_token()
            .times(1)
            .returning(|_, _| TokenAcquisitionResult::NoSession);
        acquisition
            .expect_get_client_access_token()
            .times(1)
            .returning(|_| TokenAcquisitionResult::Token("client-token".to_string()));
        let srv = gateway!(
            store(route(&server.url(), RequiredTokenType::UserOrClient)),
            acquisition
        );

        // Act
        let req = test::TestRequest::with_uri("/api/orders")
            .insert_header(("X-CSRF", "1"))
            .to_request();
        let resp = test::call_service(&srv, req).await;

        // Assert
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn given_post_without_antiforgery_header_when_proxied_then_unauthorized_and_not_forwarded(
    ) {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let srv = gateway!(
            store(route(&server.url(), RequiredTokenType::None)),
            MockTokenAcquisitionStruct::new()
        );

        // Act
        let req = test::TestRequest::post()
            .uri("/api/orders")
            .set_payload("{}")
            .to_request();
        let resp = test::call_service(&srv, req).await;

        // Assert
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "antiforgery_check_failed");
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn given_post_with_antiforgery_header_when_proxied_then_body_forwarded() {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(r#"{"item":1}"#)
            .with_status(201)
            .with_body("created")
            .expect(1)
            .create_async()
            .await;
        let srv = gateway!(
            store(route(&server.url(), RequiredTokenType::None)),
            MockTokenAcquisitionStruct::new()
        );

        // Act
        let req = test::TestRequest::post()
            .uri("/api/orders")
            .insert_header(("X-CSRF", "1"))
            .set_payload(r#"{"item":1}"#)
            .to_request();
        let resp = test::call_service(&srv, req).await;

        // Assert
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(test::read_body(resp).await, "created");
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn given_route_skipping_antiforgery_when_proxied_without_header_then_forwarded() {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let srv = gateway!(
            store(route(&server.url(), RequiredTokenType::None).skip_antiforgery()),
            MockTokenAcquisitionStruct::new()
        );

        // Act
        let resp =
            test::call_service(&srv, test::TestRequest::with_uri("/api/orders").to_request())
                .await;

        // Assert
        assert_eq!(resp.status(), StatusCode::OK);
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn given_path_outside_remote_apis_when_request_then_passed_to_app() {
        // Arrange
        let srv = gateway!(
            store(route("https://svc/", RequiredTokenType::User)),
            MockTokenAcquisitionStruct::new()
        );

        // Act
        let body = test::call_and_read_body(
            &srv,
            test::TestRequest::with_uri("/api/ordersX").to_request(),
        )
        .await;

        // Assert
        assert_eq!(body, "local");
    }

    #[actix_web::test]
    async fn given_unreachable_remote_api_when_proxied_then_bad_gateway() {
        // Arrange
        let srv = gateway!(
            store(route("http://127.0.0.1:1/", RequiredTokenType::None)),
            MockTokenAcquisitionStruct::new()
        );

        // Act
        let req = test::TestRequest::with_uri("/api/orders")
            .insert_header(("X-CSRF", "1"))
            .to_request();
        let resp = test::call_service(&srv, req).await;

        // Assert
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn given_dot_segments_in_path_when_proxied_then_bad_request_before_token_retrieval() {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let srv = gateway!(
            store(route(
                &format!("{}/v1/orders/", server.url()),
                RequiredTokenType::User
            )),
            MockTokenAcquisitionStruct::new()
        );

        for uri in [
            "/api/orders/../../admin/secrets",
            "/api/orders/%2e%2e/%2E%2E/admin",
        ] {
            // Act
            let req = test::TestRequest::with_uri(uri)
                .insert_header(("X-CSRF", "1"))
                .to_request();
            let resp = test::call_service(&srv, req).await;

            // Assert
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["error"], "invalid_request_path");
        }
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn given_oversize_body_when_proxied_then_payload_too_large_and_not_forwarded() {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let srv = gateway!(
            store(route(&server.url(), RequiredTokenType::User)),
            MockTokenAcquisitionStruct::new(),
            BffOptions::default().with_max_request_body(8)
        );

        // Act
        let req = test::TestRequest::post()
            .uri("/api/orders")
            .insert_header(("X-CSRF", "1"))
            .set_payload(r#"{"item":"too large"}"#)
            .to_request();
        let resp = test::call_service(&srv, req).await;

        // Assert
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "payload_too_large");
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn given_slow_remote_api_when_activity_timeout_elapses_then_gateway_timeout() {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_body_from_request(|_| {
                std::thread::sleep(Duration::from_millis(500));
                b"late".to_vec()
            })
            .create_async()
            .await;
        let srv = gateway!(
            store(
                route(&server.url(), RequiredTokenType::None)
                    .with_activity_timeout(Duration::from_millis(50))
            ),
            MockTokenAcquisitionStruct::new()
        );

        // Act
        let req = test::TestRequest::with_uri("/api/orders")
            .insert_header(("X-CSRF", "1"))
            .to_request();
        let resp = test::call_service(&srv, req).await;

        // Assert
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "activity_timeout");
    }

    struct FailingRetriever;

    #[async_trait(?Send)]
    impl AccessTokenRetriever for FailingRetriever {
        async fn get_access_token(
            &self,
            _context: &AccessTokenRetrievalContext<'_>,
        ) -> AccessTokenResult {
            AccessTokenRetrievalError::new("unauthorized_client", None).into()
        }
    }

    #[actix_web::test]
    async fn given_custom_retriever_error_when_proxied_then_error_code_relayed_and_not_forwarded()
    {
        // Arrange
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let registry = AccessTokenRetrieverRegistry::new()
            .register("failing", || Arc::new(FailingRetriever) as Arc<dyn AccessTokenRetriever>);
        let srv = gateway!(
            store_with_registry(
                route(&server.url(), RequiredTokenType::User).with_access_token_retriever("failing"),
                registry
            ),
            MockTokenAcquisitionStruct::new()
        );

        // Act
        let req = test::TestRequest::with_uri("/api/orders")
            .insert_header(("X-CSRF", "1"))
            .to_request();
        let resp = test::call_service(&srv, req).await;

        // Assert
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "unauthorized_client");
        mock.assert_async().await;
    }

    #[actix_web::test]
    async fn given_no_selected_frontend_when_handle_then_not_matched() {
        // Arrange
        let req = test::TestRequest::with_uri("/api/orders").to_http_request();
        let handler = handler(MockTokenAcquisitionStruct::new());

        // Act
        let outcome = handler.handle(&req, Payload::None).await;

        // Assert
        assert!(matches!(outcome, HandleOutcome::NotMatched));
    }

    #[actix_web::test]
    async fn test_status_codes_of_token_errors() {
        let unauthenticated = ProxyError::TokenRetrieval(AccessTokenRetrievalError::new(
            "invalid_grant",
            None,
        ));
        let upstream = ProxyError::TokenRetrieval(AccessTokenRetrievalError::new(
            "temporarily_unavailable",
            None,
        ));

        assert_eq!(unauthenticated.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(upstream.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::ActivityTimeout(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::PayloadTooLarge { limit: 1 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyError::InvalidPath("/..".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[actix_web::test]
    async fn given_resolved_frontend_when_match_request_then_first_route_recorded() {
        // Arrange
        let store = FrontendStore::new(
            FrontendConfiguration::new().frontend(
                Frontend::builder("app")
                    .match_path_prefix("/")
                    .remote_api(RemoteApiRoute::new("/api", "https://general/").unwrap())
                    .remote_api(RemoteApiRoute::new("/api/orders", "https://orders/").unwrap())
                    .build()
                    .unwrap(),
            ),
            AccessTokenRetrieverRegistry::new(),
        )
        .unwrap();
        let req = test::TestRequest::with_uri("/api/orders/1").to_http_request();
        let selected = SelectedFrontend::resolve(&store, &req).unwrap();
        req.extensions_mut().insert(selected);
        let handler = handler(MockTokenAcquisitionStruct::new());

        // Act
        let matched = handler.match_request(&req).unwrap();

        // Assert
        assert_eq!(matched.route_id(), "app:/api");
        assert_eq!(matched.route().target_uri().as_str(), "https://general/");
        assert!(req.extensions().get::<MatchedRemoteApi>().is_some());
    }
}
