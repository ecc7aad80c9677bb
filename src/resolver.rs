use crate::{
    config::{FrontendSnapshot, FrontendStore},
    frontend::{Frontend, RequestTarget},
};
use actix_web::{
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    Error, FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use futures_util::future::LocalBoxFuture;
use serde_json::json;
use std::{
    future::{ready, Ready},
    sync::Arc,
};

/// The frontend serving the current request, together with the snapshot it
/// was resolved from. Later stages read routes and retrievers from this
/// snapshot even if the configuration is reloaded meanwhile.
#[derive(Clone, Debug)]
pub struct SelectedFrontend {
    snapshot: Arc<FrontendSnapshot>,
    frontend: Arc<Frontend>,
}

impl SelectedFrontend {
    pub(crate) fn new(snapshot: Arc<FrontendSnapshot>, frontend: Arc<Frontend>) -> Self {
        Self { snapshot, frontend }
    }

    pub fn frontend(&self) -> &Frontend {
        &self.frontend
    }

    pub fn name(&self) -> &str {
        self.frontend.name()
    }

    pub fn snapshot(&self) -> &Arc<FrontendSnapshot> {
        &self.snapshot
    }

    pub(crate) fn resolve(store: &FrontendStore, req: &HttpRequest) -> Option<Self> {
        let snapshot = store.snapshot();
        let frontend = snapshot.resolve(&RequestTarget::from(req))?;
        Some(Self::new(snapshot, frontend))
    }
}

#[derive(thiserror::Error, Debug)]
#[error("No frontend is configured for this request.")]
pub struct FrontendNotSelected;

impl ResponseError for FrontendNotSelected {
    fn status_code(&self) -> StatusCode {
        StatusCode::NOT_FOUND
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": "frontend_not_found",
            "error_description": self.to_string(),
        }))
    }
}

impl FromRequest for SelectedFrontend {
    type Error = FrontendNotSelected;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<SelectedFrontend>()
                .cloned()
                .ok_or(FrontendNotSelected),
        )
    }
}

/// Resolves the frontend of each request and stores it as a
/// [`SelectedFrontend`] request extension. Requests matching no frontend
/// pass through untouched.
pub struct FrontendResolution {
    store: Arc<FrontendStore>,
}

impl FrontendResolution {
    pub fn new(store: Arc<FrontendStore>) -> Self {
        Self { store }
    }
}

impl<S, B> Transform<S, ServiceRequest> for FrontendResolution
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;

    type Error = Error;

    type Transform = FrontendResolutionMiddleware<S>;

    type InitError = ();

    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(FrontendResolutionMiddleware {
            service,
            store: Arc::clone(&self.store),
        }))
    }
}

pub struct FrontendResolutionMiddleware<S> {
    service: S,
    store: Arc<FrontendStore>,
}

impl<S, B> Service<ServiceRequest> for FrontendResolutionMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;

    type Error = Error;

    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        match SelectedFrontend::resolve(&self.store, req.request()) {
            Some(selected) => {
                log::debug!("request {} served by frontend {}.", req.path(), selected.name());
                req.extensions_mut().insert(selected);
            }
            None => log::debug!("no frontend matches request {}.", req.path()),
        }

        let fut = self.service.call(req);
        Box::pin(fut)
    }
}
