use crate::{config::ConfigurationError, options::BffOptions};
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header::HeaderName, StatusCode},
    Error, HttpRequest, HttpResponse, ResponseError,
};
use futures_util::future::LocalBoxFuture;
use serde_json::json;
use std::{
    future::{ready, Ready},
    rc::Rc,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Anti-forgery header {header} is missing or has an unexpected value.")]
pub struct AntiForgeryRejection {
    header: String,
}

impl ResponseError for AntiForgeryRejection {
    fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": "antiforgery_check_failed",
            "error_description": self.to_string(),
        }))
    }
}

/// Requires a custom header on browser calls. With `header_value` unset any
/// non-empty value passes.
#[derive(Clone, Debug)]
pub struct AntiForgeryGuard {
    header_name: HeaderName,
    header_value: Option<String>,
}

impl AntiForgeryGuard {
    pub fn new(header_name: HeaderName, header_value: Option<String>) -> Self {
        Self {
            header_name,
            header_value,
        }
    }

    pub fn from_options(options: &BffOptions) -> Result<Self, ConfigurationError> {
        Ok(Self::new(
            options.antiforgery_header()?,
            options.antiforgery_header_value.clone(),
        ))
    }

    pub fn check(&self, req: &HttpRequest) -> Result<(), AntiForgeryRejection> {
        let value = req
            .headers()
            .get(&self.header_name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim);

        let accepted = match (value, &self.header_value) {
            (Some(actual), Some(expected)) => actual == expected,
            (Some(actual), None) => !actual.is_empty(),
            (None, _) => false,
        };

        if accepted {
            Ok(())
        } else {
            Err(AntiForgeryRejection {
                header: self.header_name.to_string(),
            })
        }
    }
}

impl Default for AntiForgeryGuard {
    fn default() -> Self {
        Self::new(
            HeaderName::from_static("x-csrf"),
            Some(BffOptions::DEFAULT_ANTIFORGERY_HEADER_VALUE.to_string()),
        )
    }
}

/// Applies the anti-forgery guard to local endpoints of the BFF, such as a
/// scope serving user info to the frontend.
#[derive(Clone, Debug, Default)]
pub struct BffApiEndpoint {
    guard: AntiForgeryGuard,
}

impl BffApiEndpoint {
    pub fn new(guard: AntiForgeryGuard) -> Self {
        Self { guard }
    }

    pub fn from_options(options: &BffOptions) -> Result<Self, ConfigurationError> {
        AntiForgeryGuard::from_options(options).map(Self::new)
    }
}

impl<S, B> Transform<S, ServiceRequest> for BffApiEndpoint
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = BffApiEndpointMiddleware<S>;

    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(BffApiEndpointMiddleware {
            service: Rc::new(service),
            guard: self.guard.clone(),
        }))
    }
}

pub struct BffApiEndpointMiddleware<S> {
    service: Rc<S>,
    guard: AntiForgeryGuard,
}

impl<S, B> Service<ServiceRequest> for BffApiEndpointMiddleware<S>
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
        if let Err(rejection) = self.guard.check(req.request()) {
            log::warn!("Local BFF endpoint {} rejected: {}", req.path(), rejection);
            let response = rejection.error_response();
            return Box::pin(ready(Ok(req.into_response(response).map_into_right_body())));
        }

        let service = Rc::clone(&self.service);
        Box::pin(async move {
            let res = service.call(req).await?;
            Ok(res.map_into_left_body())
        })
    }
}
