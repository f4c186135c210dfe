use std::future::{Future, Ready};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header;

use crate::error::Error as ApiError;

/// Bearer-token guard for the whole API surface. The ping endpoint is the
/// only unauthenticated route.
pub struct BearerAuth {
    token: Arc<String>,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(token.into()),
        }
    }
}

impl<S: 'static, B> Transform<S, ServiceRequest> for BearerAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type InitError = ();
    type Transform = BearerAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(BearerAuthMiddleware {
            service: Arc::new(service),
            token: Arc::clone(&self.token),
        }))
    }
}

pub struct BearerAuthMiddleware<S> {
    service: Arc<S>,
    token: Arc<String>,
}

impl<S, B> Service<ServiceRequest> for BearerAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = Arc::clone(&self.service);
        let token = Arc::clone(&self.token);

        Box::pin(async move {
            if req.path().ends_with("/system/ping") {
                return svc.call(req).await;
            }

            let Some(auth_header) = req.headers().get(header::AUTHORIZATION) else {
                return Err(ApiError::Unauthorized.into());
            };

            let Ok(value) = auth_header.to_str() else {
                return Err(ApiError::Unauthorized.into());
            };

            let Some(presented) = value.strip_prefix("Bearer ") else {
                return Err(ApiError::Unauthorized.into());
            };

            if presented != token.as_str() {
                return Err(ApiError::Unauthorized.into());
            }

            svc.call(req).await
        })
    }
}
