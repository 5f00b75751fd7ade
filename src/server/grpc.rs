//! gRPC ext_authz v3 endpoint.

use std::time::{Duration, Instant};

use envoy_types::pb::envoy::service::auth::v3::{
    CheckRequest, CheckResponse,
    authorization_server::{Authorization, AuthorizationServer},
};
use filter_api::{FilterContext, HttpResponse};
use http::StatusCode;
use tonic::{Request, Response, Status};
use tracing::warn;

use crate::evaluator::FilterMux;
use crate::extauthz::{check_response, filter_request};

/// `envoy.service.auth.v3.Authorization`, backed by the evaluator.
pub struct AuthorizationService {
    mux: FilterMux,
    request_timeout: Duration,
}

impl AuthorizationService {
    /// Service evaluating with `mux`, giving filters `request_timeout`.
    pub fn new(mux: FilterMux, request_timeout: Duration) -> Self {
        Self {
            mux,
            request_timeout,
        }
    }

    /// Wrap for a tonic router.
    pub fn into_server(self) -> AuthorizationServer<Self> {
        AuthorizationServer::new(self)
    }
}

#[tonic::async_trait]
impl Authorization for AuthorizationService {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> std::result::Result<Response<CheckResponse>, Status> {
        let check = request.into_inner();
        let mut filter_request = match filter_request(&check) {
            Ok(r) => r,
            Err(e) => {
                let id = uuid::Uuid::new_v4().to_string();
                warn!(request_id = %id, error = %e, "Malformed CheckRequest");
                let denied = HttpResponse::json_error(StatusCode::BAD_REQUEST, "bad request", &id);
                return Ok(Response::new(check_response(&denied.into())));
            }
        };
        if filter_request.id.is_empty() {
            filter_request.id = crate::server::http::request_id(&filter_request.headers);
        }

        let ctx = FilterContext {
            request_id: filter_request.id.clone(),
            deadline: Some(Instant::now() + self.request_timeout),
        };
        let response = self.mux.evaluate(&ctx, filter_request).await;
        Ok(Response::new(check_response(&response)))
    }
}
