//! Delegated authorization.
//!
//! The decision is handed to another service, either as a plain HTTP
//! request mirroring the original or as an `ext_authz` v3 check. When that
//! service cannot be reached in time the filter fails open or closed per
//! `failureModeAllow`.

mod via_grpc;
mod via_http;

use async_trait::async_trait;
use filter_api::{BoxError, Filter, FilterContext, FilterRequest, FilterResponse, HttpResponse};
use tracing::{debug, warn};

use super::FilterDeps;
use crate::resources::{ExternalSpec, Proto, QName};

pub use self::via_grpc::GrpcError;

/// One invocation of an External filter.
pub struct ExternalFilter<'a> {
    qname: &'a QName,
    spec: &'a ExternalSpec,
    deps: &'a FilterDeps,
}

impl<'a> ExternalFilter<'a> {
    /// Bind a validated spec.
    pub fn new(qname: &'a QName, spec: &'a ExternalSpec, deps: &'a FilterDeps) -> Self {
        Self { qname, spec, deps }
    }

    async fn call(&self, request: &FilterRequest, timeout: std::time::Duration) -> Result<FilterResponse, BoxError> {
        match self.spec.proto {
            Proto::Http => Ok(via_http::check(self.deps.http.no_redirect(), self.spec, request, timeout).await?),
            Proto::Grpc => Ok(via_grpc::check(self.spec, request, timeout).await?),
        }
    }
}

#[async_trait]
impl Filter for ExternalFilter<'_> {
    async fn filter(
        &self,
        ctx: &FilterContext,
        request: &FilterRequest,
    ) -> Result<FilterResponse, BoxError> {
        let timeout = ctx.bounded(self.spec.timeout);
        let outcome = match tokio::time::timeout(timeout, self.call(request, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(format!("no answer within {timeout:?}").into()),
        };

        match outcome {
            Ok(response) => {
                debug!(filter = %self.qname, allow = response.is_allow(), "Authorizer answered");
                Ok(response)
            }
            Err(e) if self.spec.failure_mode_allow => {
                warn!(filter = %self.qname, error = %e, "Authorizer unavailable; failure mode allow");
                Ok(FilterResponse::allow())
            }
            Err(e) => {
                warn!(filter = %self.qname, error = %e, "Authorizer unavailable");
                Ok(HttpResponse::json_error(
                    self.spec.status_on_error,
                    "authorization service unavailable",
                    &ctx.request_id,
                )
                .into())
            }
        }
    }
}
