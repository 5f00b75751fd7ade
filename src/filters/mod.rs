//! Filter implementations.
//!
//! Each kind is a short-lived value built by the evaluator for one
//! invocation, borrowing its validated spec from the snapshot and the
//! per-reference arguments from the rule.

pub mod claims;
pub mod external;
pub mod jwt;
pub mod oauth2;
pub mod plugin;
pub mod template;

use std::sync::Arc;

use async_trait::async_trait;
use filter_api::{BoxError, Filter, FilterContext, FilterRequest, FilterResponse};

use crate::httpclient::HttpClientFactory;
use crate::keypair::Keypair;

pub use external::ExternalFilter;
pub use jwt::JwtFilter;
pub use oauth2::OAuth2Filter;
pub use plugin::PluginRegistry;

/// Process-wide services filters draw on.
#[derive(Clone)]
pub struct FilterDeps {
    /// Cached outbound HTTP
    pub http: Arc<HttpClientFactory>,
    /// Signs and verifies OAuth2 state
    pub keypair: Arc<Keypair>,
}

/// Always allows, changing nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalFilter;

#[async_trait]
impl Filter for InternalFilter {
    async fn filter(
        &self,
        _ctx: &FilterContext,
        _request: &FilterRequest,
    ) -> Result<FilterResponse, BoxError> {
        Ok(FilterResponse::allow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn internal_allows_without_changes() {
        let request = FilterRequest::new(
            http::Method::POST,
            &url::Url::parse("http://svc/anything").unwrap(),
        );
        let response = InternalFilter
            .filter(&FilterContext::default(), &request)
            .await
            .unwrap();
        assert_eq!(response, FilterResponse::allow());
    }
}
