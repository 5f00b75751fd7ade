//! Authorizer reached over gRPC: `envoy.service.auth.v3.Authorization/Check`.

use std::time::Duration;

use envoy_types::pb::envoy::service::auth::v3::authorization_client::AuthorizationClient;
use filter_api::{FilterRequest, FilterResponse};
use thiserror::Error;
use tonic::transport::{ClientTlsConfig, Endpoint};

use crate::extauthz::{check_request, filter_response};
use crate::resources::ExternalSpec;

/// A check that produced no decision.
#[derive(Debug, Error)]
pub enum GrpcError {
    /// Channel could not be set up or connected
    #[error("connecting to authorizer: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The call itself failed
    #[error("authorizer call failed: {0}")]
    Status(#[from] tonic::Status),
}

pub(super) async fn check(
    spec: &ExternalSpec,
    request: &FilterRequest,
    timeout: Duration,
) -> Result<FilterResponse, GrpcError> {
    let scheme = if spec.tls { "https" } else { "http" };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", spec.auth_service))?
        .connect_timeout(timeout)
        .timeout(timeout);
    if spec.tls {
        endpoint = endpoint.tls_config(ClientTlsConfig::new().with_webpki_roots())?;
    }
    let channel = endpoint.connect().await?;

    let mut client = AuthorizationClient::new(channel);
    let answer = client
        .check(check_request(request, spec.include_body))
        .await?
        .into_inner();
    Ok(filter_response(answer))
}
