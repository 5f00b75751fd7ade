//! Filter chain evaluation
//!
//! [`FilterMux`] takes one authorization check, picks the rule for its URL
//! from the current snapshot, and runs the rule's filters in order:
//!
//! - a filter whose `ifRequestHeader` does not match is skipped;
//! - an allow is applied to the request (so the next filter sees it) and
//!   accumulated; `onAllow: break` stops the chain there;
//! - a deny is returned as is unless `onDeny: continue`.
//!
//! Whatever goes wrong inside a filter (an error, a panic, the deadline)
//! becomes a 500 carrying the request id. Nothing here retries.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use filter_api::{
    BoxError, Filter, FilterContext, FilterRequest, FilterResponse, HttpRequestModification,
    HttpResponse,
};
use futures::FutureExt;
use http::StatusCode;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::filters::oauth2::logout::logout;
use crate::filters::{ExternalFilter, FilterDeps, InternalFilter, JwtFilter, OAuth2Filter};
use crate::resources::oauth2::OAuth2Arguments;
use crate::resources::{ChainAction, FilterReference};
use crate::snapshot::{FilterSpec, LOGOUT_PATH, Snapshot, SnapshotStore};

/// Runs filter chains against the current snapshot.
#[derive(Clone)]
pub struct FilterMux {
    snapshots: Arc<SnapshotStore>,
    deps: FilterDeps,
}

/// Why a chain stopped without a filter's answer.
enum Abort {
    /// Served as is
    Respond(HttpResponse),
    /// Logged, then served as a 500
    Fail(String),
}

impl FilterMux {
    /// Evaluator over `snapshots`, giving filters `deps`.
    pub fn new(snapshots: Arc<SnapshotStore>, deps: FilterDeps) -> Self {
        Self { snapshots, deps }
    }

    /// The store reloads publish to.
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// Services handed to filters.
    pub fn deps(&self) -> &FilterDeps {
        &self.deps
    }

    /// Decide on one request.
    pub async fn evaluate(&self, ctx: &FilterContext, request: FilterRequest) -> FilterResponse {
        let snapshot = self.snapshots.load();
        let method = request.method.clone();

        let url = match request.url() {
            Ok(url) => url,
            Err(e) => {
                warn!(request_id = %ctx.request_id, host = %request.host, path = %request.path, error = %e, "Unparseable request URL");
                return HttpResponse::json_error(StatusCode::BAD_REQUEST, "bad request", &ctx.request_id)
                    .into();
            }
        };

        if url.path() == LOGOUT_PATH {
            let served = async {
                within_deadline(ctx, logout(&snapshot, &self.deps, &request))
                    .await
                    .map(FilterResponse::from)
                    .ok_or_else(|| Abort::Fail("deadline exceeded in logout".to_string()))
            };
            let response = guarded(ctx, &url, served).await;
            info!(request_id = %ctx.request_id, %method, url = %url, status = status_of(&response), "Logout");
            return response;
        }

        let rule = snapshot.find_rule(&url);
        let response = guarded(
            ctx,
            &url,
            self.run_chain(&snapshot, &rule.filters, ctx, request),
        )
        .await;

        match &response {
            FilterResponse::Modification(m) => info!(
                request_id = %ctx.request_id,
                %method,
                url = %url,
                rule_host = %rule.host,
                rule_path = %rule.path,
                headers = m.headers.len(),
                "ALLOW"
            ),
            FilterResponse::Response(r) => info!(
                request_id = %ctx.request_id,
                %method,
                url = %url,
                rule_host = %rule.host,
                rule_path = %rule.path,
                status = r.status.as_u16(),
                "DENY"
            ),
        }
        response
    }

    async fn run_chain(
        &self,
        snapshot: &Snapshot,
        filters: &[FilterReference],
        ctx: &FilterContext,
        mut request: FilterRequest,
    ) -> Result<FilterResponse, Abort> {
        let mut accumulated = HttpRequestModification::new();

        for reference in filters {
            if !reference.if_request_header.matches(&request.headers) {
                debug!(request_id = %ctx.request_id, filter = %reference.qname, "Skipped by ifRequestHeader");
                continue;
            }

            let response = self.invoke(snapshot, reference, ctx, &request).await?;
            match response {
                FilterResponse::Response(denied) => {
                    debug!(request_id = %ctx.request_id, filter = %reference.qname, status = denied.status.as_u16(), "Filter denied");
                    if reference.on_deny == ChainAction::Break {
                        return Ok(denied.into());
                    }
                }
                FilterResponse::Modification(modification) => {
                    debug!(request_id = %ctx.request_id, filter = %reference.qname, headers = modification.headers.len(), "Filter allowed");
                    modification.apply(&mut request);
                    accumulated.extend(modification);
                    if reference.on_allow == ChainAction::Break {
                        return Ok(accumulated.into());
                    }
                }
            }
        }

        Ok(accumulated.into())
    }

    async fn invoke(
        &self,
        snapshot: &Snapshot,
        reference: &FilterReference,
        ctx: &FilterContext,
        request: &FilterRequest,
    ) -> Result<FilterResponse, Abort> {
        let qname = &reference.qname;
        let Some(info) = snapshot.filters.get(qname) else {
            return Err(Abort::Respond(internal_error(
                ctx,
                &format!("could not find filter {qname}"),
            )));
        };
        let misconfigured = |e: &str| {
            Abort::Respond(internal_error(
                ctx,
                &format!("error in filter {qname} configuration: {e}"),
            ))
        };
        let spec = info.spec.as_ref().map_err(|e| misconfigured(e.as_str()))?;

        let owned: Box<dyn Filter + '_>;
        let filter: &dyn Filter = match spec {
            FilterSpec::OAuth2(spec) => {
                let arguments = OAuth2Arguments::from_value(&reference.arguments)
                    .map_err(|e| misconfigured(e.as_str()))?;
                owned = Box::new(OAuth2Filter::new(qname, spec, arguments, &self.deps));
                owned.as_ref()
            }
            FilterSpec::Jwt(spec) => {
                owned = Box::new(JwtFilter::new(qname, spec, &self.deps));
                owned.as_ref()
            }
            FilterSpec::External(spec) => {
                owned = Box::new(ExternalFilter::new(qname, spec, &self.deps));
                owned.as_ref()
            }
            FilterSpec::Plugin(plugin) => plugin.as_ref(),
            FilterSpec::Internal => &InternalFilter,
        };

        let outcome = within_deadline(ctx, filter.filter(ctx, request))
            .await
            .ok_or_else(|| Abort::Fail(format!("deadline exceeded in filter {qname}")))?;

        outcome.map_err(|e: BoxError| Abort::Fail(format!("filter {qname}: {e}")))
    }
}

/// `work`'s result, or `None` once the request deadline passes.
async fn within_deadline<F: Future>(ctx: &FilterContext, work: F) -> Option<F::Output> {
    match ctx.deadline {
        Some(deadline) => tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), work)
            .await
            .ok(),
        None => Some(work.await),
    }
}

/// Run `work`, turning aborts and panics into responses.
async fn guarded<F>(ctx: &FilterContext, url: &Url, work: F) -> FilterResponse
where
    F: Future<Output = Result<FilterResponse, Abort>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(Abort::Respond(response))) => response.into(),
        Ok(Err(Abort::Fail(message))) => {
            error!(request_id = %ctx.request_id, url = %url, error = %message, "Filter chain failed");
            internal_error(ctx, &message).into()
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(request_id = %ctx.request_id, url = %url, panic = %message, "Filter panicked");
            internal_error(ctx, "internal server error").into()
        }
    }
}

fn status_of(response: &FilterResponse) -> u16 {
    match response {
        FilterResponse::Response(r) => r.status.as_u16(),
        FilterResponse::Modification(_) => StatusCode::OK.as_u16(),
    }
}

fn internal_error(ctx: &FilterContext, message: &str) -> HttpResponse {
    HttpResponse::json_error(StatusCode::INTERNAL_SERVER_ERROR, message, &ctx.request_id)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
