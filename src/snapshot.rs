//! Configuration snapshot and rule matching.
//!
//! A [`Snapshot`] is built once from a [`PolicyDocument`] and never mutated;
//! reloads publish a new one through [`SnapshotStore`], so a request sees
//! either the old filter set or the new one, never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use filter_api::Filter;
use tracing::{error, info, warn};
use url::Url;

use crate::filters::oauth2::state;
use crate::filters::plugin::PluginRegistry;
use crate::resources::{
    ExternalSpec, FilterResource, JwtSpec, OAuth2Spec, PolicyDocument, QName, RenegotiateTls,
    Rule,
};

/// OAuth2 redirection endpoint, on every host.
pub const CALLBACK_PATH: &str = "/callback";

/// Served by the auth endpoint itself; never matched against rules.
pub const LOGOUT_PATH: &str = "/.ambassador/oauth2/logout";

// ============================================================================
// Filters
// ============================================================================

/// A validated filter, ready to dispatch.
#[derive(Clone)]
pub enum FilterSpec {
    /// OAuth2 client
    OAuth2(Arc<OAuth2Spec>),
    /// JWT validator
    Jwt(Arc<JwtSpec>),
    /// Delegated authorizer
    External(Arc<ExternalSpec>),
    /// Registered plugin
    Plugin(Arc<dyn Filter>),
    /// Pass-through
    Internal,
}

impl std::fmt::Debug for FilterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OAuth2(s) => f.debug_tuple("OAuth2").field(s).finish(),
            Self::Jwt(s) => f.debug_tuple("Jwt").field(s).finish(),
            Self::External(s) => f.debug_tuple("External").field(s).finish(),
            Self::Plugin(_) => f.write_str("Plugin"),
            Self::Internal => f.write_str("Internal"),
        }
    }
}

/// A filter as the evaluator sees it.
#[derive(Debug, Clone)]
pub struct FilterInfo {
    /// One-line summary
    pub description: String,
    /// The filter, or why it could not be built
    pub spec: Result<FilterSpec, String>,
}

impl FilterInfo {
    /// Validate a filter resource.
    pub fn from_resource(resource: &FilterResource, plugins: &PluginRegistry) -> Self {
        let spec = &resource.spec;
        let kinds = spec.kinds();
        if kinds.len() != 1 {
            let err = if kinds.is_empty() {
                "no filter kind set; expected exactly one of oauth2, jwt, external, plugin, internal".to_string()
            } else {
                format!("multiple filter kinds set: {}", kinds.join(", "))
            };
            return Self::invalid(err);
        }

        let built = if let Some(raw) = &spec.oauth2 {
            raw.validate()
                .map(|s| (s.description(), FilterSpec::OAuth2(Arc::new(s))))
        } else if let Some(raw) = &spec.jwt {
            raw.validate()
                .map(|s| (s.description(), FilterSpec::Jwt(Arc::new(s))))
        } else if let Some(raw) = &spec.external {
            raw.validate()
                .map(|s| (s.description(), FilterSpec::External(Arc::new(s))))
        } else if let Some(raw) = &spec.plugin {
            plugins
                .get(&raw.name)
                .map(|p| (format!("plugin={}", raw.name), FilterSpec::Plugin(p)))
                .ok_or_else(|| format!("no plugin registered under {:?}", raw.name))
        } else {
            Ok(("internal".to_string(), FilterSpec::Internal))
        };

        match built {
            Ok((description, spec)) => Self {
                description,
                spec: Ok(spec),
            },
            Err(err) => Self::invalid(err),
        }
    }

    fn invalid(err: String) -> Self {
        Self {
            description: format!("error: {err}"),
            spec: Err(err),
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Immutable filters and rules.
#[derive(Debug)]
pub struct Snapshot {
    /// Filters by qualified name
    pub filters: HashMap<QName, FilterInfo>,
    /// Rules in match order; the callback rule first
    pub rules: Vec<Rule>,
    default_rule: Rule,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new(HashMap::new(), Vec::new())
    }
}

/// `host[:port]` as the gateway reports it.
fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

impl Snapshot {
    /// Assemble a snapshot; the callback rule is prepended to `rules`.
    pub fn new(filters: HashMap<QName, FilterInfo>, rules: Vec<Rule>) -> Self {
        let mut all = Vec::with_capacity(rules.len() + 1);
        all.push(Rule::callback());
        all.extend(rules);
        Self {
            filters,
            rules: all,
            default_rule: Rule::default_rule(),
        }
    }

    /// Rule governing `url`.
    ///
    /// On the callback path the rule is chosen by the `redirect_url` carried
    /// in the (unverified) `state`; the filter verifies it later.
    pub fn find_rule(&self, url: &Url) -> &Rule {
        let path = url.path();
        if path == LOGOUT_PATH {
            return &self.default_rule;
        }
        if path == CALLBACK_PATH {
            let redirect = url
                .query_pairs()
                .find(|(k, _)| k == "state")
                .and_then(|(_, v)| state::peek_redirect_url(&v));
            if let Some(redirect) = redirect {
                return self.match_rule(&authority(&redirect), redirect.path());
            }
        }
        self.match_rule(&authority(url), path)
    }

    fn match_rule(&self, host: &str, path: &str) -> &Rule {
        self.rules
            .iter()
            .find(|r| r.matches(host, path))
            .unwrap_or(&self.default_rule)
    }

    /// The empty rule used when nothing matches.
    pub fn default_rule(&self) -> &Rule {
        &self.default_rule
    }
}

/// rustls never renegotiates; the setting is accepted and ignored.
fn warn_unsupported(qname: &QName, spec: &FilterSpec) {
    let renegotiate = match spec {
        FilterSpec::OAuth2(s) => s.renegotiate_tls,
        FilterSpec::Jwt(s) => s.renegotiate_tls,
        _ => return,
    };
    if renegotiate != RenegotiateTls::Never {
        warn!(filter = %qname, setting = ?renegotiate, "renegotiateTLS is not supported and has no effect");
    }
}

/// Validate every filter and compile every rule of `doc`.
///
/// Misconfigured filters stay in the snapshot with their error; rules with
/// an invalid glob or selector are dropped.
pub fn build_snapshot(doc: &PolicyDocument, plugins: &PluginRegistry) -> Snapshot {
    let mut filters = HashMap::with_capacity(doc.filters.len());
    for resource in &doc.filters {
        let qname = resource.qname();
        if filters.contains_key(&qname) {
            warn!(filter = %qname, "Duplicate filter definition ignored");
            continue;
        }
        let info = FilterInfo::from_resource(resource, plugins);
        match &info.spec {
            Ok(spec) => {
                info!(filter = %qname, "{}", info.description);
                warn_unsupported(&qname, spec);
            }
            Err(e) => error!(filter = %qname, error = %e, "Filter misconfigured"),
        }
        filters.insert(qname, info);
    }
    if filters.is_empty() {
        info!("0 filters configured");
    }

    let mut rules = Vec::new();
    for policy in &doc.policies {
        for (i, spec) in policy.spec.rules.iter().enumerate() {
            match Rule::compile(spec, &policy.namespace) {
                Ok(rule) => rules.push(rule),
                Err(e) => error!(
                    policy = %QName::new(&policy.name, &policy.namespace),
                    rule = i,
                    error = %e,
                    "Rule dropped"
                ),
            }
        }
    }

    Snapshot::new(filters, rules)
}

// ============================================================================
// Store
// ============================================================================

/// The current snapshot; lock-free to read, replaced whole.
pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
}

impl SnapshotStore {
    /// Store seeded with `snapshot`.
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
        }
    }

    /// The snapshot to evaluate a request against.
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Publish a new snapshot.
    pub fn store(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(Snapshot::default())
    }
}
