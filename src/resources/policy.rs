//! Rules: URL patterns bound to ordered filter references.

use http::HeaderMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{QName, default_namespace};

/// Glob options for host and path patterns: `*` crosses `/`.
const GLOB_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

// ============================================================================
// Document shape
// ============================================================================

/// One policy resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyResource {
    /// Resource name
    pub name: String,
    /// Resource namespace; inherited by references that omit theirs
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Rules, in match order
    #[serde(default)]
    pub spec: PolicySpec,
}

/// Body of a policy resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Rules, in match order
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// A rule as written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Host glob
    #[serde(default = "star")]
    pub host: String,
    /// Path glob
    #[serde(default = "star")]
    pub path: String,
    /// Filters to run, in order
    #[serde(default)]
    pub filters: Option<Vec<FilterReferenceSpec>>,
}

fn star() -> String {
    "*".to_string()
}

/// A filter reference as written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterReferenceSpec {
    /// Filter name
    pub name: String,
    /// Filter namespace; empty inherits the policy's
    #[serde(default)]
    pub namespace: String,
    /// Per-reference arguments, interpreted by the filter kind
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Only run the filter when this matches
    #[serde(default)]
    pub if_request_header: HeaderSelectorSpec,
    /// What to do when the filter allows
    #[serde(default)]
    pub on_allow: Option<ChainAction>,
    /// What to do when the filter denies
    #[serde(default)]
    pub on_deny: Option<ChainAction>,
}

/// Header selector as written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSelectorSpec {
    /// Header name; empty matches every request
    #[serde(default)]
    pub name: String,
    /// Invert the result
    #[serde(default)]
    pub negate: bool,
    /// Exact value, case-insensitive
    #[serde(default)]
    pub value: String,
    /// Regex the whole value must match
    #[serde(default)]
    pub value_regex: String,
}

/// Chain control after a filter answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainAction {
    /// Stop and return this result
    Break,
    /// Keep evaluating the chain
    Continue,
}

// ============================================================================
// Compiled forms
// ============================================================================

/// Compiled header selector.
#[derive(Debug, Clone, Default)]
pub struct HeaderSelector {
    name: String,
    negate: bool,
    value: String,
    value_regex: Option<Regex>,
}

impl HeaderSelector {
    /// Compile a selector; `value` and `valueRegex` are mutually exclusive.
    pub fn compile(spec: &HeaderSelectorSpec) -> Result<Self, String> {
        if !spec.value.is_empty() && !spec.value_regex.is_empty() {
            return Err("ifRequestHeader: it is invalid to set both 'value' and 'valueRegex'".to_string());
        }
        let value_regex = if spec.value_regex.is_empty() {
            None
        } else {
            Some(
                Regex::new(&format!("^(?:{})$", spec.value_regex))
                    .map_err(|e| format!("ifRequestHeader.valueRegex: {e}"))?,
            )
        };
        Ok(Self {
            name: spec.name.clone(),
            negate: spec.negate,
            value: spec.value.clone(),
            value_regex,
        })
    }

    /// Whether the request headers select this filter.
    pub fn matches(&self, headers: &HeaderMap) -> bool {
        if self.name.is_empty() {
            return true;
        }
        let value = headers.get(&self.name).map(|v| v.to_str().unwrap_or_default());
        let found = match (value, &self.value_regex) {
            (None, _) => false,
            (Some(v), Some(re)) => re.is_match(v),
            (Some(_), None) if self.value.is_empty() => true,
            (Some(v), None) => v.eq_ignore_ascii_case(&self.value),
        };
        found != self.negate
    }
}

/// Compiled filter reference.
#[derive(Debug, Clone)]
pub struct FilterReference {
    /// Referenced filter
    pub qname: QName,
    /// Per-reference arguments
    pub arguments: serde_json::Value,
    /// Run only when this matches
    pub if_request_header: HeaderSelector,
    /// Default `continue`
    pub on_allow: ChainAction,
    /// Default `break`
    pub on_deny: ChainAction,
}

impl FilterReference {
    /// Compile a reference, inheriting `policy_namespace` when it has none.
    pub fn compile(spec: &FilterReferenceSpec, policy_namespace: &str) -> Result<Self, String> {
        let namespace = if spec.namespace.is_empty() {
            policy_namespace
        } else {
            spec.namespace.as_str()
        };
        let if_request_header = HeaderSelector::compile(&spec.if_request_header)
            .map_err(|e| format!("filter {:?}: {e}", spec.name))?;
        Ok(Self {
            qname: QName::new(&spec.name, namespace),
            arguments: spec.arguments.clone(),
            if_request_header,
            on_allow: spec.on_allow.unwrap_or(ChainAction::Continue),
            on_deny: spec.on_deny.unwrap_or(ChainAction::Break),
        })
    }

    /// Reference to `qname` with default selector and actions.
    pub fn to(qname: QName) -> Self {
        Self {
            qname,
            arguments: serde_json::Value::Null,
            if_request_header: HeaderSelector::default(),
            on_allow: ChainAction::Continue,
            on_deny: ChainAction::Break,
        }
    }
}

/// Compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Host glob source
    pub host: String,
    /// Path glob source
    pub path: String,
    host_glob: glob::Pattern,
    path_glob: glob::Pattern,
    /// Filters to run, in order
    pub filters: Vec<FilterReference>,
}

impl Rule {
    /// Build a rule from globs and already-compiled references.
    pub fn new(host: &str, path: &str, filters: Vec<FilterReference>) -> Result<Self, String> {
        let host_glob =
            glob::Pattern::new(host).map_err(|e| format!("host glob {host:?}: {e}"))?;
        let path_glob =
            glob::Pattern::new(path).map_err(|e| format!("path glob {path:?}: {e}"))?;
        Ok(Self {
            host: host.to_string(),
            path: path.to_string(),
            host_glob,
            path_glob,
            filters,
        })
    }

    /// Compile a rule from the document, in the policy's namespace.
    pub fn compile(spec: &RuleSpec, policy_namespace: &str) -> Result<Self, String> {
        let filters = spec
            .filters
            .iter()
            .flatten()
            .map(|r| FilterReference::compile(r, policy_namespace))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(&spec.host, &spec.path, filters)
    }

    /// The fallback used when nothing matches: no filters, so ALLOW.
    pub fn default_rule() -> Self {
        Self::fixed("*", "*")
    }

    /// The synthetic rule that answers `/callback` on any host.
    pub fn callback() -> Self {
        Self::fixed("*", crate::snapshot::CALLBACK_PATH)
    }

    fn fixed(host: &str, path: &str) -> Self {
        Self {
            host: host.to_string(),
            path: path.to_string(),
            host_glob: glob::Pattern::new(host).unwrap_or_default(),
            path_glob: glob::Pattern::new(&glob::Pattern::escape(path)).unwrap_or_default(),
            filters: Vec::new(),
        }
    }

    /// Both globs match.
    pub fn matches(&self, host: &str, path: &str) -> bool {
        self.host_glob.matches_with(host, GLOB_OPTIONS)
            && self.path_glob.matches_with(path, GLOB_OPTIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn selector(yaml: &str) -> Result<HeaderSelector, String> {
        HeaderSelector::compile(&serde_yaml::from_str(yaml).unwrap())
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn empty_selector_matches_everything() {
        let s = HeaderSelector::default();
        assert!(s.matches(&HeaderMap::new()));
    }

    #[test]
    fn presence_and_case_insensitive_value() {
        let present = selector("name: x-user").unwrap();
        assert!(present.matches(&headers(&[("x-user", "anything")])));
        assert!(!present.matches(&HeaderMap::new()));

        let exact = selector("{name: accept, value: Application/JSON}").unwrap();
        assert!(exact.matches(&headers(&[("accept", "application/json")])));
        assert!(!exact.matches(&headers(&[("accept", "text/html")])));
    }

    #[test]
    fn negate_inverts() {
        let s = selector("{name: x-internal, negate: true}").unwrap();
        assert!(s.matches(&HeaderMap::new()));
        assert!(!s.matches(&headers(&[("x-internal", "1")])));
    }

    #[test]
    fn value_regex_must_match_whole_value() {
        let s = selector("{name: user-agent, valueRegex: 'curl/.*'}").unwrap();
        assert!(s.matches(&headers(&[("user-agent", "curl/8.1")])));
        assert!(!s.matches(&headers(&[("user-agent", "not curl/8.1")])));
    }

    #[test]
    fn value_and_regex_are_exclusive() {
        assert!(selector("{name: a, value: b, valueRegex: c}").is_err());
    }

    #[test]
    fn reference_inherits_policy_namespace_and_defaults_actions() {
        let spec: FilterReferenceSpec = serde_yaml::from_str("name: auth").unwrap();
        let r = FilterReference::compile(&spec, "team").unwrap();
        assert_eq!(r.qname, QName::new("auth", "team"));
        assert_eq!(r.on_allow, ChainAction::Continue);
        assert_eq!(r.on_deny, ChainAction::Break);

        let spec: FilterReferenceSpec =
            serde_yaml::from_str("{name: auth, namespace: ops, onDeny: continue, onAllow: break}")
                .unwrap();
        let r = FilterReference::compile(&spec, "team").unwrap();
        assert_eq!(r.qname, QName::new("auth", "ops"));
        assert_eq!(r.on_allow, ChainAction::Break);
        assert_eq!(r.on_deny, ChainAction::Continue);
    }

    #[test]
    fn globs_match_host_and_path() {
        let rule = Rule::new("*.example.com", "/api/*", Vec::new()).unwrap();
        assert!(rule.matches("www.example.com", "/api/v1/users"));
        assert!(!rule.matches("example.org", "/api/v1"));
        assert!(!rule.matches("www.example.com", "/web"));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        assert!(Rule::new("*", "/[", Vec::new()).is_err());
    }

    #[test]
    fn callback_rule_matches_only_callback() {
        let rule = Rule::callback();
        assert!(rule.matches("any.host", "/callback"));
        assert!(!rule.matches("any.host", "/callback/x"));
        assert!(rule.filters.is_empty());
    }
}
