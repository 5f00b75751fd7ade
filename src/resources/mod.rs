//! Policy document types
//!
//! These types map directly to the YAML policy document: a list of filter
//! resources and a list of policies binding URL patterns to filters.
//! Each raw filter spec has a `validate()` that produces the typed spec the
//! filters run against; a validation failure is kept on the filter rather
//! than rejecting the whole document.

pub mod external;
pub mod jwt;
pub mod oauth2;
pub mod policy;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use external::{ExternalSpec, ExternalSpecRaw, Proto};
pub use jwt::{JwtSpec, JwtSpecRaw};
pub use oauth2::{AccessTokenValidation, OAuth2Spec, OAuth2SpecRaw};
pub use policy::{ChainAction, FilterReference, HeaderSelector, PolicyResource, Rule};

use crate::{Error, Result};

/// Namespace assumed when a resource or reference names none.
pub const DEFAULT_NAMESPACE: &str = "default";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

// ============================================================================
// Qualified names
// ============================================================================

/// `name.namespace`; how rules and the logout endpoint address filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QName {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
}

impl QName {
    /// Build a qualified name.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

impl FromStr for QName {
    type Err = Error;

    /// Namespaces never contain dots, so the last one separates.
    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once('.') {
            Some((name, namespace)) if !name.is_empty() && !namespace.is_empty() => {
                Ok(Self::new(name, namespace))
            }
            _ => Err(Error::Config(format!(
                "{s:?} is not a qualified name (name.namespace)"
            ))),
        }
    }
}

// ============================================================================
// TLS renegotiation
// ============================================================================

/// Accepted values of `renegotiateTLS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RenegotiateTls {
    /// `""` or `never`
    #[default]
    Never,
    /// `onceAsClient`
    OnceAsClient,
    /// `freelyAsClient`
    FreelyAsClient,
}

impl FromStr for RenegotiateTls {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "" | "never" => Ok(Self::Never),
            "onceAsClient" => Ok(Self::OnceAsClient),
            "freelyAsClient" => Ok(Self::FreelyAsClient),
            other => Err(format!("invalid renegotiateTLS: {other:?}")),
        }
    }
}

/// Parse a Go-style duration (`5m`, `1h30m`); empty means zero.
pub(crate) fn parse_duration(field: &str, raw: &str) -> std::result::Result<std::time::Duration, String> {
    if raw.is_empty() {
        return Ok(std::time::Duration::ZERO);
    }
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| format!("parsing {field}: {raw:?}: {e}"))
}

// ============================================================================
// Filter resources
// ============================================================================

/// One filter resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResource {
    /// Resource name
    pub name: String,
    /// Resource namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Filter definition; exactly one kind must be set
    #[serde(default)]
    pub spec: FilterResourceSpec,
}

impl FilterResource {
    /// Qualified name of this resource.
    pub fn qname(&self) -> QName {
        QName::new(&self.name, &self.namespace)
    }
}

/// One-of filter kinds, as written in the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterResourceSpec {
    /// OAuth2 client
    #[serde(default, alias = "OAuth2")]
    pub oauth2: Option<OAuth2SpecRaw>,
    /// JWT validator
    #[serde(default, alias = "JWT")]
    pub jwt: Option<JwtSpecRaw>,
    /// Delegated authorizer
    #[serde(default, alias = "External")]
    pub external: Option<ExternalSpecRaw>,
    /// Compiled-in plugin
    #[serde(default, alias = "Plugin")]
    pub plugin: Option<PluginSpec>,
    /// Pass-through
    #[serde(default, alias = "Internal")]
    pub internal: Option<InternalSpec>,
}

impl FilterResourceSpec {
    /// Names of the kinds that are set.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        if self.oauth2.is_some() {
            kinds.push("oauth2");
        }
        if self.jwt.is_some() {
            kinds.push("jwt");
        }
        if self.external.is_some() {
            kinds.push("external");
        }
        if self.plugin.is_some() {
            kinds.push("plugin");
        }
        if self.internal.is_some() {
            kinds.push("internal");
        }
        kinds
    }
}

/// Plugin filter: names a [`filter_api::Filter`] registered at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Registry name
    pub name: String,
}

/// Pass-through filter; has no settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InternalSpec {}

// ============================================================================
// Document
// ============================================================================

/// The whole policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Filter resources
    #[serde(default)]
    pub filters: Vec<FilterResource>,
    /// Filter policies
    #[serde(default)]
    pub policies: Vec<PolicyResource>,
}

impl PolicyDocument {
    /// Parse a YAML document; an empty document has no filters or policies.
    pub fn from_yaml(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(source)?)
    }

    /// Read and parse the document at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let source = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&source)
    }
}
