//! Shared fixtures: a mock OpenID provider and a sidecar built from a
//! policy string.

#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use authz_sidecar::filters::{FilterDeps, PluginRegistry};
use authz_sidecar::httpclient::{HttpCache, HttpClientFactory};
use authz_sidecar::keypair::Keypair;
use authz_sidecar::resources::PolicyDocument;
use authz_sidecar::snapshot::{SnapshotStore, build_snapshot};
use authz_sidecar::{FilterMux, filter_api};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use filter_api::{FilterContext, FilterRequest, FilterResponse, HttpResponse};
use http::{HeaderValue, Method};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const KID: &str = "idp-key-1";

fn idp_key() -> &'static rsa::RsaPrivateKey {
    static KEY: OnceLock<rsa::RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| rsa::RsaPrivateKey::new(&mut rand_core::OsRng, 2048).unwrap())
}

/// Sidecar session keypair, generated once per test binary.
pub fn session_keypair() -> Arc<Keypair> {
    static KEYPAIR: OnceLock<Arc<Keypair>> = OnceLock::new();
    KEYPAIR
        .get_or_init(|| Arc::new(Keypair::generate(2048).unwrap()))
        .clone()
}

/// A mock OpenID provider with discovery, JWKS and a token endpoint.
pub struct Idp {
    pub server: MockServer,
    signer: EncodingKey,
}

impl Idp {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let key = idp_key();
        let uri = server.uri();

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": uri,
                "authorization_endpoint": format!("{uri}/authorize"),
                "token_endpoint": format!("{uri}/token"),
                "jwks_uri": format!("{uri}/jwks"),
                "end_session_endpoint": format!("{uri}/logout"),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": [{
                "kid": KID,
                "kty": "RSA",
                "n": URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
                "e": URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
            }]})))
            .mount(&server)
            .await;

        let signer =
            EncodingKey::from_rsa_pem(key.to_pkcs1_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
        Self { server, signer }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// RS256 token signed by the provider, with `extra` merged over
    /// `{iss, aud: "api", iat, exp: +1h}`.
    pub fn token(&self, extra: Value) -> String {
        let now = jsonwebtoken::get_current_timestamp();
        let mut claims = json!({
            "iss": self.uri(),
            "aud": "api",
            "sub": "alice",
            "iat": now,
            "exp": now + 3600,
        });
        if let (Some(base), Some(extra)) = (claims.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(KID.to_string());
        encode(&header, &claims, &self.signer).unwrap()
    }

    /// Token endpoint answering every exchange with `access_token`.
    pub async fn grant(&self, access_token: &str, expires_in: u64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": access_token,
                "token_type": "Bearer",
                "expires_in": expires_in,
            })))
            .mount(&self.server)
            .await;
    }
}

/// Evaluator over `policy`, with fresh cache and the shared session key.
pub fn sidecar(policy: &str) -> FilterMux {
    sidecar_with_plugins(policy, &PluginRegistry::new())
}

pub fn sidecar_with_plugins(policy: &str, plugins: &PluginRegistry) -> FilterMux {
    let doc = PolicyDocument::from_yaml(policy).unwrap();
    let snapshot = build_snapshot(&doc, plugins);
    let cache = Arc::new(HttpCache::new(1 << 20));
    let deps = FilterDeps {
        http: Arc::new(HttpClientFactory::new(cache, Duration::from_secs(5)).unwrap()),
        keypair: session_keypair(),
    };
    FilterMux::new(Arc::new(SnapshotStore::new(snapshot)), deps)
}

pub fn get(url: &str) -> FilterRequest {
    let mut request = FilterRequest::new(Method::GET, &Url::parse(url).unwrap());
    request.id = "test-request".to_string();
    request
}

pub fn with_header(mut request: FilterRequest, name: &'static str, value: &str) -> FilterRequest {
    request
        .headers
        .append(name, HeaderValue::from_str(value).unwrap());
    request
}

pub fn ctx() -> FilterContext {
    FilterContext {
        request_id: "test-request".to_string(),
        deadline: None,
    }
}

pub fn denied(response: FilterResponse) -> HttpResponse {
    match response {
        FilterResponse::Response(r) => r,
        FilterResponse::Modification(m) => panic!("expected a response, got allow {m:?}"),
    }
}

pub fn location(response: &HttpResponse) -> Url {
    Url::parse(response.headers[http::header::LOCATION].to_str().unwrap()).unwrap()
}
