//! End-to-end OAuth2 and JWT scenarios against a mock IdP
//!
//! - no token redirects to the IdP
//! - a valid cookie is forwarded as a bearer token
//! - the callback exchanges the code and sets the cookie
//! - a callback without a code, or with a bad state, is refused
//! - a JWT filter injects claims as headers
//! - a JWT / OAuth2 chain split by `ifRequestHeader`
//! - logout expires the cookie

mod common;

use std::time::Duration;

use authz_sidecar::filter_api::FilterResponse;
use authz_sidecar::filters::oauth2::state::{check_state, sign_state};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::{Idp, ctx, denied, get, location, session_keypair, sidecar, with_header};
use http::{StatusCode, header};
use pretty_assertions::assert_eq;
use url::Url;

fn oauth2_policy(idp: &Idp) -> String {
    format!(
        r#"
filters:
  - name: login
    namespace: web
    spec:
      oauth2:
        authorizationURL: {idp}
        clientURL: https://app.example
        clientID: sidecar
        secret: s3cret
        audience: api
        stateTTL: 5m
policies:
  - name: app
    namespace: web
    spec:
      rules:
        - host: app.example
          path: /secure/*
          filters:
            - name: login
              arguments:
                scopes: [openid, profile]
"#,
        idp = idp.uri()
    )
}

fn query(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

#[tokio::test]
async fn no_token_redirects_to_authorization_endpoint() {
    // GIVEN an OAuth2-protected path and a request with no token
    let idp = Idp::start().await;
    let mux = sidecar(&oauth2_policy(&idp));

    // WHEN it is evaluated
    let response = denied(mux.evaluate(&ctx(), get("https://app.example/secure/page?tab=2")).await);

    // THEN the user agent is sent to the IdP with a state pointing back
    assert_eq!(response.status, StatusCode::SEE_OTHER);
    let to = location(&response);
    assert_eq!(to.path(), "/authorize");
    assert_eq!(query(&to, "response_type").as_deref(), Some("code"));
    assert_eq!(query(&to, "client_id").as_deref(), Some("sidecar"));
    assert_eq!(query(&to, "audience").as_deref(), Some("api"));
    assert_eq!(query(&to, "scope").as_deref(), Some("openid profile"));
    assert_eq!(
        query(&to, "redirect_uri").as_deref(),
        Some("https://app.example/callback")
    );

    let state = query(&to, "state").unwrap();
    let redirect_url = check_state(&state, &session_keypair()).unwrap();
    assert_eq!(redirect_url.as_str(), "https://app.example/secure/page?tab=2");
}

#[tokio::test]
async fn valid_cookie_is_forwarded_as_bearer() {
    let idp = Idp::start().await;
    let mux = sidecar(&oauth2_policy(&idp));
    let token = idp.token(serde_json::json!({"scope": "openid"}));

    let request = with_header(
        get("https://app.example/secure/page"),
        "cookie",
        &format!("theme=dark; access_token={token}"),
    );
    let FilterResponse::Modification(m) = mux.evaluate(&ctx(), request).await else {
        panic!("expected allow");
    };

    assert_eq!(m.headers.len(), 1);
    assert_eq!(m.headers[0].name(), header::AUTHORIZATION);
    assert_eq!(m.headers[0].value().to_str().unwrap(), format!("Bearer {token}"));
    assert!(!m.headers[0].is_append());
}

#[tokio::test]
async fn token_with_foreign_scope_is_not_accepted() {
    let idp = Idp::start().await;
    let mux = sidecar(&oauth2_policy(&idp));
    let token = idp.token(serde_json::json!({"scope": "openid admin"}));

    let request = with_header(
        get("https://app.example/secure/page"),
        "authorization",
        &format!("Bearer {token}"),
    );
    let response = denied(mux.evaluate(&ctx(), request).await);
    assert_eq!(response.status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn callback_exchanges_code_and_sets_cookie() {
    // GIVEN a state minted for a protected page and an IdP that grants a token
    let idp = Idp::start().await;
    idp.grant("T", 120).await;
    let mux = sidecar(&oauth2_policy(&idp));
    let original = Url::parse("https://app.example/secure/page").unwrap();
    let state = sign_state(&session_keypair(), &original, Duration::from_secs(300)).unwrap();

    // WHEN the IdP sends the user agent back with a code
    let callback = format!("https://app.example/callback?code=abc&state={state}");
    let before = time::OffsetDateTime::now_utc();
    let response = denied(mux.evaluate(&ctx(), get(&callback)).await);
    let after = time::OffsetDateTime::now_utc();

    // THEN the original URL is replayed with the token in a cookie that
    // expires with the token
    assert_eq!(response.status, StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&response), original);
    let raw = response.headers[header::SET_COOKIE].to_str().unwrap();
    let cookie = cookie::Cookie::parse(raw).unwrap();
    assert_eq!(cookie.name(), "access_token");
    assert_eq!(cookie.value(), "T");
    assert_eq!(cookie.http_only(), Some(true));
    assert_eq!(cookie.secure(), Some(true));
    let expires = cookie.expires_datetime().expect("cookie has an expiry");
    let lifetime = time::Duration::seconds(120);
    assert!(expires <= after + lifetime, "{expires} is past the token's lifetime");
    assert!(expires >= before + lifetime - time::Duration::seconds(2), "{expires} is too early");

    let requests = idp.server.received_requests().await.unwrap();
    let exchange = requests.iter().find(|r| r.url.path() == "/token").unwrap();
    let form: Vec<(String, String)> = url::form_urlencoded::parse(&exchange.body)
        .into_owned()
        .collect();
    assert!(form.contains(&("grant_type".to_string(), "authorization_code".to_string())));
    assert!(form.contains(&("code".to_string(), "abc".to_string())));
    assert!(form.contains(&("client_secret".to_string(), "s3cret".to_string())));
}

#[tokio::test]
async fn callback_without_code_is_unauthorized() {
    let idp = Idp::start().await;
    let mux = sidecar(&oauth2_policy(&idp));
    let original = Url::parse("https://app.example/secure/page").unwrap();
    let state = sign_state(&session_keypair(), &original, Duration::from_secs(300)).unwrap();

    let response = denied(
        mux.evaluate(&ctx(), get(&format!("https://app.example/callback?state={state}")))
            .await,
    );
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn callback_with_tampered_state_header_is_bad_request() {
    // GIVEN a state whose payload still names a protected page but whose
    // header is not JSON
    let idp = Idp::start().await;
    let mux = sidecar(&oauth2_policy(&idp));
    let payload = URL_SAFE_NO_PAD
        .encode(r#"{"redirect_url":"https://app.example/secure/page","exp":9999999999}"#);
    let state = format!("{}.{payload}.c2ln", URL_SAFE_NO_PAD.encode("not-json"));

    // WHEN it comes back on the callback
    let response = denied(
        mux.evaluate(&ctx(), get(&format!("https://app.example/callback?code=abc&state={state}")))
            .await,
    );

    // THEN it is rejected as malformed, without a code exchange
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let requests = idp.server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() != "/token"));
}

#[tokio::test]
async fn callback_with_forged_state_is_unauthorized() {
    let idp = Idp::start().await;
    let mux = sidecar(&oauth2_policy(&idp));
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD
        .encode(r#"{"redirect_url":"https://app.example/secure/page","exp":9999999999}"#);
    let state = format!("{header}.{payload}.c2ln");

    let response = denied(
        mux.evaluate(&ctx(), get(&format!("https://app.example/callback?code=abc&state={state}")))
            .await,
    );
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn jwt_filter_injects_subject_header() {
    let idp = Idp::start().await;
    let policy = format!(
        r#"
filters:
  - name: bearer
    spec:
      jwt:
        validAlgorithms: [RS256]
        jwksURI: {idp}/jwks
        audience: api
        requireExpiresAt: true
        injectRequestHeaders:
          - name: X-Sub
            value: "{{{{ .token.Claims.sub }}}}"
policies:
  - name: api
    spec:
      rules:
        - host: "*"
          path: /api/*
          filters: [{{name: bearer}}]
"#,
        idp = idp.uri()
    );
    let mux = sidecar(&policy);

    let token = idp.token(serde_json::json!({"sub": "bob"}));
    let request = with_header(get("https://api.example/api/orders"), "authorization", &format!("Bearer {token}"));
    let FilterResponse::Modification(m) = mux.evaluate(&ctx(), request).await else {
        panic!("expected allow");
    };
    assert_eq!(m.headers[0].name(), "x-sub");
    assert_eq!(m.headers[0].value(), "bob");

    let response = denied(mux.evaluate(&ctx(), get("https://api.example/api/orders")).await);
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers[header::WWW_AUTHENTICATE],
        r#"Bearer realm="bearer.default""#
    );
}

#[tokio::test]
async fn jwt_then_oauth2_chain_split_by_header() {
    // GIVEN API clients (with Authorization) stop at JWT through onAllow:
    // break, and the OAuth2 filter after it has no gate of its own
    let idp = Idp::start().await;
    let policy = format!(
        r#"
filters:
  - name: bearer
    spec:
      jwt:
        validAlgorithms: [RS256]
        jwksURI: {idp}/jwks
  - name: login
    spec:
      oauth2:
        authorizationURL: {idp}
        clientURL: https://app.example
        clientID: sidecar
        secret: s3cret
policies:
  - name: app
    spec:
      rules:
        - host: app.example
          path: "*"
          filters:
            - name: bearer
              ifRequestHeader: {{name: Authorization}}
              onAllow: break
            - name: login
"#,
        idp = idp.uri()
    );
    let mux = sidecar(&policy);

    // WHEN an API client presents a token, THEN only JWT runs and allows
    let token = idp.token(serde_json::json!({}));
    let api = with_header(get("https://app.example/data"), "authorization", &format!("Bearer {token}"));
    let FilterResponse::Modification(m) = mux.evaluate(&ctx(), api).await else {
        panic!("expected allow");
    };
    assert!(m.headers.iter().all(|h| h.name() != header::AUTHORIZATION));
    let paths: Vec<String> = idp
        .server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert!(paths.iter().all(|p| p == "/jwks"), "{paths:?}");

    // WHEN an API client presents a bad token, THEN JWT denies, no redirect
    let bad = with_header(get("https://app.example/data"), "authorization", "Bearer not.a.jwt");
    assert_eq!(denied(mux.evaluate(&ctx(), bad).await).status, StatusCode::UNAUTHORIZED);

    // WHEN a browser arrives without a token, THEN it is redirected
    let browser = denied(mux.evaluate(&ctx(), get("https://app.example/data")).await);
    assert_eq!(browser.status, StatusCode::SEE_OTHER);
    assert_eq!(location(&browser).path(), "/authorize");
    let requests = idp.server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() != "/token"));
}

#[tokio::test]
async fn instead_of_redirect_answers_with_status() {
    let idp = Idp::start().await;
    let policy = oauth2_policy(&idp).replace(
        "scopes: [openid, profile]",
        "scopes: [openid]\n                insteadOfRedirect:\n                  ifRequestHeader: {name: X-Requested-With, value: XMLHttpRequest}\n                  httpStatusCode: 401",
    );
    let mux = sidecar(&policy);

    let xhr = with_header(get("https://app.example/secure/x"), "x-requested-with", "xmlhttprequest");
    let response = denied(mux.evaluate(&ctx(), xhr).await);
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    let page = denied(mux.evaluate(&ctx(), get("https://app.example/secure/x")).await);
    assert_eq!(page.status, StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn discovery_failure_is_unauthorized() {
    let idp = Idp::start().await;
    let policy = oauth2_policy(&idp).replace(&idp.uri(), "http://127.0.0.1:9");
    let mux = sidecar(&policy);

    let response = denied(mux.evaluate(&ctx(), get("https://app.example/secure/page")).await);
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_expires_cookie_and_ends_session() {
    let idp = Idp::start().await;
    let mux = sidecar(&oauth2_policy(&idp));

    let response = denied(
        mux.evaluate(
            &ctx(),
            get("https://app.example/.ambassador/oauth2/logout?realm=login.web"),
        )
        .await,
    );
    assert_eq!(response.status, StatusCode::SEE_OTHER);
    let to = location(&response);
    assert_eq!(to.path(), "/logout");
    assert_eq!(
        query(&to, "post_logout_redirect_uri").as_deref(),
        Some("https://app.example/")
    );
    let cookie = response.headers[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("access_token="));
    assert!(cookie.contains("Max-Age=0"));

    let unknown = denied(
        mux.evaluate(
            &ctx(),
            get("https://app.example/.ambassador/oauth2/logout?realm=nope.web"),
        )
        .await,
    );
    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
}
