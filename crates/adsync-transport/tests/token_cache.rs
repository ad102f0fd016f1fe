use std::time::Duration as StdDuration;

use adsync_transport::{
    BackoffPolicy, ClientCredentials, HttpTransport, TokenCache, TransportError,
    DEFAULT_REFRESH_MARGIN_SECS,
};
use chrono::Duration;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn cache_for(server: &MockServer) -> TokenCache {
    let http = HttpTransport::with_client("fleet", reqwest::Client::new(), BackoffPolicy::none());
    TokenCache::new(
        ClientCredentials {
            client_id: "client-1".into(),
            client_secret: "s3cret".into(),
            token_url: format!("{}/token", server.uri()),
        },
        http,
        Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
    )
    .expect("token cache")
}

async fn mount_token(server: &MockServer, expires_in: i64, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=client-1"))
        .and(body_string_contains("client_secret=s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-abc",
            "token_type": "Bearer",
            "expires_in": expires_in
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn cached_token_is_reused_outside_the_safety_margin() {
    let server = MockServer::start().await;
    mount_token(&server, 3600, 1).await;

    let cache = cache_for(&server);
    let first = cache.valid_token().await.unwrap();
    let second = cache.valid_token().await.unwrap();

    assert_eq!(first.access_token, "tok-abc");
    assert_eq!(first, second);
}

#[tokio::test]
async fn token_inside_the_safety_margin_is_refreshed() {
    let server = MockServer::start().await;
    // Expires in one minute, well inside the five minute margin.
    mount_token(&server, 60, 2).await;

    let cache = cache_for(&server);
    cache.valid_token().await.unwrap();
    cache.valid_token().await.unwrap();
}

#[tokio::test]
async fn invalidate_forces_a_new_exchange() {
    let server = MockServer::start().await;
    mount_token(&server, 3600, 2).await;

    let cache = cache_for(&server);
    cache.valid_token().await.unwrap();
    cache.invalidate().await;
    cache.valid_token().await.unwrap();
}

#[tokio::test]
async fn concurrent_callers_share_a_single_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "tok-shared", "expires_in": 3600 }))
                .set_delay(StdDuration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache_for(&server);
    let (a, b, c) = tokio::join!(cache.valid_token(), cache.valid_token(), cache.valid_token());

    assert_eq!(a.unwrap().access_token, "tok-shared");
    assert_eq!(b.unwrap().access_token, "tok-shared");
    assert_eq!(c.unwrap().access_token, "tok-shared");
}

#[tokio::test]
async fn rejected_exchange_is_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
        .mount(&server)
        .await;

    let cache = cache_for(&server);
    let err = cache.valid_token().await.unwrap_err();
    match err {
        TransportError::Authentication(message) => {
            assert!(message.contains("401"));
            assert!(message.contains("invalid_client"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn malformed_token_body_is_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let cache = cache_for(&server);
    assert!(matches!(
        cache.valid_token().await,
        Err(TransportError::Authentication(_))
    ));
}

#[test]
fn empty_credentials_fail_fast() {
    let http = HttpTransport::with_client("hr", reqwest::Client::new(), BackoffPolicy::none());
    let err = TokenCache::new(
        ClientCredentials {
            client_id: "id".into(),
            client_secret: "  ".into(),
            token_url: "http://localhost/token".into(),
        },
        http,
        Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
    )
    .unwrap_err();
    assert!(matches!(err, TransportError::Configuration(ref m) if m.contains("hr client secret")));
}

#[tokio::test]
async fn idempotent_requests_retry_retryable_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let http = HttpTransport::with_client(
        "hr",
        reqwest::Client::new(),
        BackoffPolicy {
            max_retries: 2,
            base_delay: StdDuration::from_millis(1),
            max_delay: StdDuration::from_millis(5),
        },
    );
    let url = format!("{}/flaky", server.uri());
    let resp = http
        .send_idempotent(|| http.client().get(&url))
        .await
        .unwrap();
    assert!(resp.status.is_success());
    assert_eq!(resp.body_text(), "ok");
}

async fn mount_token_once(server: &MockServer, token: &str, expires_in: i64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token,
            "expires_in": expires_in
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn failed_refresh_keeps_a_still_valid_token() {
    let server = MockServer::start().await;
    // Valid for two minutes but inside the margin, so every call refreshes.
    mount_token_once(&server, "tok-1", 120).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_token_once(&server, "tok-2", 3600).await;

    let cache = cache_for(&server);
    assert_eq!(cache.valid_token().await.unwrap().access_token, "tok-1");

    let err = cache.valid_token().await.unwrap_err();
    assert!(matches!(err, TransportError::Authentication(_)));
    assert_eq!(cache.cached().await.map(|t| t.access_token).as_deref(), Some("tok-1"));

    assert_eq!(cache.valid_token().await.unwrap().access_token, "tok-2");
}

#[tokio::test]
async fn failed_refresh_clears_an_expired_token() {
    let server = MockServer::start().await;
    mount_token_once(&server, "tok-1", 0).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let cache = cache_for(&server);
    assert_eq!(cache.valid_token().await.unwrap().access_token, "tok-1");

    assert!(cache.valid_token().await.is_err());
    assert!(cache.cached().await.is_none());
    assert!(cache.valid_token().await.is_err());
}

#[tokio::test]
async fn oversized_lifetime_is_capped_instead_of_overflowing() {
    let server = MockServer::start().await;
    mount_token(&server, i64::MAX, 1).await;

    let cache = cache_for(&server);
    let token = cache.valid_token().await.unwrap();
    let ceiling = chrono::Utc::now() + Duration::seconds(adsync_transport::MAX_TOKEN_LIFETIME_SECS);
    assert!(token.expires_at <= ceiling);
    assert_eq!(cache.valid_token().await.unwrap(), token);
}
