use adsync_adapters::{AdapterError, AdapterOptions, DriverSource, ErrorKind, HrConfig, HrSource};
use adsync_transport::{BackoffPolicy, HttpTransport};
use serde_json::{json, Value};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn options(page_size: usize) -> AdapterOptions {
    AdapterOptions {
        page_size,
        backoff: BackoffPolicy::none(),
        ..AdapterOptions::default()
    }
}

fn source(server: &MockServer, page_size: usize) -> HrSource {
    let http = HttpTransport::with_client("hr", reqwest::Client::new(), BackoffPolicy::none());
    HrSource::new(&server.uri(), "hr-client", "hr-secret", http, &options(page_size)).expect("hr source")
}

fn worker(payroll: &str, status: &str) -> Value {
    json!({
        "workerID": { "idValue": format!("W{payroll}") },
        "person": {
            "legalName": { "givenName": "Pat", "familyName1": "Driver" },
            "legalAddress": {
                "lineOne": "1 Main St",
                "cityName": "Cincinnati",
                "countrySubdivisionLevel1": { "codeValue": "OH" },
                "postalCode": "45202-1234"
            }
        },
        "workAssignments": [{
            "payrollFileNumber": payroll,
            "primaryIndicator": true,
            "assignmentStatus": { "statusCode": { "codeValue": status } }
        }]
    })
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/oauth/v2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "hr-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_page(server: &MockServer, skip: &str, workers: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/hr/v2/workers"))
        .and(query_param("$top", "2"))
        .and(query_param("$skip", skip))
        .and(header("Authorization", "Bearer hr-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "workers": workers })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn pages_until_a_short_page_and_filters_workers() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_page(&server, "0", vec![worker("0001", "A"), worker("0002", "T")]).await;
    mount_page(&server, "2", vec![worker("0003", "a")]).await;

    let population = source(&server, 2).fetch_eligible_drivers().await.unwrap();

    let keys = population
        .drivers
        .iter()
        .map(|d| d.employee_number.as_str())
        .collect::<Vec<_>>();
    assert_eq!(keys, vec!["0001", "0003"]);
    assert_eq!(population.stats.total_workers, 3);
    assert_eq!(population.stats.inactive, 1);
    assert_eq!(population.stats.eligible, 2);
}

#[tokio::test]
async fn empty_page_ends_pagination() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_page(&server, "0", vec![worker("0001", "A"), worker("0002", "A")]).await;
    mount_page(&server, "2", vec![]).await;

    let workers = source(&server, 2).fetch_workers().await.unwrap();
    assert_eq!(workers.len(), 2);
}

#[tokio::test]
async fn no_content_page_ends_pagination() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_page(&server, "0", vec![worker("0001", "A"), worker("0002", "A")]).await;
    Mock::given(method("GET"))
        .and(path("/hr/v2/workers"))
        .and(query_param("$skip", "2"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let workers = source(&server, 2).fetch_workers().await.unwrap();
    assert_eq!(workers.len(), 2);
}

#[tokio::test]
async fn failing_page_fails_the_whole_fetch() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_page(&server, "0", vec![worker("0001", "A"), worker("0002", "A")]).await;
    Mock::given(method("GET"))
        .and(path("/hr/v2/workers"))
        .and(query_param("$skip", "2"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let err = source(&server, 2).fetch_eligible_drivers().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.to_string().contains("upstream exploded"));
}

#[tokio::test]
async fn token_failure_is_an_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/oauth/v2/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = source(&server, 2).fetch_workers().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
}

#[test]
fn unreadable_certificate_fails_construction() {
    let dir = std::env::temp_dir().join("adsync-missing-cert-test");
    let config = HrConfig {
        client_id: "id".into(),
        client_secret: "secret".into(),
        base_url: "https://hr.example.com".into(),
        cert_file: dir.join("client.crt"),
        key_file: dir.join("client.key"),
    };
    match HrSource::from_config(&config, &AdapterOptions::default()) {
        Err(err @ AdapterError::Transport(_)) => assert_eq!(err.kind(), ErrorKind::Configuration),
        other => panic!("unexpected {other:?}"),
    }
}
