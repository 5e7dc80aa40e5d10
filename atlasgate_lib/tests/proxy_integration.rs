use std::sync::Arc;

use atlasgate_lib::atlas_api::{AtlasClient, RateLimitInfo, UpstreamLimiter};
use atlasgate_lib::{
    count_key, publish_secrets, router, AppState, CounterStore, DownstreamLimiter, MemoryStore,
};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const UPSTREAM_SECRET: &str = "upstream-secret";

fn atlas_ok() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("X-RateLimit-Limit", "100")
        .insert_header("X-RateLimit-Burst", "100")
        .insert_header("X-RateLimit-Remaining", "99")
        .insert_header("X-RateLimit-Reset", "60000")
        .set_body_raw(r#"[{"id": 1}]"#.as_bytes().to_vec(), "application/json")
}

/// A generous upstream window so only the downstream budget is exercised.
fn open_upstream() -> UpstreamLimiter {
    let initial = RateLimitInfo {
        limit: 100,
        burst: 100,
        remaining: 100,
        reset: 60_000,
        retry_after: 0,
    };
    UpstreamLimiter::new(&initial, None)
}

async fn start_proxy(base_url: &str, store: Arc<MemoryStore>, rps: u32) -> String {
    publish_secrets(store.as_ref(), &["s1".to_string(), "s2".to_string()])
        .await
        .unwrap();
    let atlas = AtlasClient::new(base_url, UPSTREAM_SECRET).unwrap();
    let dyn_store: Arc<dyn CounterStore> = store.clone() as Arc<dyn CounterStore>;
    let downstream = DownstreamLimiter::new(dyn_store, rps, 5);
    let app = router(AppState::new(atlas, open_upstream(), downstream));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn the_third_request_in_a_second_is_throttled() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/series"))
        .respond_with(atlas_ok())
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 2).await;
    let client = reqwest::Client::new();

    let first = client
        .get(format!("{proxy}/series/live?secret=s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(header_value(&first, "X-RateLimit-Limit"), "2");
    assert_eq!(header_value(&first, "X-RateLimit-Remaining"), "1");
    assert_eq!(header_value(&first, "Retry-After"), "0");

    let second = client
        .get(format!("{proxy}/series/live?secret=s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(header_value(&second, "X-RateLimit-Remaining"), "0");

    let third = client
        .get(format!("{proxy}/series/live?secret=s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), 429);
    assert_eq!(header_value(&third, "X-RateLimit-Remaining"), "0");
    assert_eq!(header_value(&third, "Retry-After"), "1000");
    assert_eq!(header_value(&third, "X-RateLimit-Reset"), "1000");
}

#[tokio::test]
async fn budgets_are_independent_per_secret() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/teams"))
        .respond_with(atlas_ok())
        .expect(8)
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 4).await;
    let client = reqwest::Client::new();

    for _ in 0..4 {
        for secret in ["s1", "s2"] {
            let response = client
                .get(format!("{proxy}/teams/live?secret={secret}"))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200);
        }
    }
}

#[tokio::test]
async fn a_missing_secret_is_a_bad_request() {
    let mock_server = MockServer::start().await;
    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 2).await;

    let response = reqwest::get(format!("{proxy}/series/live")).await.unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn an_unknown_secret_is_forbidden_and_uncounted() {
    let mock_server = MockServer::start().await;
    let store = Arc::new(MemoryStore::new());
    let proxy = start_proxy(&mock_server.uri(), Arc::clone(&store), 2).await;

    let response = reqwest::get(format!("{proxy}/series/live?secret=zzz"))
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    assert_eq!(store.get(&count_key("zzz")).await.unwrap(), None);
}

#[tokio::test]
async fn the_header_secret_works_too() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/players"))
        .respond_with(atlas_ok())
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 2).await;
    let response = reqwest::Client::new()
        .get(format!("{proxy}/players/live"))
        .header("Demo-Secret", "s1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn page_params_are_rewritten_for_atlas() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/series"))
        .and(query_param("lifecycle", "live"))
        .and(query_param("take", "50"))
        .and(query_param("skip", "9999"))
        .and(header("Abios-Secret", UPSTREAM_SECRET))
        .respond_with(atlas_ok())
        .expect(1)
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 2).await;
    let response = reqwest::get(format!(
        "{proxy}/series/live?secret=s1&take=120&skip=9999"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn a_zero_take_is_not_clamped_away() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/series"))
        .and(query_param("take", "0"))
        .respond_with(atlas_ok())
        .expect(1)
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 2).await;
    let response = reqwest::get(format!("{proxy}/series/live?secret=s1&take=0"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn a_bad_take_never_reaches_atlas() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/series"))
        .respond_with(atlas_ok())
        .expect(0)
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 2).await;
    let response = reqwest::get(format!("{proxy}/series/live?secret=s1&take=abc"))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn upstream_refusals_are_relayed_verbatim() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/players"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 2).await;
    let response = reqwest::get(format!("{proxy}/players/live?secret=s1"))
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn an_unreachable_upstream_is_an_internal_error() {
    let proxy = start_proxy("http://127.0.0.1:1", Arc::new(MemoryStore::new()), 2).await;
    let response = reqwest::get(format!("{proxy}/series/live?secret=s1"))
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn payload_and_content_type_are_relayed() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/teams"))
        .respond_with(atlas_ok())
        .mount(&mock_server)
        .await;

    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 2).await;
    let response = reqwest::get(format!("{proxy}/teams/live?secret=s1"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(header_value(&response, "Content-Type"), "application/json");
    assert_eq!(response.text().await.unwrap(), r#"[{"id": 1}]"#);
}

#[tokio::test]
async fn unknown_routes_and_methods_are_not_proxied() {
    let mock_server = MockServer::start().await;
    let proxy = start_proxy(&mock_server.uri(), Arc::new(MemoryStore::new()), 2).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{proxy}/matches/live?secret=s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("{proxy}/series/live?secret=s1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);
}

fn header_value(response: &reqwest::Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
