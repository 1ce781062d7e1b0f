use axum::Router;
use axum::body::Body;
use axum::http::{HeaderValue, Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::collections::HashSet;
use tower::ServiceExt;
use ticketer::{Allocator, AllocatorConfig, BatchBounds, MemoryRangeStore};
use ticketer_server::{AppState, router};

fn app_with(store: &MemoryRangeStore, cors_origin: Option<HeaderValue>) -> Router {
    let allocator = Allocator::new(
        store.clone(),
        AllocatorConfig {
            batch: BatchBounds::new(1, 100).unwrap(),
            ..AllocatorConfig::default()
        },
    );
    router(AppState::new(allocator, 7), cors_origin)
}

fn app(store: &MemoryRangeStore) -> Router {
    app_with(store, None)
}

fn ticket_body() -> Value {
    json!({
        "service_id": "shortener",
        "metadata": {
            "client_id": "web-1",
            "request_context": { "reason": "short_url_generation" }
        }
    })
}

fn batch_body(count: i64) -> Value {
    let mut body = ticket_body();
    body["count"] = json!(count);
    body
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.oneshot(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (parts.status, parts.headers, json)
}

#[tokio::test]
async fn generate_issues_the_next_ticket() {
    let store = MemoryRangeStore::default();
    let range = store.provision(1000, 1003).unwrap();

    let (status, headers, json) =
        send(app(&store), post("/api/v1/tickets/generate", &ticket_body())).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["ticket_id"], "1000");
    assert_eq!(json["data"]["range_id"], range.id.to_string());
    assert_eq!(json["data"]["database_id"], 7);
    assert!(json["data"]["timestamp"].as_i64().unwrap() > 0);

    let request_id = headers.get("x-request-id").unwrap().to_str().unwrap();
    assert!(!request_id.is_empty());
    assert_eq!(json["data"]["request_id"], request_id);
}

#[tokio::test]
async fn generate_batch_returns_inclusive_bounds() {
    let store = MemoryRangeStore::default();
    store.provision(0, 100).unwrap();

    let (status, _, json) = send(
        app(&store),
        post("/api/v1/tickets/generate-batch", &batch_body(10)),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["data"]["start_ticket_id"], "0");
    assert_eq!(json["data"]["end_ticket_id"], "9");
    assert_eq!(json["data"]["ticket_range"], 10);
    assert_eq!(store.snapshot()[0].current, 10);
}

#[tokio::test]
async fn large_ticket_values_survive_as_strings() {
    let store = MemoryRangeStore::default();
    let start = (1_i64 << 53) + 1;
    store.provision(start, start + 10).unwrap();

    let (_, _, json) = send(app(&store), post("/api/v1/tickets/generate", &ticket_body())).await;
    assert_eq!(json["data"]["ticket_id"], start.to_string());
}

#[tokio::test]
async fn caller_request_id_is_propagated() {
    let store = MemoryRangeStore::default();
    store.provision(0, 10).unwrap();

    let mut request = post("/api/v1/tickets/generate", &ticket_body());
    request
        .headers_mut()
        .insert("x-request-id", HeaderValue::from_static("trace-abc"));
    let (_, headers, json) = send(app(&store), request).await;

    assert_eq!(headers.get("x-request-id").unwrap(), "trace-abc");
    assert_eq!(json["data"]["request_id"], "trace-abc");
}

#[tokio::test]
async fn exhausted_pool_is_503_and_not_a_500() {
    let store = MemoryRangeStore::default();
    store.provision(0, 1).unwrap();
    let app = app(&store);

    let (status, _, _) = send(app.clone(), post("/api/v1/tickets/generate", &ticket_body())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, json) = send(app, post("/api/v1/tickets/generate", &ticket_body())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["kind"], "pool_exhausted");
    assert!(json["request_id"].as_str().is_some());
}

#[tokio::test]
async fn batch_larger_than_any_range_is_exhaustion() {
    let store = MemoryRangeStore::default();
    let range = store.provision_resumed(0, 100, 98).unwrap();

    let (status, _, json) = send(
        app(&store),
        post("/api/v1/tickets/generate-batch", &batch_body(5)),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["kind"], "pool_exhausted");
    assert_eq!(store.get(range.id).unwrap(), range);
}

#[tokio::test]
async fn invalid_requests_are_400_and_touch_nothing() {
    let store = MemoryRangeStore::default();
    let range = store.provision(0, 1_000).unwrap();
    let app = app(&store);

    let mut long_service = ticket_body();
    long_service["service_id"] = json!("s".repeat(129));
    let mut empty_client = ticket_body();
    empty_client["metadata"]["client_id"] = json!("");
    let mut wrong_reason = ticket_body();
    wrong_reason["metadata"]["request_context"]["reason"] = json!("analytics");
    let mut missing_metadata = ticket_body();
    missing_metadata.as_object_mut().unwrap().remove("metadata");

    let cases = [
        ("/api/v1/tickets/generate", long_service),
        ("/api/v1/tickets/generate", empty_client),
        ("/api/v1/tickets/generate", wrong_reason),
        ("/api/v1/tickets/generate", missing_metadata),
        ("/api/v1/tickets/generate-batch", batch_body(0)),
        ("/api/v1/tickets/generate-batch", batch_body(-3)),
        ("/api/v1/tickets/generate-batch", batch_body(101)),
        ("/api/v1/tickets/generate-batch", ticket_body()),
    ];
    for (uri, body) in cases {
        let (status, _, json) = send(app.clone(), post(uri, &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri} {body}");
        assert_eq!(json["error"]["kind"], "invalid_request");
    }

    let malformed = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/tickets/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, _) = send(app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(store.get(range.id).unwrap(), range);
}

#[tokio::test]
async fn health_check_reports_ok() {
    let store = MemoryRangeStore::default();
    let request = Request::builder()
        .uri("/api/v1/health-check")
        .body(Body::empty())
        .unwrap();

    let (status, headers, json) = send(app(&store), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], 200);
    assert_eq!(json["request_id"], headers["x-request-id"].to_str().unwrap());
    assert_eq!(headers["x-content-type-options"], "nosniff");
}

#[tokio::test]
async fn configured_origin_gets_credentialed_cors() {
    let store = MemoryRangeStore::default();
    let origin = HeaderValue::from_static("https://sho.rt");
    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/v1/tickets/generate")
        .header(header::ORIGIN, "https://sho.rt")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();

    let (_, headers, _) = send(app_with(&store, Some(origin)), preflight).await;

    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://sho.rt");
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "600");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_share_a_ticket() {
    let store = MemoryRangeStore::default();
    store.provision(0, 500).unwrap();
    store.provision(10_000, 10_500).unwrap();
    let app = app(&store);

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let app = app.clone();
            tokio::spawn(async move {
                let (uri, body) = if i % 5 == 0 {
                    ("/api/v1/tickets/generate-batch", batch_body(8))
                } else {
                    ("/api/v1/tickets/generate", ticket_body())
                };
                // both ranges locked at once surfaces as 503, try again
                let json = loop {
                    let (status, _, json) = send(app.clone(), post(uri, &body)).await;
                    if status != StatusCode::SERVICE_UNAVAILABLE {
                        assert_eq!(status, StatusCode::CREATED);
                        break json;
                    }
                    tokio::task::yield_now().await;
                };
                if i % 5 == 0 {
                    let start: i64 = json["data"]["start_ticket_id"].as_str().unwrap().parse().unwrap();
                    let end: i64 = json["data"]["end_ticket_id"].as_str().unwrap().parse().unwrap();
                    (start..=end).collect::<Vec<_>>()
                } else {
                    vec![json["data"]["ticket_id"].as_str().unwrap().parse().unwrap()]
                }
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for value in handle.await.unwrap() {
            assert!(seen.insert(value), "ticket {value} issued twice");
        }
    }
    // 10 batches of 8 and 40 singles
    assert_eq!(seen.len(), 120);
}
