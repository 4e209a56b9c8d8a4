use chrono::{TimeZone, Utc};
use relay_adapters::{AnnouncementSource, CanvasSource, CanvasSourceConfig};
use relay_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn source_for(server: &MockServer) -> CanvasSource {
    let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
    CanvasSource::new(
        http,
        CanvasSourceConfig {
            base_url: format!("{}/", server.uri()),
            token: "lms-token".to_string(),
            course_id: "42".to_string(),
        },
    )
}

#[tokio::test]
async fn follows_next_links_and_sorts_newest_first() {
    let server = MockServer::start().await;
    let page_two = format!("{}/api/v1/announcements?page=2&per_page=2", server.uri());

    Mock::given(method("GET"))
        .and(path("/api/v1/announcements"))
        .and(query_param("page", "2"))
        .and(header("authorization", "Bearer lms-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 3, "title": "Undated", "message": "<p>x</p>" },
            { "id": 4, "title": "Newest", "posted_at": "2026-02-22T09:00:00Z" }
        ])))
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/announcements"))
        .and(query_param("context_codes[]", "course_42"))
        .and(query_param("per_page", "2"))
        .and(query_param("start_date", "2026-02-01T00:00:00Z"))
        .and(header("authorization", "Bearer lms-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "link",
                    format!("<{page_two}>; rel=\"next\", <{page_two}>; rel=\"last\"").as_str(),
                )
                .set_body_json(json!([
                    { "id": 1, "title": "Oldest", "posted_at": "2026-02-10T09:00:00Z" },
                    { "id": 2, "title": "Middle", "posted_at": "2026-02-15T09:00:00Z" }
                ])),
        )
        .mount(&server)
        .await;

    let since = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
    let items = source_for(&server)
        .fetch_since(Some(since), 2)
        .await
        .expect("fetch ok");

    let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, ["4", "2", "1", "3"]);
    assert_eq!(items[3].timestamp, None);
    assert_eq!(items[3].body, "x");
}

#[tokio::test]
async fn failing_page_fails_the_whole_fetch() {
    let server = MockServer::start().await;
    let page_two = format!("{}/api/v1/announcements?page=2", server.uri());

    Mock::given(method("GET"))
        .and(path("/api/v1/announcements"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/announcements"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("link", format!("<{page_two}>; rel=\"next\"").as_str())
                .set_body_json(json!([{ "id": 1, "title": "First page" }])),
        )
        .mount(&server)
        .await;

    let err = source_for(&server)
        .fetch_since(None, 50)
        .await
        .expect_err("page two is down");
    match err {
        FetchError::HttpStatus { status, body, .. } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn non_array_page_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/announcements"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errors": [] })))
        .mount(&server)
        .await;

    let err = source_for(&server)
        .fetch_since(None, 10)
        .await
        .expect_err("object body is not a listing");
    assert!(matches!(err, FetchError::Decode { .. }));
}

#[tokio::test]
async fn next_link_pointing_back_at_itself_fails_the_fetch() {
    let server = MockServer::start().await;
    let page_one = format!("{}/api/v1/announcements?page=1", server.uri());

    Mock::given(method("GET"))
        .and(path("/api/v1/announcements"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("link", format!("<{page_one}>; rel=\"next\"").as_str())
                .set_body_json(json!([{ "id": 1, "title": "Looping" }])),
        )
        .expect(2)
        .mount(&server)
        .await;

    let err = source_for(&server)
        .fetch_since(None, 50)
        .await
        .expect_err("repeated next link");
    match err {
        FetchError::Decode { message, .. } => assert!(message.contains("revisits"), "{message}"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn endless_distinct_pages_stop_at_the_page_limit() {
    let server = MockServer::start().await;
    let listing = format!("{}/api/v1/announcements", server.uri());

    Mock::given(method("GET"))
        .and(path("/api/v1/announcements"))
        .respond_with(move |req: &wiremock::Request| {
            let page: usize = req
                .url
                .query_pairs()
                .find(|(k, _)| *k == "page")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(1);
            let next = format!("{listing}?page={}", page + 1);
            ResponseTemplate::new(200)
                .insert_header("link", format!("<{next}>; rel=\"next\"").as_str())
                .set_body_json(json!([]))
        })
        .expect(relay_adapters::MAX_PAGES as u64)
        .mount(&server)
        .await;

    let err = source_for(&server)
        .fetch_since(None, 50)
        .await
        .expect_err("page limit");
    match err {
        FetchError::Decode { message, .. } => assert!(message.contains("exceeded"), "{message}"),
        other => panic!("unexpected error {other:?}"),
    }
}
