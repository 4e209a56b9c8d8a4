use relay_sync::{ChatSink, DiscordSink, DiscordSinkConfig, SinkError};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer, channel_id: &str) -> DiscordSinkConfig {
    DiscordSinkConfig {
        api_base: format!("{}/api/v10/", server.uri()),
        token: "bot-token".to_string(),
        channel_id: channel_id.to_string(),
    }
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v10/users/@me"))
        .and(header("authorization", "Bot bot-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "1", "username": "relay-bot" })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn connect_resolves_channel_and_send_posts_content() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v10/channels/555"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "555", "name": "announcements" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v10/channels/555/messages"))
        .and(header("authorization", "Bot bot-token"))
        .and(body_partial_json(json!({ "content": "**Hello**" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "9" })))
        .expect(1)
        .mount(&server)
        .await;

    let sink = DiscordSink::connect(reqwest::Client::new(), config(&server, "555"))
        .await
        .expect("connected");
    assert_eq!(sink.channel_id(), "555");
    sink.send("**Hello**").await.expect("delivered");
}

#[tokio::test]
async fn rejected_token_fails_connect() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v10/users/@me"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "401: Unauthorized" })))
        .mount(&server)
        .await;

    let err = DiscordSink::connect(reqwest::Client::new(), config(&server, "555"))
        .await
        .expect_err("bad token");
    assert!(matches!(err, SinkError::Unauthorized { status: 401 }));
}

#[tokio::test]
async fn unknown_channel_fails_connect() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v10/channels/404404"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Unknown Channel"))
        .mount(&server)
        .await;

    let err = DiscordSink::connect(reqwest::Client::new(), config(&server, "404404"))
        .await
        .expect_err("missing channel");
    match err {
        SinkError::ChannelResolution {
            channel_id,
            status,
            body,
        } => {
            assert_eq!(channel_id, "404404");
            assert_eq!(status, 404);
            assert_eq!(body, "Unknown Channel");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn rejected_message_is_a_delivery_error() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v10/channels/555"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "555" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v10/channels/555/messages"))
        .respond_with(ResponseTemplate::new(403).set_body_string("Missing Permissions"))
        .mount(&server)
        .await;

    let sink = DiscordSink::connect(reqwest::Client::new(), config(&server, "555"))
        .await
        .expect("connected");
    let err = sink.send("hi").await.expect_err("forbidden");
    assert!(matches!(err, SinkError::Delivery { status: 403, .. }));
}
