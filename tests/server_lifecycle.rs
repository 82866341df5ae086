//! Real listener, real client, graceful shutdown.

use std::time::Duration;

use admin_shield::http::{AppState, HttpServer};
use admin_shield::Shutdown;
use tokio::net::TcpListener;

mod common;

#[tokio::test]
async fn test_server_serves_and_drains_on_shutdown() {
    let config = common::test_config();
    let (stack, _clock) = common::stack_with(&config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server = HttpServer::new(AppState::new(stack, config));
    let handle = tokio::spawn(server.run(listener, shutdown.subscribe()));

    let client = reqwest::Client::new();
    let health = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    // Peer address becomes the identity when no header is present.
    let guard = client
        .post(format!("http://{}/v1/guard", addr))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(guard.status(), 204);
    assert_eq!(guard.headers()["x-ratelimit-remaining"], "59");

    shutdown.trigger();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}
