//! Transport registry contract tests.

use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use spine::net::{NetError, Server, State, TransportRegistry};
use spine::{Ctx, HttpServer};

mod common;

#[test]
#[should_panic(expected = "already registered")]
fn duplicate_address_is_fatal() {
    let registry = TransportRegistry::new();
    registry.add("127.0.0.1:9001", Arc::new(HttpServer::default()));
    registry.add("127.0.0.1:9001", Arc::new(HttpServer::default()));
}

#[test]
#[should_panic(expected = "already registered")]
fn duplicate_server_is_fatal() {
    let registry = TransportRegistry::new();
    let server: Arc<dyn Server> = Arc::new(HttpServer::default());
    registry.add("127.0.0.1:9001", server.clone());
    registry.add("127.0.0.1:9002", server);
}

#[tokio::test]
async fn empty_registry_cannot_serve() {
    let registry = TransportRegistry::new();
    let err = registry.serve(&Ctx::background()).unwrap_err();
    assert!(matches!(err, NetError::EmptyRegistry));
}

#[tokio::test]
async fn drain_waits_for_in_flight_requests() {
    let ctx = Ctx::background();
    let server = Arc::new(HttpServer::default());
    server.handle(Method::GET, "/slow", |_ctx, _req| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        "done"
    });
    let (base, serving) = common::spawn_server(&ctx, server.clone()).await;

    let request = tokio::spawn(async move { reqwest::get(format!("{base}/slow")).await });
    while server.inflight() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    server.drain().await;
    assert_eq!(server.state(), State::Down);

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "done");
    serving.await.unwrap().unwrap();
}
