//! Inbound trust boundary and outbound propagation over HTTP.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request};
use spine::config::RequestConfig;
use spine::context::Sideband;
use spine::context::{SHIPMENTS_HEADER, TRANSIT_HEADER};
use spine::net::http::X_REQUEST_ID;
use spine::net::Server;
use spine::{Ctx, HttpClient, HttpServer};

mod common;

/// Echoes `<transit id>|<user shipment>`.
fn echo_server(allow_context: bool) -> Arc<HttpServer> {
    let server = HttpServer::default().allow_context(allow_context);
    server.handle(Method::GET, "/echo", |ctx: Ctx, _req| async move {
        let transit = ctx.transit().map(|t| t.id().to_string()).unwrap_or_default();
        let user = ctx
            .shipment("user")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        format!("{transit}|{user}")
    });
    Arc::new(server)
}

fn caller() -> Ctx {
    Ctx::background().with_new_transit().with_shipment("user", "ada")
}

async fn get_with_sideband(url: &str, ctx: &Ctx) -> reqwest::Response {
    let (transit, shipments) = Sideband::capture(ctx).to_text();
    reqwest::Client::new()
        .get(url)
        .header(TRANSIT_HEADER, transit.unwrap())
        .header(SHIPMENTS_HEADER, shipments)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn closed_boundary_mints_a_fresh_transit() {
    let ctx = Ctx::background();
    let (base, _serving) = common::spawn_server(&ctx, echo_server(false)).await;
    let caller = caller();

    let response = get_with_sideband(&format!("{base}/echo"), &caller).await;
    assert_eq!(response.status(), 200);
    let request_id = response.headers()[X_REQUEST_ID].to_str().unwrap().to_string();
    let body = response.text().await.unwrap();

    let (transit, user) = body.split_once('|').unwrap();
    assert_ne!(transit, caller.transit().unwrap().id());
    assert!(!transit.is_empty());
    assert_eq!(transit, request_id);
    assert_eq!(user, "");
}

#[tokio::test]
async fn open_boundary_continues_the_chain() {
    let ctx = Ctx::background();
    let (base, _serving) = common::spawn_server(&ctx, echo_server(true)).await;
    let caller = caller();

    let body = get_with_sideband(&format!("{base}/echo"), &caller)
        .await
        .text()
        .await
        .unwrap();

    assert_eq!(body, format!("{}|ada", caller.transit().unwrap().id()));
}

#[tokio::test]
async fn malformed_sideband_is_rejected_when_open() {
    let ctx = Ctx::background();
    let (base, _serving) = common::spawn_server(&ctx, echo_server(true)).await;

    let response = reqwest::Client::new()
        .get(format!("{base}/echo"))
        .header(TRANSIT_HEADER, "%%% not base64 %%%")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn oversized_shipments_are_rejected_and_server_survives() {
    use base64::Engine;

    let ctx = Ctx::background();
    let (base, _serving) = common::spawn_server(&ctx, echo_server(true)).await;

    let pairs: Vec<(String, u8)> = (0..40_000).map(|_| (String::new(), 0)).collect();
    let blob = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&pairs).unwrap());
    let response = reqwest::Client::new()
        .get(format!("{base}/echo"))
        .header(SHIPMENTS_HEADER, blob)
        .send()
        .await;
    // Either the sideband is refused or hyper rejects the header outright.
    if let Ok(response) = response {
        assert!(response.status().is_client_error(), "status = {}", response.status());
    }

    let after = get_with_sideband(&format!("{base}/echo"), &caller()).await;
    assert_eq!(after.status(), 200);
}

#[tokio::test]
async fn client_propagates_when_enabled() {
    let ctx = Ctx::background();
    let (base, _serving) = common::spawn_server(&ctx, echo_server(true)).await;
    let caller = caller();

    for (propagate, expect_same) in [(true, true), (false, false)] {
        let client = HttpClient::new(&RequestConfig::default()).propagate_context(propagate);
        let req = Request::get(format!("{base}/echo")).body(Body::empty()).unwrap();
        let response = client.send(&caller, req).await.unwrap();
        let bytes = axum::body::to_bytes(Body::new(response.into_body()), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();

        let same = body == format!("{}|ada", caller.transit().unwrap().id());
        assert_eq!(same, expect_same, "propagate = {propagate}, body = {body}");
    }
}

#[tokio::test]
async fn deadline_answers_gateway_timeout() {
    let ctx = Ctx::background();
    let server = HttpServer::new(RequestConfig {
        timeout_ms: 50,
        ..RequestConfig::default()
    });
    server.handle(Method::GET, "/slow", |_ctx, _req| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "late"
    });
    let (base, _serving) = common::spawn_server(&ctx, Arc::new(server)).await;

    let response = reqwest::get(format!("{base}/slow")).await.unwrap();
    assert_eq!(response.status(), 504);
}

#[tokio::test]
async fn handler_panic_answers_internal_error() {
    let ctx = Ctx::background();
    let server = HttpServer::default();
    server.handle(Method::GET, "/boom", |_ctx, _req| async {
        if true {
            panic!("handler exploded");
        }
        "unreachable"
    });
    server.handle(Method::GET, "/fine", |_ctx, _req| async { "fine" });
    let (base, _serving) = common::spawn_server(&ctx, Arc::new(server)).await;

    assert_eq!(reqwest::get(format!("{base}/boom")).await.unwrap().status(), 500);
    assert_eq!(reqwest::get(format!("{base}/fine")).await.unwrap().status(), 200);
}

#[tokio::test]
async fn draining_server_refuses_new_requests() {
    let ctx = Ctx::background();
    let server = Arc::new(HttpServer::default());
    server.handle(Method::GET, "/slow", |_ctx, _req| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        "done"
    });
    server.handle(Method::GET, "/fast", |_ctx, _req| async { "fast" });
    let (base, _serving) = common::spawn_server(&ctx, server.clone()).await;

    // One long request keeps the server in drain while the next request arrives.
    let client = reqwest::Client::new();
    let slow = tokio::spawn({
        let client = client.clone();
        let url = format!("{base}/slow");
        async move { client.get(url).send().await }
    });
    while server.inflight() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let draining = tokio::spawn({
        let server = server.clone();
        async move { server.drain().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let refused = reqwest::Client::new().get(format!("{base}/fast")).send().await.unwrap();
    assert_eq!(refused.status(), 503);

    assert_eq!(slow.await.unwrap().unwrap().status(), 200);
    draining.await.unwrap();
}

#[tokio::test]
async fn refused_requests_are_not_counted_in_flight() {
    let ctx = Ctx::background();
    let server = Arc::new(HttpServer::default());
    server.handle(Method::GET, "/slow", |_ctx, _req| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        "done"
    });
    server.handle(Method::GET, "/fast", |_ctx, _req| async { "fast" });
    let (base, _serving) = common::spawn_server(&ctx, server.clone()).await;

    let client = reqwest::Client::new();
    let slow = tokio::spawn({
        let client = client.clone();
        let url = format!("{base}/slow");
        async move { client.get(url).send().await }
    });
    while server.inflight() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let draining = tokio::spawn({
        let server = server.clone();
        async move { server.drain().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Steady traffic during drain only ever sees 503s and never holds the
    // in-flight count above the one slow request.
    let flood: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            let url = format!("{base}/fast");
            tokio::spawn(async move {
                let mut statuses = Vec::new();
                for _ in 0..10 {
                    match client.get(&url).send().await {
                        Ok(resp) => statuses.push(resp.status().as_u16()),
                        Err(_) => break,
                    }
                }
                statuses
            })
        })
        .collect();
    let peak = tokio::time::timeout(Duration::from_secs(2), async {
        let mut peak = 0;
        while !draining.is_finished() {
            peak = peak.max(server.inflight());
            tokio::task::yield_now().await;
        }
        peak
    })
    .await
    .expect("drain completes under steady traffic");
    draining.await.unwrap();

    for sender in flood {
        assert!(sender.await.unwrap().iter().all(|status| *status == 503));
    }
    assert_eq!(slow.await.unwrap().unwrap().status(), 200);
    assert!(peak <= 1);
    assert_eq!(server.inflight(), 0);
}
