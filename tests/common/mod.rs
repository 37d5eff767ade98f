//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use spine::config::ConfigTree;
use spine::net::{NetError, Server};
use spine::{Adapters, App, Ctx, HttpServer};
use tokio::task::JoinHandle;

/// An app with no signal trap and no heartbeat, plus `extra` config.
pub async fn quiet_app(extra: &str) -> App {
    let config = format!("trap_signals = false\nheartbeat_secs = 0\n{extra}");
    let tree = ConfigTree::parse(&config).expect("test config parses");
    App::start("it", tree, &Adapters::with_defaults())
        .await
        .expect("app starts")
}

/// Serve `server` on an ephemeral port; returns its base URL.
pub async fn spawn_server(ctx: &Ctx, server: Arc<HttpServer>) -> (String, JoinHandle<Result<(), NetError>>) {
    let handle = tokio::spawn({
        let ctx = ctx.clone();
        let server = server.clone();
        async move { server.serve(ctx, "127.0.0.1:0".to_string()).await }
    });
    let addr = server.local_addr().await.expect("server bound");
    (format!("http://{addr}"), handle)
}
