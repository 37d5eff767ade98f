//! Spine service host.
//!
//! Boots an `App` from a TOML config, exposes `GET /preflight` on one HTTP
//! transport and serves until a signal drains or closes the process.
//!
//! ```text
//! spine --config spine.toml --service orders --listen 0.0.0.0:8080
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use axum::http::Method;
use clap::Parser;

use spine::config::{self, ConfigTree};
use spine::{Adapters, App, HttpServer};

#[derive(Debug, Parser)]
#[command(name = "spine", version, about = "Runtime spine service host")]
struct Args {
    /// TOML config file. Falls back to `CONFIG_URI`, then to an empty tree.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Service name tagged on logs, metrics and discovery registrations.
    #[arg(long, default_value = "spine")]
    service: String,

    /// HTTP bind address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let tree = match load(&args) {
        Ok(tree) => tree,
        Err(e) => {
            eprintln!("spine: {e}");
            return ExitCode::FAILURE;
        }
    };

    let app = match App::start(&args.service, tree, &Adapters::with_defaults()).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("spine: startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = HttpServer::new(app.config().request.clone());
    server.handle(Method::GET, "/preflight", |_ctx, _req| async { "ok" });
    app.register_server(&args.listen, Arc::new(server));

    match app.serve().await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Serve failed");
            app.close().await;
            ExitCode::FAILURE
        }
    }
}

fn load(args: &Args) -> Result<ConfigTree, config::ConfigError> {
    match &args.config {
        Some(path) => config::loader::load_path(path),
        None => config::loader::load_from_env(),
    }
}
