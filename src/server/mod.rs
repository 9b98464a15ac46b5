//! OpenAI-compatible HTTP facade over the conversation driver.

mod routes;
mod schemas;
mod state;

pub use routes::{build_router, MODEL_ID};
pub use state::AppState;

use anyhow::Context;
use tracing::info;

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.cfg.api_host, state.cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(target: "server", %addr, "listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "server", "shutdown signal received");
        })
        .await
        .context("server exited with an error")
}
