use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cdp_bridge::{CdpBridge, ChromiumTransport, PageDriver};
use chatrelay::server::{self, AppState};
use chatrelay::{ConversationDriver, RelayConfig, SessionManager};
use chatrelay_selectors::{SelectorResolver, SelectorSet};

#[derive(Parser)]
#[command(name = "chatrelay", version, about = "OpenAI-style API over a browser chat session")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the browser session and serve the HTTP API.
    Serve,
    /// Print the effective configuration and exit.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = chatrelay::telemetry::init();
    let cli = Cli::parse();
    let cfg = RelayConfig::from_env();

    match cli.command {
        Command::Serve => serve(cfg).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
    }
}

async fn serve(cfg: RelayConfig) -> Result<()> {
    chatrelay::session::kill_orphan_browsers(&cfg).await;
    let bridge_cfg =
        chatrelay::session::prepare_bridge_config(&cfg).context("bridge preparation failed")?;
    info!(
        executable = %bridge_cfg.executable.display(),
        profile = %bridge_cfg.user_data_dir.display(),
        headless = bridge_cfg.headless,
        "launching browser session"
    );

    let transport = Arc::new(ChromiumTransport::new(bridge_cfg.clone()));
    let bridge = Arc::new(CdpBridge::new(bridge_cfg, transport));
    bridge.start().await.context("browser bridge start failed")?;
    let driver: Arc<dyn PageDriver> = bridge;

    let resolver = Arc::new(SelectorResolver::new(SelectorSet::chatgpt()));
    let session = Arc::new(SessionManager::new(
        cfg.clone(),
        driver.clone(),
        resolver.clone(),
    ));
    if let Err(err) = session.start().await {
        session.shutdown().await;
        return Err(err).context("session start failed");
    }

    let conversation = Arc::new(ConversationDriver::new(
        cfg.clone(),
        driver,
        resolver,
        session.clone(),
    ));

    let result = server::serve(AppState::new(conversation, cfg)).await;

    session.shutdown().await;
    if let Err(err) = &result {
        warn!(%err, "server ended with an error");
    }
    result
}
