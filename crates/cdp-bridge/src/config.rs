use crate::detect_chrome_executable;
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf};

/// Configuration for launching and tuning the bridge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub executable: PathBuf,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    /// Per-command deadline applied by the transport.
    pub default_deadline_ms: u64,
    /// Keep-alive ping interval; 0 disables the heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Attach to an already-running browser instead of launching one.
    pub websocket_url: Option<String>,
    /// Viewport applied when the page is attached. Callers jitter this
    /// per launch before handing the config over.
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            executable: detect_chrome_executable().unwrap_or_default(),
            user_data_dir: default_profile_dir(),
            headless: resolve_headless_default(),
            default_deadline_ms: 30_000,
            heartbeat_interval_ms: 15_000,
            websocket_url: resolve_ws_url(),
            viewport_width: 1280,
            viewport_height: 720,
        }
    }
}

fn resolve_headless_default() -> bool {
    // CHATRELAY_HEADLESS: "0", "false", "no", "off" means headful
    match env::var("CHATRELAY_HEADLESS") {
        Ok(value) => {
            let lower = value.to_ascii_lowercase();
            !matches!(lower.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => false,
    }
}

fn resolve_ws_url() -> Option<String> {
    match env::var("CHATRELAY_WS_URL") {
        Ok(value) => {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(_) => None,
    }
}

fn default_profile_dir() -> PathBuf {
    if let Ok(path) = env::var("CHATRELAY_PROFILE_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("./.chatrelay-profile")
}
