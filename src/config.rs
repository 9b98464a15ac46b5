//! Relay configuration, loaded from `CHATRELAY_*` environment variables
//! with defaults that work out of the box against chatgpt.com.

use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Callers arriving mid-turn wait their turn (FIFO).
    Queue,
    /// Callers arriving mid-turn are rejected with a busy error.
    Reject,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Chat site root URL.
    pub target_url: String,
    /// Persistent browser profile (cookies, login state).
    pub profile_dir: PathBuf,
    /// Staging area for decoded/downloaded attachments.
    pub staging_dir: PathBuf,
    /// Download directory for generated images.
    pub images_dir: PathBuf,

    /// Outer bound on the whole completion-detection phase.
    pub response_timeout_ms: u64,
    /// Per-attempt bound on locator resolution.
    pub selector_timeout_ms: u64,
    /// Detector poll interval.
    pub poll_interval_ms: u64,
    /// Consecutive identical text samples before the stability signal fires.
    pub stability_samples: u32,
    /// Spacing between stability samples.
    pub stability_spacing_ms: u64,
    /// Per-attempt navigation timeout.
    pub nav_timeout_ms: u64,
    /// Navigation attempts before `start()` gives up.
    pub nav_retries: u32,

    /// Upload settle delay after attaching: base + per-file increment.
    pub upload_settle_base_ms: u64,
    pub upload_settle_per_file_ms: u64,

    /// Viewport base and per-launch jitter spread.
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub viewport_jitter_px: u32,

    /// Kill orphaned Chromium processes bound to the profile before launch.
    pub kill_orphans: bool,

    /// HTTP facade bind address and optional bearer token.
    pub api_host: String,
    pub api_port: u16,
    /// Empty means no auth.
    pub api_token: Option<String>,

    pub busy_policy: BusyPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            target_url: "https://chatgpt.com".into(),
            profile_dir: PathBuf::from("./.chatrelay-profile"),
            staging_dir: PathBuf::from("./.chatrelay-staging"),
            images_dir: PathBuf::from("./downloads/images"),
            response_timeout_ms: 120_000,
            selector_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            stability_samples: 4,
            stability_spacing_ms: 2_000,
            nav_timeout_ms: 30_000,
            nav_retries: 5,
            upload_settle_base_ms: 3_000,
            upload_settle_per_file_ms: 1_000,
            viewport_width: 1280,
            viewport_height: 720,
            viewport_jitter_px: 20,
            kill_orphans: true,
            api_host: "0.0.0.0".into(),
            api_port: 8000,
            api_token: None,
            busy_policy: BusyPolicy::Queue,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(value) = env_string("CHATRELAY_URL") {
            cfg.target_url = value;
        }
        if let Some(value) = env_string("CHATRELAY_PROFILE_DIR") {
            cfg.profile_dir = PathBuf::from(value);
        }
        if let Some(value) = env_string("CHATRELAY_STAGING_DIR") {
            cfg.staging_dir = PathBuf::from(value);
        }
        if let Some(value) = env_string("CHATRELAY_IMAGES_DIR") {
            cfg.images_dir = PathBuf::from(value);
        }
        if let Some(value) = env_u64("CHATRELAY_RESPONSE_TIMEOUT_MS") {
            cfg.response_timeout_ms = value;
        }
        if let Some(value) = env_u64("CHATRELAY_SELECTOR_TIMEOUT_MS") {
            cfg.selector_timeout_ms = value;
        }
        if let Some(value) = env_u64("CHATRELAY_POLL_INTERVAL_MS") {
            cfg.poll_interval_ms = value;
        }
        if let Some(value) = env_string("CHATRELAY_HOST") {
            cfg.api_host = value;
        }
        if let Some(value) = env_u64("CHATRELAY_PORT") {
            cfg.api_port = value as u16;
        }
        if let Some(value) = env_string("CHATRELAY_API_TOKEN") {
            cfg.api_token = Some(value);
        }
        if let Some(value) = env_string("CHATRELAY_BUSY_POLICY") {
            cfg.busy_policy = match value.to_ascii_lowercase().as_str() {
                "reject" => BusyPolicy::Reject,
                _ => BusyPolicy::Queue,
            };
        }
        if let Some(value) = env_string("CHATRELAY_KILL_ORPHANS") {
            cfg.kill_orphans = !matches!(
                value.to_ascii_lowercase().as_str(),
                "0" | "false" | "no" | "off"
            );
        }

        cfg
    }

    /// Create the directories the relay writes into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.profile_dir)?;
        std::fs::create_dir_all(&self.staging_dir)?;
        std::fs::create_dir_all(&self.images_dir)?;
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(_) => None,
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_the_documented_contract() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.response_timeout_ms, 120_000);
        assert_eq!(cfg.nav_retries, 5);
        assert_eq!(cfg.stability_samples, 4);
        assert_eq!(cfg.busy_policy, BusyPolicy::Queue);
        assert!(cfg.api_token.is_none());
    }

    #[test]
    #[serial]
    fn busy_policy_parses_reject() {
        std::env::set_var("CHATRELAY_BUSY_POLICY", "reject");
        let cfg = RelayConfig::from_env();
        std::env::remove_var("CHATRELAY_BUSY_POLICY");
        assert_eq!(cfg.busy_policy, BusyPolicy::Reject);
    }
}
