//! Session lifecycle: prepare the profile, launch or attach the browser,
//! reach the chat site, mask the automation fingerprint, and verify the
//! persisted profile is still logged in.
//!
//! Authentication itself is out of scope: the operator logs in once with a
//! headful browser against the same profile directory, and this session
//! only observes the result.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use cdp_bridge::{clear_stale_profile_locks, detect_chrome_executable, BridgeConfig, PageDriver};
use chatrelay_selectors::{LogicalElement, SelectorResolver};
use chatrelay_stealth::{jittered_viewport, StealthRuntime};

use crate::config::RelayConfig;
use crate::errors::{RelayError, RelayResult};
use crate::models::LoginState;

/// Build the bridge launch config from relay settings: per-launch viewport
/// jitter, the persistent profile, and the navigation deadline. Creates the
/// relay's working directories and clears stale Chromium locks first.
pub fn prepare_bridge_config(cfg: &RelayConfig) -> RelayResult<BridgeConfig> {
    cfg.ensure_dirs()
        .map_err(|e| RelayError::SessionLaunch(format!("cannot create working dirs: {e}")))?;
    clear_stale_profile_locks(&cfg.profile_dir);

    let (width, height) = jittered_viewport(
        cfg.viewport_width,
        cfg.viewport_height,
        cfg.viewport_jitter_px,
    );

    let mut bridge_cfg = BridgeConfig {
        user_data_dir: cfg.profile_dir.clone(),
        default_deadline_ms: cfg.nav_timeout_ms,
        viewport_width: width,
        viewport_height: height,
        ..BridgeConfig::default()
    };
    if bridge_cfg.executable.as_os_str().is_empty() {
        bridge_cfg.executable = detect_chrome_executable().ok_or_else(|| {
            RelayError::SessionLaunch(
                "no Chromium executable found; set CHATRELAY_CHROME".to_string(),
            )
        })?;
    }
    Ok(bridge_cfg)
}

/// Kill leftover browser processes still holding the profile from a
/// previous crashed run. Best-effort; a fresh environment has none.
pub async fn kill_orphan_browsers(cfg: &RelayConfig) {
    if !cfg.kill_orphans {
        return;
    }
    let needle = cfg.profile_dir.to_string_lossy().into_owned();
    match tokio::process::Command::new("pkill")
        .args(["-f", &needle])
        .status()
        .await
    {
        Ok(status) if status.success() => {
            info!(target: "session", profile = %needle, "killed orphaned browser processes");
            // Give the kernel a beat to release the profile locks.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(_) => {}
        Err(err) => warn!(target: "session", %err, "orphan cleanup unavailable"),
    }
}

pub struct SessionManager {
    cfg: RelayConfig,
    driver: Arc<dyn PageDriver>,
    resolver: Arc<SelectorResolver>,
    stealth: StealthRuntime,
    login: RwLock<LoginState>,
}

impl SessionManager {
    pub fn new(
        cfg: RelayConfig,
        driver: Arc<dyn PageDriver>,
        resolver: Arc<SelectorResolver>,
    ) -> Self {
        let stealth = StealthRuntime::new(driver.clone());
        Self {
            cfg,
            driver,
            resolver,
            stealth,
            login: RwLock::new(LoginState::Unknown),
        }
    }

    pub fn driver(&self) -> Arc<dyn PageDriver> {
        self.driver.clone()
    }

    /// Reach the chat site with backoff retries, apply fingerprint masking,
    /// and check login state. Fails with `SessionLaunch` only after every
    /// navigation attempt is spent.
    pub async fn start(&self) -> RelayResult<()> {
        self.navigate_with_retries(&self.cfg.target_url.clone())
            .await?;

        // Masking goes in after the first navigation lands; the watcher
        // keeps it applied across later navigations and new tabs.
        if let Err(err) = self.stealth.apply().await {
            warn!(target: "session", %err, "stealth injection failed, continuing unmasked");
        }
        self.stealth.watch();

        self.refresh_login_state().await?;
        Ok(())
    }

    async fn navigate_with_retries(&self, url: &str) -> RelayResult<()> {
        let deadline = Duration::from_millis(self.cfg.nav_timeout_ms);
        let attempts = self.cfg.nav_retries.max(1);
        let mut last_err = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = Duration::from_secs(1u64 << (attempt - 1).min(4));
                warn!(target: "session", attempt, backoff_s = backoff.as_secs(), "retrying navigation");
                tokio::time::sleep(backoff).await;
            }
            match self.driver.navigate(url, deadline).await {
                Ok(()) => {
                    info!(target: "session", url, attempt, "navigation complete");
                    return Ok(());
                }
                Err(err) => last_err = err.to_string(),
            }
        }
        Err(RelayError::SessionLaunch(format!(
            "navigation to {url} failed after {attempts} attempts: {last_err}"
        )))
    }

    /// Probe the page for login state. The chat input proves a usable
    /// session; an explicit login button proves the opposite; anything else
    /// stays `Unknown` and the session proceeds optimistically.
    pub async fn refresh_login_state(&self) -> RelayResult<LoginState> {
        let probe_deadline = Duration::from_millis(self.cfg.selector_timeout_ms);

        let state = if self
            .resolver
            .resolve(
                self.driver.as_ref(),
                LogicalElement::ChatInput,
                probe_deadline,
            )
            .await
            .is_ok()
        {
            LoginState::LoggedIn
        } else if matches!(
            self.resolver
                .resolve_now(self.driver.as_ref(), LogicalElement::LoginIndicator)
                .await,
            Ok(Some(_))
        ) {
            LoginState::LoggedOut
        } else {
            LoginState::Unknown
        };

        *self.login.write().await = state;
        match state {
            LoginState::LoggedIn => info!(target: "session", "session is logged in"),
            LoginState::LoggedOut => {
                warn!(target: "session", "session is logged out; log in manually against this profile");
                return Err(RelayError::NotAuthenticated);
            }
            LoginState::Unknown => {
                warn!(target: "session", "login state unclear, proceeding optimistically")
            }
        }
        Ok(state)
    }

    pub async fn login_state(&self) -> LoginState {
        *self.login.read().await
    }

    /// Idempotent teardown: stop the stealth watcher and release the page.
    pub async fn shutdown(&self) {
        self.stealth.stop();
        if let Err(err) = self.driver.close().await {
            warn!(target: "session", %err, "driver close reported an error");
        }
        info!(target: "session", "session shut down");
    }
}
