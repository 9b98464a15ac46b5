//! Automation-fingerprint masking for the relay's browser session.
//!
//! Patches are applied with `Runtime.evaluate` on the live page, never with
//! an init script. Registering an init script on a containerized Chromium
//! breaks its DNS resolver (every later navigation fails with
//! `net::ERR_NAME_NOT_RESOLVED`), so instead the runtime injects after the
//! first navigation and re-injects on every `Navigated`/`Opened` event.

use std::sync::Arc;

use cdp_bridge::{BridgeError, PageDriver, PageEvent};
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// JS payload masking the obvious automation tells: `navigator.webdriver`,
/// empty plugin/language lists, a missing `window.chrome`, and the
/// notification-permission probe headless Chromium answers wrong.
pub const STEALTH_JS: &str = r#"
(() => {
  try {
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
  } catch (e) {}
  try {
    if (!window.chrome) {
      window.chrome = { runtime: {} };
    }
  } catch (e) {}
  try {
    if (navigator.plugins.length === 0) {
      Object.defineProperty(navigator, 'plugins', {
        get: () => [1, 2, 3],
      });
    }
  } catch (e) {}
  try {
    if (navigator.languages.length === 0) {
      Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en'],
      });
    }
  } catch (e) {}
  try {
    const originalQuery = window.navigator.permissions.query.bind(
      window.navigator.permissions
    );
    window.navigator.permissions.query = (parameters) =>
      parameters && parameters.name === 'notifications'
        ? Promise.resolve({ state: Notification.permission })
        : originalQuery(parameters);
  } catch (e) {}
})();
"#;

#[derive(Debug, Error)]
pub enum StealthError {
    #[error("stealth injection failed")]
    Injection(#[from] BridgeError),
}

/// Applies the stealth payload and keeps it applied across navigations.
pub struct StealthRuntime {
    driver: Arc<dyn PageDriver>,
    watch_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StealthRuntime {
    pub fn new(driver: Arc<dyn PageDriver>) -> Self {
        Self {
            driver,
            watch_task: std::sync::Mutex::new(None),
        }
    }

    /// Inject the payload into the current page.
    pub async fn apply(&self) -> Result<(), StealthError> {
        self.driver.evaluate(STEALTH_JS).await?;
        info!(target: "stealth", "fingerprint patches applied");
        Ok(())
    }

    /// Subscribe to page events and re-inject after every main-frame
    /// navigation and into every new page.
    pub fn watch(&self) {
        let driver = self.driver.clone();
        let mut events = driver.events();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PageEvent::Navigated { url }) => {
                        debug!(target: "stealth", %url, "re-injecting after navigation");
                        if let Err(err) = driver.evaluate(STEALTH_JS).await {
                            // Page may already be navigating again.
                            debug!(target: "stealth", ?err, "re-injection skipped");
                        }
                    }
                    Ok(PageEvent::Opened { target_id }) => {
                        debug!(target: "stealth", %target_id, "new page attached");
                        if let Err(err) = driver.evaluate(STEALTH_JS).await {
                            debug!(target: "stealth", ?err, "re-injection skipped");
                        }
                    }
                    Ok(PageEvent::ConnectionLost) => {
                        warn!(target: "stealth", "connection lost, stopping watcher");
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(target: "stealth", missed, "event bus lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Ok(mut guard) = self.watch_task.lock() {
            if let Some(old) = guard.replace(handle) {
                old.abort();
            }
        }
    }

    pub fn stop(&self) {
        if let Ok(mut guard) = self.watch_task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for StealthRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Jitter a base viewport by up to `spread` pixels per axis so consecutive
/// launches don't present a pixel-identical fingerprint.
pub fn jittered_viewport(base_width: u32, base_height: u32, spread: u32) -> (u32, u32) {
    if spread == 0 {
        return (base_width, base_height);
    }
    let mut rng = rand::thread_rng();
    let spread = spread as i64;
    let dw = rng.gen_range(-spread..=spread);
    let dh = rng.gen_range(-spread..=spread);
    let width = (base_width as i64 + dw).max(320) as u32;
    let height = (base_height as i64 + dh).max(240) as u32;
    (width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct RecordingDriver {
        evaluated: Mutex<Vec<String>>,
        bus: broadcast::Sender<PageEvent>,
    }

    impl RecordingDriver {
        fn new() -> Arc<Self> {
            let (bus, _) = broadcast::channel(8);
            Arc::new(Self {
                evaluated: Mutex::new(Vec::new()),
                bus,
            })
        }

        fn eval_count(&self) -> usize {
            self.evaluated.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageDriver for RecordingDriver {
        async fn navigate(&self, _url: &str, _deadline: Duration) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn evaluate(&self, expression: &str) -> Result<Value, BridgeError> {
            self.evaluated.lock().unwrap().push(expression.to_string());
            Ok(Value::Null)
        }
        async fn click(&self, _selector: &str, _deadline: Duration) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn insert_text(&self, _selector: &str, _text: &str) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn press_key(&self, _key: &str) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn read_text(&self, _selector: &str) -> Result<String, BridgeError> {
            Ok(String::new())
        }
        async fn query_visible(&self, _selector: &str) -> Result<bool, BridgeError> {
            Ok(false)
        }
        async fn set_input_files(
            &self,
            _selector: &str,
            _paths: &[String],
        ) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn fetch_as_data_url(&self, _url: &str) -> Result<String, BridgeError> {
            Ok(String::new())
        }
        async fn current_url(&self) -> Result<String, BridgeError> {
            Ok("about:blank".into())
        }
        fn events(&self) -> broadcast::Receiver<PageEvent> {
            self.bus.subscribe()
        }
    }

    #[tokio::test]
    async fn apply_evaluates_the_payload() {
        let driver = RecordingDriver::new();
        let runtime = StealthRuntime::new(driver.clone());
        runtime.apply().await.unwrap();

        let evaluated = driver.evaluated.lock().unwrap();
        assert_eq!(evaluated.len(), 1);
        assert!(evaluated[0].contains("webdriver"));
    }

    #[tokio::test]
    async fn watcher_reinjects_after_navigation() {
        let driver = RecordingDriver::new();
        let runtime = StealthRuntime::new(driver.clone());
        runtime.watch();

        // Give the watcher a moment to subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        driver
            .bus
            .send(PageEvent::Navigated {
                url: "https://chatgpt.com/".into(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(driver.eval_count(), 1);
        runtime.stop();
    }

    #[test]
    fn viewport_jitter_stays_within_spread() {
        for _ in 0..100 {
            let (w, h) = jittered_viewport(1280, 720, 20);
            assert!((1260..=1300).contains(&w));
            assert!((700..=740).contains(&h));
        }
    }

    #[test]
    fn zero_spread_is_identity() {
        assert_eq!(jittered_viewport(1280, 720, 0), (1280, 720));
    }
}
