use std::time::Duration;

use cdp_bridge::PageDriver;
use tracing::{debug, info};

use crate::{error::LocatorError, LogicalElement, SelectorSet};

const POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Resolves a [`LogicalElement`] to the first CSS selector in its fallback
/// chain that matches a visible node.
pub struct SelectorResolver {
    set: SelectorSet,
}

impl SelectorResolver {
    pub fn new(set: SelectorSet) -> Self {
        Self { set }
    }

    pub fn set(&self) -> &SelectorSet {
        &self.set
    }

    /// One pass over the chain: the first visible match wins, `None` if
    /// nothing matches right now.
    pub async fn resolve_now(
        &self,
        driver: &dyn PageDriver,
        element: LogicalElement,
    ) -> Result<Option<String>, LocatorError> {
        let chain = self
            .set
            .chain(element)
            .ok_or(LocatorError::NoChain(element))?;

        for selector in chain {
            if driver.query_visible(selector).await? {
                debug!(target: "selectors", %element, %selector, "resolved");
                return Ok(Some(selector.clone()));
            }
        }
        Ok(None)
    }

    /// Poll the chain until something matches or `deadline` elapses.
    pub async fn resolve(
        &self,
        driver: &dyn PageDriver,
        element: LogicalElement,
        deadline: Duration,
    ) -> Result<String, LocatorError> {
        let chain_len = self
            .set
            .chain(element)
            .ok_or(LocatorError::NoChain(element))?
            .len();

        let start = tokio::time::Instant::now();
        loop {
            if let Some(selector) = self.resolve_now(driver, element).await? {
                return Ok(selector);
            }
            if start.elapsed() >= deadline {
                info!(target: "selectors", %element, tried = chain_len, "fallback chain exhausted");
                return Err(LocatorError::ElementNotFound {
                    element,
                    tried: chain_len,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cdp_bridge::{BridgeError, PageEvent};
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    struct FixedDomDriver {
        visible: Mutex<HashSet<String>>,
        bus: broadcast::Sender<PageEvent>,
    }

    impl FixedDomDriver {
        fn with_visible(selectors: &[&str]) -> Self {
            let (bus, _) = broadcast::channel(4);
            Self {
                visible: Mutex::new(selectors.iter().map(|s| s.to_string()).collect()),
                bus,
            }
        }
    }

    #[async_trait]
    impl PageDriver for FixedDomDriver {
        async fn navigate(&self, _url: &str, _deadline: Duration) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn evaluate(&self, _expression: &str) -> Result<Value, BridgeError> {
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
        async fn query_visible(&self, selector: &str) -> Result<bool, BridgeError> {
            Ok(self.visible.lock().unwrap().contains(selector))
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
    async fn falls_through_to_third_selector() {
        let driver = FixedDomDriver::with_visible(&["div[contenteditable='true']"]);
        let resolver = SelectorResolver::new(SelectorSet::chatgpt());

        let selector = resolver
            .resolve(&driver, LogicalElement::ChatInput, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(selector, "div[contenteditable='true']");
    }

    #[tokio::test]
    async fn first_match_wins_over_later_fallbacks() {
        let driver =
            FixedDomDriver::with_visible(&["#prompt-textarea", "div[contenteditable='true']"]);
        let resolver = SelectorResolver::new(SelectorSet::chatgpt());

        let selector = resolver
            .resolve(&driver, LogicalElement::ChatInput, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(selector, "#prompt-textarea");
    }

    #[tokio::test]
    async fn exhaustion_names_the_logical_element() {
        let driver = FixedDomDriver::with_visible(&[]);
        let resolver = SelectorResolver::new(SelectorSet::chatgpt());

        let err = resolver
            .resolve(&driver, LogicalElement::SendButton, Duration::from_millis(0))
            .await
            .unwrap_err();
        match err {
            LocatorError::ElementNotFound { element, tried } => {
                assert_eq!(element, LogicalElement::SendButton);
                assert_eq!(tried, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("send button"));
    }

    #[tokio::test]
    async fn resolve_now_is_single_pass() {
        let driver = FixedDomDriver::with_visible(&[]);
        let resolver = SelectorResolver::new(SelectorSet::chatgpt());

        let result = resolver
            .resolve_now(&driver, LogicalElement::CopyButton)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
