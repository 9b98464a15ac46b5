//! Shared scripted page for integration tests: behaves like the chat app
//! across a full turn without a browser.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use cdp_bridge::{BridgeError, PageDriver, PageEvent};
use chatrelay::{ConversationDriver, RelayConfig, SessionManager};
use chatrelay_selectors::{SelectorResolver, SelectorSet};

pub struct ScriptedChatPage {
    /// Finished turns; drives the assistant-turn and copy-button counts.
    pub completed: AtomicU64,
    /// The current turn has been submitted and is "streaming".
    submitted: AtomicBool,
    /// A turn is between prompt insertion and finalization.
    in_turn: AtomicBool,
    /// Two turns overlapped; the single-flight guarantee broke.
    pub violated: AtomicBool,
    pub reply_text: &'static str,
    bus: broadcast::Sender<PageEvent>,
}

impl ScriptedChatPage {
    pub fn new(reply_text: &'static str) -> Arc<Self> {
        let (bus, _) = broadcast::channel(8);
        Arc::new(Self {
            completed: AtomicU64::new(0),
            submitted: AtomicBool::new(false),
            in_turn: AtomicBool::new(false),
            violated: AtomicBool::new(false),
            reply_text,
            bus,
        })
    }

    fn turns(&self) -> u64 {
        self.completed.load(Ordering::SeqCst) + u64::from(self.submitted.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl PageDriver for ScriptedChatPage {
    async fn navigate(&self, _url: &str, _deadline: Duration) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn evaluate(&self, expr: &str) -> Result<Value, BridgeError> {
        if expr.contains("copy-turn-action-button") {
            Ok(Value::from(self.turns()))
        } else if expr.contains("seen.size") {
            Ok(Value::from(self.turns()))
        } else if expr.contains("found.push") {
            Ok(Value::Array(Vec::new()))
        } else if expr.contains("Generated image") {
            Ok(Value::Bool(false))
        } else if expr.contains("innerText") {
            Ok(Value::String(self.reply_text.to_string()))
        } else {
            Ok(Value::Null)
        }
    }

    async fn click(&self, _selector: &str, _deadline: Duration) -> Result<(), BridgeError> {
        self.submitted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_text(&self, _selector: &str, _text: &str) -> Result<(), BridgeError> {
        if self.in_turn.swap(true, Ordering::SeqCst) {
            self.violated.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn press_key(&self, _key: &str) -> Result<(), BridgeError> {
        self.submitted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_text(&self, _selector: &str) -> Result<String, BridgeError> {
        Ok(self.reply_text.to_string())
    }

    async fn query_visible(&self, selector: &str) -> Result<bool, BridgeError> {
        // Chat input and send button exist; stop button never renders.
        Ok(selector == "#prompt-textarea" || selector == "button[data-testid='send-button']")
    }

    async fn set_input_files(&self, _selector: &str, _paths: &[String]) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn fetch_as_data_url(&self, _url: &str) -> Result<String, BridgeError> {
        Ok("data:image/png;base64,".into())
    }

    async fn current_url(&self) -> Result<String, BridgeError> {
        // Finalize the in-flight turn: the thread-id read is the last page
        // touch of a completed turn.
        if self.in_turn.swap(false, Ordering::SeqCst) {
            if self.submitted.swap(false, Ordering::SeqCst) {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok("https://chatgpt.com/c/abc-123".into())
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.bus.subscribe()
    }
}

pub fn conversation_driver(page: Arc<ScriptedChatPage>, cfg: RelayConfig) -> ConversationDriver {
    let driver: Arc<dyn PageDriver> = page;
    let resolver = Arc::new(SelectorResolver::new(SelectorSet::chatgpt()));
    let session = Arc::new(SessionManager::new(
        cfg.clone(),
        driver.clone(),
        resolver.clone(),
    ));
    ConversationDriver::new(cfg, driver, resolver, session)
}
