use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeErrorKind};
use crate::events::PageEvent;
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};

/// The page-operation surface the relay is written against.
///
/// Everything above the bridge (session manager, detector, upload staging,
/// stealth) talks to a `dyn PageDriver`, never to CDP directly, so the whole
/// stack runs against an in-memory mock in tests.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate the main frame and wait for the document to be interactive.
    async fn navigate(&self, url: &str, deadline: Duration) -> Result<(), BridgeError>;

    /// Evaluate a JS expression in the page, returning its JSON value.
    /// Promises are awaited; a thrown exception maps to `Internal`.
    async fn evaluate(&self, expression: &str) -> Result<Value, BridgeError>;

    /// Click the first match for `selector`, polling until `deadline`.
    async fn click(&self, selector: &str, deadline: Duration) -> Result<(), BridgeError>;

    /// Focus the first match for `selector` and insert `text` as if typed,
    /// preserving newlines without triggering submit-on-enter handlers.
    async fn insert_text(&self, selector: &str, text: &str) -> Result<(), BridgeError>;

    /// Dispatch a raw key press (down + up) to the focused element.
    async fn press_key(&self, key: &str) -> Result<(), BridgeError>;

    /// `innerText` of the first match for `selector`, or `TargetNotFound`.
    async fn read_text(&self, selector: &str) -> Result<String, BridgeError>;

    /// Single-shot check: does `selector` match a visible element right now?
    async fn query_visible(&self, selector: &str) -> Result<bool, BridgeError>;

    /// Attach local files to a file input matched by `selector`.
    async fn set_input_files(&self, selector: &str, paths: &[String]) -> Result<(), BridgeError>;

    /// Fetch a same-page resource (blob:, relative, or absolute URL) from
    /// inside the page and return it as a data: URL. Used for generated
    /// images, which are only fetchable with the page's own cookies.
    async fn fetch_as_data_url(&self, url: &str) -> Result<String, BridgeError>;

    /// Current `window.location.href`.
    async fn current_url(&self) -> Result<String, BridgeError>;

    /// Subscribe to page lifecycle events.
    fn events(&self) -> broadcast::Receiver<PageEvent>;

    /// Release live page resources. No-op by default so in-memory test
    /// drivers need not implement it.
    async fn close(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Production [`PageDriver`] backed by a [`CdpTransport`].
pub struct CdpBridge {
    cfg: BridgeConfig,
    transport: Arc<dyn CdpTransport>,
    bus: broadcast::Sender<PageEvent>,
    session: RwLock<Option<String>>,
    shutdown: CancellationToken,
    pump: RwLock<Option<JoinHandle<()>>>,
}

impl CdpBridge {
    pub fn new(cfg: BridgeConfig, transport: Arc<dyn CdpTransport>) -> Self {
        let (bus, _) = broadcast::channel(64);
        Self {
            cfg,
            transport,
            bus,
            session: RwLock::new(None),
            shutdown: CancellationToken::new(),
            pump: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    /// Launch (or attach to) the browser, attach to a page target, enable the
    /// domains the driver needs, and start the event pump.
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.transport.start().await?;

        let target_id = self.find_or_create_page().await?;
        let attached = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BridgeError::new(BridgeErrorKind::Internal)
                    .with_hint("attachToTarget returned no sessionId")
            })?
            .to_string();

        for method in ["Page.enable", "Runtime.enable"] {
            self.transport
                .send_command(
                    CommandTarget::Session(session_id.clone()),
                    method,
                    json!({}),
                )
                .await?;
        }

        self.transport
            .send_command(
                CommandTarget::Session(session_id.clone()),
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": self.cfg.viewport_width,
                    "height": self.cfg.viewport_height,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
            )
            .await?;

        *self.session.write().await = Some(session_id.clone());
        self.spawn_event_pump().await;

        info!(target: "cdp-bridge", session = %session_id, "page session attached");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.pump.write().await.take() {
            handle.abort();
        }
    }

    async fn find_or_create_page(&self) -> Result<String, BridgeError> {
        let targets = self
            .transport
            .send_command(CommandTarget::Browser, "Target.getTargets", json!({}))
            .await?;

        if let Some(infos) = targets.get("targetInfos").and_then(Value::as_array) {
            for info in infos {
                let is_page = info.get("type").and_then(Value::as_str) == Some("page");
                let url = info.get("url").and_then(Value::as_str).unwrap_or("");
                if is_page && !url.starts_with("devtools://") {
                    if let Some(id) = info.get("targetId").and_then(Value::as_str) {
                        return Ok(id.to_string());
                    }
                }
            }
        }

        let created = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank" }),
            )
            .await?;
        created
            .get("targetId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                BridgeError::new(BridgeErrorKind::Internal)
                    .with_hint("createTarget returned no targetId")
            })
    }

    async fn spawn_event_pump(&self) {
        let transport = self.transport.clone();
        let bus = self.bus.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    ev = transport.next_event() => ev,
                };
                match event {
                    Some(ev) => Self::republish(&bus, ev),
                    None => {
                        warn!(target: "cdp-bridge", "transport event stream ended");
                        let _ = bus.send(PageEvent::ConnectionLost);
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.pump.write().await.replace(handle) {
            old.abort();
        }
    }

    fn republish(bus: &broadcast::Sender<PageEvent>, ev: TransportEvent) {
        match ev.method.as_str() {
            "Page.frameNavigated" => {
                // Only the main frame counts; subframes carry a parentId.
                let frame = ev.params.get("frame");
                let is_main = frame
                    .map(|f| f.get("parentId").is_none())
                    .unwrap_or(false);
                if is_main {
                    if let Some(url) = frame
                        .and_then(|f| f.get("url"))
                        .and_then(Value::as_str)
                    {
                        let _ = bus.send(PageEvent::Navigated {
                            url: url.to_string(),
                        });
                    }
                }
            }
            "Target.attachedToTarget" => {
                let info = ev.params.get("targetInfo");
                let is_page = info
                    .and_then(|i| i.get("type"))
                    .and_then(Value::as_str)
                    == Some("page");
                if is_page {
                    if let Some(id) = info
                        .and_then(|i| i.get("targetId"))
                        .and_then(Value::as_str)
                    {
                        let _ = bus.send(PageEvent::Opened {
                            target_id: id.to_string(),
                        });
                    }
                }
            }
            _ => {
                debug!(target: "cdp-bridge", method = %ev.method, "unhandled cdp event");
            }
        }
    }

    async fn session_target(&self) -> Result<CommandTarget, BridgeError> {
        let guard = self.session.read().await;
        match guard.as_ref() {
            Some(id) => Ok(CommandTarget::Session(id.clone())),
            None => Err(BridgeError::new(BridgeErrorKind::Internal)
                .with_hint("bridge not started: no page session")),
        }
    }

    async fn eval_raw(&self, expression: &str) -> Result<Value, BridgeError> {
        let target = self.session_target().await?;
        let resp = self
            .transport
            .send_command(
                target,
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = resp.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("javascript exception");
            return Err(BridgeError::new(BridgeErrorKind::Internal).with_hint(text));
        }

        Ok(resp
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }
}

/// Embed a Rust string into a JS expression as a quoted literal.
fn js_string(value: &str) -> String {
    // serde_json string encoding is valid JS string syntax.
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

#[async_trait]
impl PageDriver for CdpBridge {
    async fn navigate(&self, url: &str, deadline: Duration) -> Result<(), BridgeError> {
        let target = self.session_target().await?;
        let resp = self
            .transport
            .send_command(target, "Page.navigate", json!({ "url": url }))
            .await?;

        if let Some(err_text) = resp.get("errorText").and_then(Value::as_str) {
            if !err_text.is_empty() {
                return Err(BridgeError::new(BridgeErrorKind::NavTimeout)
                    .with_hint(format!("navigation failed: {err_text}"))
                    .retriable(true));
            }
        }

        // Page.navigate resolves before the document is usable; poll
        // readyState until the page is at least interactive.
        let start = tokio::time::Instant::now();
        loop {
            let state = self.eval_raw("document.readyState").await?;
            if matches!(state.as_str(), Some("interactive") | Some("complete")) {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(BridgeError::new(BridgeErrorKind::NavTimeout)
                    .with_hint(format!("document not ready after {deadline:?}"))
                    .retriable(true));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, BridgeError> {
        self.eval_raw(expression).await
    }

    async fn click(&self, selector: &str, deadline: Duration) -> Result<(), BridgeError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); \
             if (!el) return false; el.click(); return true; }})()",
            sel = js_string(selector)
        );

        let start = tokio::time::Instant::now();
        loop {
            if self.eval_raw(&expr).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(BridgeError::new(BridgeErrorKind::TargetNotFound)
                    .with_hint(format!("no clickable element for {selector}")));
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
    }

    async fn insert_text(&self, selector: &str, text: &str) -> Result<(), BridgeError> {
        let focus = format!(
            "(() => {{ const el = document.querySelector({sel}); \
             if (!el) return false; el.focus(); return true; }})()",
            sel = js_string(selector)
        );
        if self.eval_raw(&focus).await?.as_bool() != Some(true) {
            return Err(BridgeError::new(BridgeErrorKind::TargetNotFound)
                .with_hint(format!("no focusable element for {selector}")));
        }

        let target = self.session_target().await?;
        self.transport
            .send_command(target, "Input.insertText", json!({ "text": text }))
            .await?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), BridgeError> {
        let target = self.session_target().await?;

        let (code, vk, text) = match key {
            "Enter" => ("Enter", 13, Some("\r")),
            "Escape" => ("Escape", 27, None),
            "Tab" => ("Tab", 9, Some("\t")),
            other => (other, 0, None),
        };

        let mut down = json!({
            "type": "rawKeyDown",
            "key": key,
            "code": code,
            "windowsVirtualKeyCode": vk,
            "nativeVirtualKeyCode": vk,
        });
        if let Some(text) = text {
            down["type"] = json!("keyDown");
            down["text"] = json!(text);
            down["unmodifiedText"] = json!(text);
        }

        self.transport
            .send_command(target.clone(), "Input.dispatchKeyEvent", down)
            .await?;
        self.transport
            .send_command(
                target,
                "Input.dispatchKeyEvent",
                json!({
                    "type": "keyUp",
                    "key": key,
                    "code": code,
                    "windowsVirtualKeyCode": vk,
                    "nativeVirtualKeyCode": vk,
                }),
            )
            .await?;
        Ok(())
    }

    async fn read_text(&self, selector: &str) -> Result<String, BridgeError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); \
             return el ? el.innerText : null; }})()",
            sel = js_string(selector)
        );
        match self.eval_raw(&expr).await? {
            Value::String(text) => Ok(text),
            Value::Null => Err(BridgeError::new(BridgeErrorKind::TargetNotFound)
                .with_hint(format!("no element for {selector}"))),
            other => Err(BridgeError::new(BridgeErrorKind::Internal)
                .with_hint(format!("innerText returned non-string: {other}"))),
        }
    }

    async fn query_visible(&self, selector: &str) -> Result<bool, BridgeError> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({sel}); \
             if (!el) return false; const r = el.getBoundingClientRect(); \
             return r.width > 0 && r.height > 0; }})()",
            sel = js_string(selector)
        );
        Ok(self.eval_raw(&expr).await?.as_bool().unwrap_or(false))
    }

    async fn set_input_files(&self, selector: &str, paths: &[String]) -> Result<(), BridgeError> {
        let target = self.session_target().await?;

        let doc = self
            .transport
            .send_command(target.clone(), "DOM.getDocument", json!({ "depth": 0 }))
            .await?;
        let root_id = doc
            .get("root")
            .and_then(|r| r.get("nodeId"))
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                BridgeError::new(BridgeErrorKind::Internal)
                    .with_hint("DOM.getDocument returned no root nodeId")
            })?;

        let node = self
            .transport
            .send_command(
                target.clone(),
                "DOM.querySelector",
                json!({ "nodeId": root_id, "selector": selector }),
            )
            .await?;
        let node_id = node.get("nodeId").and_then(Value::as_i64).unwrap_or(0);
        if node_id == 0 {
            return Err(BridgeError::new(BridgeErrorKind::TargetNotFound)
                .with_hint(format!("no file input for {selector}")));
        }

        self.transport
            .send_command(
                target,
                "DOM.setFileInputFiles",
                json!({ "nodeId": node_id, "files": paths }),
            )
            .await?;
        Ok(())
    }

    async fn fetch_as_data_url(&self, url: &str) -> Result<String, BridgeError> {
        let expr = format!(
            "(async () => {{ \
               const resp = await fetch({url}); \
               if (!resp.ok) throw new Error('fetch failed: ' + resp.status); \
               const blob = await resp.blob(); \
               return await new Promise((resolve, reject) => {{ \
                 const reader = new FileReader(); \
                 reader.onloadend = () => resolve(reader.result); \
                 reader.onerror = () => reject(reader.error); \
                 reader.readAsDataURL(blob); \
               }}); \
             }})()",
            url = js_string(url)
        );
        match self.eval_raw(&expr).await? {
            Value::String(data_url) if data_url.starts_with("data:") => Ok(data_url),
            other => Err(BridgeError::new(BridgeErrorKind::Internal)
                .with_hint(format!("in-page fetch returned unexpected value: {other}"))),
        }
    }

    async fn current_url(&self) -> Result<String, BridgeError> {
        match self.eval_raw("window.location.href").await? {
            Value::String(url) => Ok(url),
            other => Err(BridgeError::new(BridgeErrorKind::Internal)
                .with_hint(format!("location.href returned non-string: {other}"))),
        }
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.bus.subscribe()
    }

    async fn close(&self) -> Result<(), BridgeError> {
        self.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NoopTransport;

    #[test]
    fn js_string_escapes_quotes_and_newlines() {
        assert_eq!(js_string("a\"b"), r#""a\"b""#);
        assert_eq!(js_string("line1\nline2"), r#""line1\nline2""#);
    }

    #[tokio::test]
    async fn operations_fail_before_start() {
        let bridge = CdpBridge::new(BridgeConfig::default(), Arc::new(NoopTransport));
        let err = bridge.current_url().await.unwrap_err();
        assert_eq!(err.kind, BridgeErrorKind::Internal);
    }

    #[test]
    fn republish_filters_subframe_navigations() {
        let (bus, mut rx) = broadcast::channel(8);
        CdpBridge::republish(
            &bus,
            TransportEvent {
                method: "Page.frameNavigated".into(),
                params: json!({ "frame": { "parentId": "f1", "url": "https://x/sub" } }),
                session_id: None,
            },
        );
        assert!(rx.try_recv().is_err());

        CdpBridge::republish(
            &bus,
            TransportEvent {
                method: "Page.frameNavigated".into(),
                params: json!({ "frame": { "url": "https://x/main" } }),
                session_id: None,
            },
        );
        match rx.try_recv().unwrap() {
            PageEvent::Navigated { url } => assert_eq!(url, "https://x/main"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
