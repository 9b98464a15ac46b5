//! Turn orchestration: everything between "caller wants a completion" and
//! "the page produced one" happens here, strictly one turn at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cdp_bridge::PageDriver;
use chatrelay_selectors::{LogicalElement, SelectorResolver};

use crate::config::{BusyPolicy, RelayConfig};
use crate::detector::{CompletionDetector, DetectorConfig, LAST_TURN_TEXT_JS};
use crate::echo::EchoRecovery;
use crate::errors::{RelayError, RelayResult};
use crate::images::ImageExtractor;
use crate::models::{
    ChatResponse, EchoStatus, LoginState, Role, SessionStatus, Thread, ToolSpec, TranscriptTurn,
};
use crate::session::SessionManager;
use crate::toolcall::{flatten_transcript, ToolCallCodec};
use crate::upload::{AttachmentSource, UploadPipeline};

/// Everything one completion request carries after the API layer has
/// unpacked it.
pub struct TurnRequest {
    pub turns: Vec<TranscriptTurn>,
    pub attachments: Vec<AttachmentSource>,
    pub tools: Vec<ToolSpec>,
    /// Continue an existing conversation instead of the current page.
    pub thread_id: Option<String>,
}

const SIDEBAR_THREADS_JS: &str = r#"(() => {
  const out = [];
  document.querySelectorAll("nav a[href^='/c/']").forEach((a) => {
    const href = a.getAttribute('href') || '';
    const title = (a.innerText || '').trim().split('\n')[0];
    if (href && !out.some((t) => t.href === href)) out.push({ href, title });
  });
  return out;
})()"#;

pub struct ConversationDriver {
    cfg: RelayConfig,
    driver: Arc<dyn PageDriver>,
    resolver: Arc<SelectorResolver>,
    session: Arc<SessionManager>,
    detector: CompletionDetector,
    uploads: UploadPipeline,
    images: ImageExtractor,
    echo: EchoRecovery,
    /// Serializes turns; the page can only stream one reply at a time.
    gate: Mutex<()>,
    busy: AtomicBool,
}

impl ConversationDriver {
    pub fn new(
        cfg: RelayConfig,
        driver: Arc<dyn PageDriver>,
        resolver: Arc<SelectorResolver>,
        session: Arc<SessionManager>,
    ) -> Self {
        let detector = CompletionDetector::new(
            driver.clone(),
            resolver.clone(),
            DetectorConfig::from_relay(&cfg),
        );
        let uploads = UploadPipeline::new(&cfg);
        let images = ImageExtractor::new(driver.clone(), cfg.images_dir.clone());
        Self {
            cfg,
            driver,
            resolver,
            session,
            detector,
            uploads,
            images,
            echo: EchoRecovery::default(),
            gate: Mutex::new(()),
            busy: AtomicBool::new(false),
        }
    }

    /// Run one full turn. Entry is serialized: with the `queue` policy
    /// callers wait their turn, with `reject` they get a busy error.
    pub async fn send_message(&self, request: TurnRequest) -> RelayResult<ChatResponse> {
        let _permit = match self.cfg.busy_policy {
            BusyPolicy::Queue => self.gate.lock().await,
            BusyPolicy::Reject => self.gate.try_lock().map_err(|_| RelayError::Busy)?,
        };

        self.busy.store(true, Ordering::SeqCst);
        let result = self.run_turn(request).await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn run_turn(&self, request: TurnRequest) -> RelayResult<ChatResponse> {
        if self.session.login_state().await == LoginState::LoggedOut {
            return Err(RelayError::NotAuthenticated);
        }

        let selector_deadline = Duration::from_millis(self.cfg.selector_timeout_ms);

        if let Some(thread_id) = &request.thread_id {
            self.navigate_to_thread(thread_id).await?;
        }

        // Pre-sample before touching the page so completion is judged
        // against what this turn adds, not against history.
        let expected = self.detector.count_assistant_turns().await + 1;
        let pre_copy = self.detector.count_copy_buttons().await;

        let staged = self.uploads.stage(&request.attachments).await;
        self.uploads
            .attach(self.driver.as_ref(), &self.resolver, &staged.staged)
            .await?;

        let prompt = self.build_prompt(&request);
        let codec = ToolCallCodec::new(request.tools);

        let input = self
            .resolver
            .resolve(
                self.driver.as_ref(),
                LogicalElement::ChatInput,
                selector_deadline,
            )
            .await?;
        self.driver.insert_text(&input, &prompt).await?;

        self.submit(selector_deadline).await?;
        debug!(target: "driver", expected, pre_copy, "turn submitted");

        let outcome = self.detector.wait_for_completion(expected, pre_copy).await?;

        // Brief settle so late DOM mutations (copy buttons, image chrome)
        // land before extraction.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let images = self.images.extract().await;
        let raw_text = if images.is_empty() {
            self.extract_text().await
        } else {
            self.images.image_turn_text().await
        };

        let re_extract_driver = self.driver.clone();
        let (message, echo) = self
            .echo
            .recover(raw_text, move || async move {
                match re_extract_driver.evaluate(LAST_TURN_TEXT_JS).await {
                    Ok(Value::String(text)) => Some(text),
                    _ => None,
                }
            })
            .await;
        if echo != EchoStatus::Clean {
            warn!(target: "driver", ?echo, "instruction echo handled");
        }

        let tool_calls = codec.decode(&message);
        let thread_id = self.current_thread_id().await.unwrap_or_default();

        info!(
            target: "driver",
            signal = ?outcome.signal,
            elapsed_ms = outcome.elapsed_ms,
            images = images.len(),
            tool_calls = tool_calls.len(),
            "turn finished"
        );
        Ok(ChatResponse {
            message,
            thread_id,
            elapsed_ms: outcome.elapsed_ms,
            signal: outcome.signal,
            images,
            tool_calls,
            failed_attachments: staged.failures,
            echo,
        })
    }

    fn build_prompt(&self, request: &TurnRequest) -> String {
        let mut turns = request.turns.clone();
        if !request.tools.is_empty() {
            let codec = ToolCallCodec::new(request.tools.clone());
            turns.insert(0, TranscriptTurn::text(Role::System, codec.instruction_block()));
        }
        flatten_transcript(&turns)
    }

    /// Click the send button, falling back to a raw Enter press when the
    /// button is missing or disabled-looking.
    async fn submit(&self, deadline: Duration) -> RelayResult<()> {
        match self
            .resolver
            .resolve_now(self.driver.as_ref(), LogicalElement::SendButton)
            .await
        {
            Ok(Some(selector)) => {
                if let Err(err) = self.driver.click(&selector, deadline).await {
                    debug!(target: "driver", %err, "send click failed, pressing Enter");
                    self.driver.press_key("Enter").await?;
                }
            }
            _ => self.driver.press_key("Enter").await?,
        }
        Ok(())
    }

    async fn extract_text(&self) -> String {
        let text = self.detector.last_turn_text().await;
        if !text.trim().is_empty() {
            return text;
        }
        // Coarser fallbacks through the locator chain: markdown body first,
        // then the whole message container.
        for element in [
            LogicalElement::AssistantMarkdown,
            LogicalElement::AssistantMessage,
        ] {
            if let Ok(Some(selector)) = self
                .resolver
                .resolve_now(self.driver.as_ref(), element)
                .await
            {
                if let Ok(text) = self.driver.read_text(&selector).await {
                    if !text.trim().is_empty() {
                        return text;
                    }
                }
            }
        }
        String::new()
    }

    async fn navigate_to_thread(&self, thread_id: &str) -> RelayResult<()> {
        if self.current_thread_id().await.as_deref() == Some(thread_id) {
            return Ok(());
        }
        let url = format!(
            "{}/c/{thread_id}",
            self.cfg.target_url.trim_end_matches('/')
        );
        let deadline = Duration::from_millis(self.cfg.nav_timeout_ms);
        self.driver.navigate(&url, deadline).await?;
        self.resolver
            .resolve(
                self.driver.as_ref(),
                LogicalElement::ChatInput,
                Duration::from_millis(self.cfg.selector_timeout_ms),
            )
            .await?;
        Ok(())
    }

    /// Open a fresh conversation and run the request as its first turn.
    /// Entry is serialized under the same gate as `send_message`.
    pub async fn new_chat(&self, mut request: TurnRequest) -> RelayResult<ChatResponse> {
        let _permit = match self.cfg.busy_policy {
            BusyPolicy::Queue => self.gate.lock().await,
            BusyPolicy::Reject => self.gate.try_lock().map_err(|_| RelayError::Busy)?,
        };

        self.busy.store(true, Ordering::SeqCst);
        // Any carried thread id would re-open the old conversation.
        request.thread_id = None;
        let result = async {
            self.open_fresh_chat().await?;
            self.run_turn(request).await
        }
        .await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    /// Leave the current conversation: click the sidebar new-chat control
    /// when it is present, otherwise navigate back to the site root.
    async fn open_fresh_chat(&self) -> RelayResult<()> {
        let nav_deadline = Duration::from_millis(self.cfg.nav_timeout_ms);
        match self
            .resolver
            .resolve_now(self.driver.as_ref(), LogicalElement::NewChatButton)
            .await
        {
            Ok(Some(selector)) => {
                if let Err(err) = self.driver.click(&selector, nav_deadline).await {
                    debug!(target: "driver", %err, "new-chat click failed, navigating home");
                    self.driver.navigate(&self.cfg.target_url, nav_deadline).await?;
                }
            }
            _ => {
                self.driver
                    .navigate(&self.cfg.target_url, nav_deadline)
                    .await?;
            }
        }
        self.resolver
            .resolve(
                self.driver.as_ref(),
                LogicalElement::ChatInput,
                Duration::from_millis(self.cfg.selector_timeout_ms),
            )
            .await?;
        info!(target: "driver", "fresh conversation ready");
        Ok(())
    }

    /// Scrape the sidebar for known conversations.
    pub async fn list_threads(&self) -> RelayResult<Vec<Thread>> {
        let value = self.driver.evaluate(SIDEBAR_THREADS_JS).await?;
        let entries: Vec<(String, String)> = match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|item| {
                    let href = item.get("href")?.as_str()?.to_string();
                    let title = item
                        .get("title")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Some((href, title))
                })
                .collect(),
            _ => Vec::new(),
        };

        let base = self.cfg.target_url.trim_end_matches('/');
        Ok(entries
            .into_iter()
            .filter_map(|(href, title)| {
                let id = parse_thread_id(&href)?;
                Some(Thread {
                    url: format!("{base}{href}"),
                    id,
                    title,
                    last_active: None,
                })
            })
            .collect())
    }

    pub async fn status(&self) -> SessionStatus {
        let login_state = self.session.login_state().await;
        SessionStatus {
            logged_in: login_state == LoginState::LoggedIn,
            login_state,
            current_thread_id: self.current_thread_id().await,
            busy: self.busy.load(Ordering::SeqCst),
        }
    }

    async fn current_thread_id(&self) -> Option<String> {
        let url = self.driver.current_url().await.ok()?;
        parse_thread_id(&url)
    }
}

/// Extract the conversation id from a `/c/<id>` URL or path.
fn parse_thread_id(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/c/")?;
    let id: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    (!id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thread_ids_from_urls_and_paths() {
        assert_eq!(
            parse_thread_id("https://chatgpt.com/c/abc-123?model=x"),
            Some("abc-123".to_string())
        );
        assert_eq!(parse_thread_id("/c/0a1b2c"), Some("0a1b2c".to_string()));
        assert_eq!(parse_thread_id("https://chatgpt.com/"), None);
        assert_eq!(parse_thread_id("https://chatgpt.com/c/"), None);
    }
}
