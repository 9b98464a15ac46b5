//! Completion detection for an in-flight assistant turn.
//!
//! The page gives no single reliable "done" event, so independent signal
//! watchers run concurrently and the first to fire wins:
//!
//! 1. copy button - a new per-turn copy button appears once a turn is final
//! 2. stop button lifecycle - the stop control appears while streaming and
//!    disappears when the turn ends
//! 3. text stability - the last turn's text stops changing across several
//!    spaced samples
//! 4. generated image - image turns render no copy button and little text,
//!    so image arrival (plus a short settle) counts as completion
//!
//! Every signal is gated on the assistant-turn count reaching the expected
//! value, so a stale pre-existing turn can never satisfy a new request.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cdp_bridge::PageDriver;
use chatrelay_selectors::{LogicalElement, SelectorResolver};

use crate::config::RelayConfig;
use crate::errors::{RelayError, RelayResult};

/// Which watcher ended the wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    CopyButton,
    GeneratedImage,
    StopButton,
    TextStability,
}

#[derive(Clone, Copy, Debug)]
pub struct DetectorOutcome {
    pub signal: CompletionSignal,
    pub elapsed_ms: u64,
    /// Assistant-turn count at the moment the signal fired.
    pub observed: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct DetectorConfig {
    pub response_timeout: Duration,
    pub poll_interval: Duration,
    pub stability_samples: u32,
    pub stability_spacing: Duration,
    /// Window in which the stop button must appear before that watcher
    /// gives up (a fast reply can finish before it ever renders).
    pub stop_appear_window: Duration,
    /// Extra settle after an image is first seen, so partially rendered
    /// images are not reported complete.
    pub image_settle: Duration,
}

impl DetectorConfig {
    pub fn from_relay(cfg: &RelayConfig) -> Self {
        Self {
            response_timeout: Duration::from_millis(cfg.response_timeout_ms),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            stability_samples: cfg.stability_samples.max(2),
            stability_spacing: Duration::from_millis(cfg.stability_spacing_ms),
            stop_appear_window: Duration::from_secs(15),
            image_settle: Duration::from_secs(2),
        }
    }
}

/// Counts assistant turns as the union of role-attributed messages and
/// agent-turn containers, deduplicated by their enclosing `article` so a
/// turn matched by both selectors counts once.
const COUNT_TURNS_JS: &str = r#"(() => {
  const seen = new Set();
  const add = (el) => {
    let node = el;
    for (let i = 0; i < 15 && node; i++) {
      if (node.tagName === 'ARTICLE') { seen.add(node); return; }
      node = node.parentElement;
    }
    seen.add(el);
  };
  document.querySelectorAll('[data-message-author-role="assistant"]').forEach(add);
  document.querySelectorAll('.agent-turn').forEach(add);
  return seen.size;
})()"#;

const COUNT_COPY_BUTTONS_JS: &str = r#"(() => {
  const sels = [
    'button[data-testid="copy-turn-action-button"]',
    'button[aria-label="Copy"]',
  ];
  let best = 0;
  for (const s of sels) best = Math.max(best, document.querySelectorAll(s).length);
  return best;
})()"#;

const IMAGE_IN_LAST_TURN_JS: &str = r#"(() => {
  const articles = document.querySelectorAll('article');
  if (!articles.length) return false;
  const last = articles[articles.length - 1];
  if (last.querySelector('img[alt="Generated image"]')) return true;
  if (last.querySelector('div[id^="image-"] img')) return true;
  for (const img of last.querySelectorAll('img')) {
    if (img.src && img.src.includes('backend-api/estuary') && img.naturalWidth > 256) return true;
  }
  return false;
})()"#;

/// Last assistant turn's text, falling back through progressively coarser
/// containers.
pub(crate) const LAST_TURN_TEXT_JS: &str = r#"(() => {
  const pick = (sel) => {
    const nodes = document.querySelectorAll(sel);
    return nodes.length ? nodes[nodes.length - 1] : null;
  };
  const el = pick('[data-message-author-role="assistant"] .markdown')
    || pick('[data-message-author-role="assistant"]')
    || pick('.agent-turn')
    || pick('article');
  return el ? el.innerText : '';
})()"#;

pub struct CompletionDetector {
    driver: Arc<dyn PageDriver>,
    resolver: Arc<SelectorResolver>,
    cfg: DetectorConfig,
}

impl CompletionDetector {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        resolver: Arc<SelectorResolver>,
        cfg: DetectorConfig,
    ) -> Self {
        Self {
            driver,
            resolver,
            cfg,
        }
    }

    /// Best-effort assistant-turn count; evaluate failures read as zero so
    /// pre-sampling before a send never aborts the turn.
    pub async fn count_assistant_turns(&self) -> u64 {
        eval_u64(self.driver.as_ref(), COUNT_TURNS_JS).await
    }

    pub async fn count_copy_buttons(&self) -> u64 {
        eval_u64(self.driver.as_ref(), COUNT_COPY_BUTTONS_JS).await
    }

    pub async fn last_turn_text(&self) -> String {
        match self.driver.evaluate(LAST_TURN_TEXT_JS).await {
            Ok(Value::String(text)) => text,
            _ => String::new(),
        }
    }

    /// Block until one completion signal fires or the outer timeout lapses.
    /// All watchers are cancelled as soon as a winner is decided.
    pub async fn wait_for_completion(
        &self,
        expected: u64,
        pre_copy_count: u64,
    ) -> RelayResult<DetectorOutcome> {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<(CompletionSignal, u64)>(4);

        let watchers = vec![
            tokio::spawn(copy_watcher(
                self.driver.clone(),
                self.cfg,
                expected,
                pre_copy_count,
                tx.clone(),
                cancel.clone(),
            )),
            tokio::spawn(image_watcher(
                self.driver.clone(),
                self.cfg,
                expected,
                tx.clone(),
                cancel.clone(),
            )),
            tokio::spawn(stop_watcher(
                self.driver.clone(),
                self.resolver.clone(),
                self.cfg,
                expected,
                tx.clone(),
                cancel.clone(),
            )),
            tokio::spawn(stability_watcher(
                self.driver.clone(),
                self.cfg,
                expected,
                tx,
                cancel.clone(),
            )),
        ];

        let winner = tokio::time::timeout(self.cfg.response_timeout, rx.recv()).await;
        cancel.cancel();
        for task in watchers {
            task.abort();
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match winner {
            Ok(Some((signal, observed))) => {
                info!(target: "detector", ?signal, elapsed_ms, observed, "turn complete");
                Ok(DetectorOutcome {
                    signal,
                    elapsed_ms,
                    observed,
                })
            }
            // Channel closed without a send is only reachable when every
            // watcher exited; treat it like a timeout.
            Ok(None) | Err(_) => {
                let observed = self.count_assistant_turns().await;
                warn!(target: "detector", elapsed_ms, expected, observed, "turn timed out");
                Err(RelayError::ResponseTimeout {
                    elapsed_ms,
                    expected,
                    observed,
                })
            }
        }
    }
}

async fn eval_u64(driver: &dyn PageDriver, js: &str) -> u64 {
    match driver.evaluate(js).await {
        Ok(value) => value.as_u64().unwrap_or(0),
        Err(err) => {
            debug!(target: "detector", %err, "count evaluate failed");
            0
        }
    }
}

async fn eval_bool(driver: &dyn PageDriver, js: &str) -> bool {
    matches!(driver.evaluate(js).await, Ok(Value::Bool(true)))
}

async fn stop_visible(driver: &dyn PageDriver, resolver: &SelectorResolver) -> bool {
    matches!(
        resolver.resolve_now(driver, LogicalElement::StopButton).await,
        Ok(Some(_))
    )
}

async fn copy_watcher(
    driver: Arc<dyn PageDriver>,
    cfg: DetectorConfig,
    expected: u64,
    pre_copy_count: u64,
    tx: mpsc::Sender<(CompletionSignal, u64)>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(cfg.poll_interval) => {}
        }
        let copies = eval_u64(driver.as_ref(), COUNT_COPY_BUTTONS_JS).await;
        if copies > pre_copy_count {
            let turns = eval_u64(driver.as_ref(), COUNT_TURNS_JS).await;
            if turns >= expected {
                let _ = tx.send((CompletionSignal::CopyButton, turns)).await;
                return;
            }
        }
    }
}

async fn image_watcher(
    driver: Arc<dyn PageDriver>,
    cfg: DetectorConfig,
    expected: u64,
    tx: mpsc::Sender<(CompletionSignal, u64)>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(cfg.poll_interval) => {}
        }
        if eval_bool(driver.as_ref(), IMAGE_IN_LAST_TURN_JS).await {
            let turns = eval_u64(driver.as_ref(), COUNT_TURNS_JS).await;
            if turns >= expected {
                debug!(target: "detector", "image detected, settling");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(cfg.image_settle) => {}
                }
                let _ = tx.send((CompletionSignal::GeneratedImage, turns)).await;
                return;
            }
        }
    }
}

/// Waits for the stop control to appear, then for it to disappear. If it
/// never shows within the appearance window this watcher retires quietly
/// and leaves completion to the others.
async fn stop_watcher(
    driver: Arc<dyn PageDriver>,
    resolver: Arc<SelectorResolver>,
    cfg: DetectorConfig,
    expected: u64,
    tx: mpsc::Sender<(CompletionSignal, u64)>,
    cancel: CancellationToken,
) {
    let appear_deadline = Instant::now() + cfg.stop_appear_window;
    loop {
        if stop_visible(driver.as_ref(), &resolver).await {
            break;
        }
        if Instant::now() >= appear_deadline {
            debug!(target: "detector", "stop button never appeared, watcher retiring");
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(cfg.poll_interval) => {}
        }
    }
    debug!(target: "detector", "streaming (stop button visible)");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(cfg.poll_interval) => {}
        }
        if !stop_visible(driver.as_ref(), &resolver).await {
            break;
        }
    }

    loop {
        let turns = eval_u64(driver.as_ref(), COUNT_TURNS_JS).await;
        if turns >= expected {
            let _ = tx.send((CompletionSignal::StopButton, turns)).await;
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(cfg.poll_interval) => {}
        }
    }
}

async fn stability_watcher(
    driver: Arc<dyn PageDriver>,
    cfg: DetectorConfig,
    expected: u64,
    tx: mpsc::Sender<(CompletionSignal, u64)>,
    cancel: CancellationToken,
) {
    let mut previous = String::new();
    let mut streak = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(cfg.stability_spacing) => {}
        }
        let turns = eval_u64(driver.as_ref(), COUNT_TURNS_JS).await;
        if turns < expected {
            streak = 0;
            continue;
        }
        let text = match driver.evaluate(LAST_TURN_TEXT_JS).await {
            Ok(Value::String(text)) => text,
            _ => continue,
        };
        if !text.is_empty() && text == previous {
            streak += 1;
            if streak == 1 {
                debug!(target: "detector", "stabilizing");
            }
            // The first sample plus (samples - 1) confirmations.
            if streak + 1 >= cfg.stability_samples {
                let _ = tx.send((CompletionSignal::TextStability, turns)).await;
                return;
            }
        } else {
            streak = 0;
        }
        previous = text;
    }
}
