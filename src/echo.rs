//! Echo recovery: the chat page occasionally renders the injected
//! `[System instruction: ...]` block inside the assistant turn while the
//! real reply is still streaming in. Detection waits a short grace period
//! and re-extracts; if the marker persists, the block is stripped.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::models::EchoStatus;
use crate::toolcall::SYSTEM_PREFIX;

pub struct EchoRecovery {
    grace: Duration,
}

impl Default for EchoRecovery {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(3),
        }
    }
}

impl EchoRecovery {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Resolve extracted reply text. `re_extract` is invoked at most once,
    /// after the grace period, and may return `None` when the second read
    /// fails. The returned text never contains the instruction marker.
    pub async fn recover<F, Fut>(&self, text: String, re_extract: F) -> (String, EchoStatus)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        if !text.contains(SYSTEM_PREFIX) {
            return (text, EchoStatus::Clean);
        }

        debug!(target: "echo", grace_ms = self.grace.as_millis() as u64, "instruction echo detected, re-extracting");
        tokio::time::sleep(self.grace).await;

        if let Some(fresh) = re_extract().await {
            if !fresh.contains(SYSTEM_PREFIX) && !fresh.trim().is_empty() {
                return (fresh, EchoStatus::Recovered);
            }
            // The second read echoed too; strip whichever is longer.
            let candidate = if fresh.len() > text.len() { fresh } else { text };
            warn!(target: "echo", "instruction echo persisted, stripping marker block");
            return (strip_through_marker(&candidate), EchoStatus::Stripped);
        }

        warn!(target: "echo", "re-extract failed, stripping marker block from first read");
        (strip_through_marker(&text), EchoStatus::Stripped)
    }
}

/// Remove everything up to and including the echoed instruction block. The
/// block ends at the first `]` followed by a blank line after the marker,
/// or at the first `]` when no blank line follows.
fn strip_through_marker(text: &str) -> String {
    let Some(at) = text.rfind(SYSTEM_PREFIX) else {
        return text.trim().to_string();
    };
    let tail = &text[at..];
    let after = if let Some(end) = tail.find("]\n\n") {
        &tail[end + 3..]
    } else if let Some(end) = tail.find(']') {
        &tail[end + 1..]
    } else {
        ""
    };
    // Keep anything that preceded the echo as well.
    let head = text[..at].trim();
    if head.is_empty() {
        after.trim().to_string()
    } else if after.trim().is_empty() {
        head.to_string()
    } else {
        format!("{head}\n\n{}", after.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clean_text_passes_through() {
        let recovery = EchoRecovery::new(Duration::from_millis(1));
        let (text, status) = recovery
            .recover("Hello there.".into(), || async { None })
            .await;
        assert_eq!(text, "Hello there.");
        assert_eq!(status, EchoStatus::Clean);
    }

    #[tokio::test]
    async fn recovers_when_second_read_is_clean() {
        let recovery = EchoRecovery::new(Duration::from_millis(1));
        let echoed = "[System instruction: Be brief.]\n\nstreaming...".to_string();
        let (text, status) = recovery
            .recover(echoed, || async { Some("The real reply.".to_string()) })
            .await;
        assert_eq!(text, "The real reply.");
        assert_eq!(status, EchoStatus::Recovered);
    }

    #[tokio::test]
    async fn strips_when_echo_persists() {
        let recovery = EchoRecovery::new(Duration::from_millis(1));
        let echoed = "[System instruction: Be brief.]\n\nShort answer.".to_string();
        let persisted = echoed.clone();
        let (text, status) = recovery
            .recover(echoed, move || async move { Some(persisted) })
            .await;
        assert_eq!(text, "Short answer.");
        assert_eq!(status, EchoStatus::Stripped);
    }

    #[tokio::test]
    async fn never_returns_marker_text() {
        let recovery = EchoRecovery::new(Duration::from_millis(1));
        let echoed = "preamble [System instruction: nested [brackets]] reply".to_string();
        let (text, status) = recovery.recover(echoed, || async { None }).await;
        assert!(!text.contains(SYSTEM_PREFIX));
        assert_eq!(status, EchoStatus::Stripped);
    }

    #[test]
    fn strip_handles_marker_without_closing_bracket() {
        let out = strip_through_marker("[System instruction: never closed");
        assert!(out.is_empty());
    }

    #[test]
    fn strip_keeps_text_before_the_echo() {
        let out = strip_through_marker("Real start. [System instruction: x]\n\ntail");
        assert_eq!(out, "Real start.\n\ntail");
    }
}
