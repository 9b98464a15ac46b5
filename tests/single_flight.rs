//! One turn at a time: concurrent callers must serialize through the
//! conversation driver, and the reject policy must turn latecomers away.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chatrelay::models::{Role, TranscriptTurn};
use chatrelay::{BusyPolicy, RelayConfig, RelayError, TurnRequest};

use common::{conversation_driver, ScriptedChatPage};

fn request(text: &str) -> TurnRequest {
    TurnRequest {
        turns: vec![TranscriptTurn::text(Role::User, text)],
        attachments: Vec::new(),
        tools: Vec::new(),
        thread_id: None,
    }
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        poll_interval_ms: 10,
        stability_spacing_ms: 10,
        selector_timeout_ms: 100,
        response_timeout_ms: 5_000,
        ..RelayConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_run_strictly_sequentially() {
    let page = ScriptedChatPage::new("Reply.");
    let driver = Arc::new(conversation_driver(page.clone(), fast_config()));

    let mut handles = Vec::new();
    for i in 0..4 {
        let driver = driver.clone();
        handles.push(tokio::spawn(async move {
            driver.send_message(request(&format!("msg-{i}"))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(!page.violated.load(Ordering::SeqCst), "turns overlapped");
    assert_eq!(page.completed.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn reject_policy_turns_latecomers_away() {
    let cfg = RelayConfig {
        busy_policy: BusyPolicy::Reject,
        ..fast_config()
    };
    let page = ScriptedChatPage::new("Reply.");
    let driver = Arc::new(conversation_driver(page, cfg));

    let first = {
        let driver = driver.clone();
        tokio::spawn(async move { driver.send_message(request("first")).await })
    };
    // Let the first turn take the gate before the second arrives.
    tokio::task::yield_now().await;

    let second = driver.send_message(request("second")).await;
    assert!(matches!(second, Err(RelayError::Busy)));

    first.await.unwrap().unwrap();
}
