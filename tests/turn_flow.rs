//! End-to-end turn flow against the scripted page: submit, detect
//! completion, extract, and decode.

mod common;

use serde_json::json;

use chatrelay::detector::CompletionSignal;
use chatrelay::models::{EchoStatus, Role, ToolSpec, TranscriptTurn};
use chatrelay::{RelayConfig, TurnRequest};

use common::{conversation_driver, ScriptedChatPage};

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
async fn plain_turn_resolves_with_text() {
    let page = ScriptedChatPage::new("Hi there! How can I help?");
    let driver = conversation_driver(page, fast_config());

    let response = driver
        .send_message(TurnRequest {
            turns: vec![TranscriptTurn::text(Role::User, "Hello!")],
            attachments: Vec::new(),
            tools: Vec::new(),
            thread_id: None,
        })
        .await
        .unwrap();

    assert_eq!(response.message, "Hi there! How can I help?");
    assert_eq!(response.thread_id, "abc-123");
    // The scripted page renders a copy button the moment the turn lands,
    // so that watcher must win the race.
    assert_eq!(response.signal, CompletionSignal::CopyButton);
    assert_eq!(response.echo, EchoStatus::Clean);
    assert!(response.images.is_empty());
    assert!(response.tool_calls.is_empty());
    assert!(response.failed_attachments.is_empty());
}

#[tokio::test(start_paused = true)]
async fn tool_mode_turn_decodes_calls() {
    let page = ScriptedChatPage::new(
        r#"```json
{"tool_calls": [{"name": "add_numbers", "arguments": {"a": 42, "b": 58}}]}
```"#,
    );
    let driver = conversation_driver(page, fast_config());

    let response = driver
        .send_message(TurnRequest {
            turns: vec![TranscriptTurn::text(Role::User, "Add 42 and 58")],
            attachments: Vec::new(),
            tools: vec![ToolSpec {
                name: "add_numbers".into(),
                description: "Add two integers".into(),
                parameters: json!({"type": "object"}),
            }],
            thread_id: None,
        })
        .await
        .unwrap();

    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "add_numbers");
    assert_eq!(response.tool_calls[0].arguments, json!({"a": 42, "b": 58}));
    assert!(response.tool_calls[0].id.starts_with("call_"));
}

#[tokio::test(start_paused = true)]
async fn new_chat_runs_the_first_turn_in_a_fresh_thread() {
    let page = ScriptedChatPage::new("Fresh start.");
    let driver = conversation_driver(page.clone(), fast_config());

    let response = driver
        .new_chat(TurnRequest {
            turns: vec![TranscriptTurn::text(Role::User, "Hello!")],
            attachments: Vec::new(),
            tools: Vec::new(),
            // A stale id must not re-open the old conversation.
            thread_id: Some("stale-999".into()),
        })
        .await
        .unwrap();

    assert_eq!(response.message, "Fresh start.");
    assert_eq!(response.thread_id, "abc-123");
    assert_eq!(page.completed.load(std::sync::atomic::Ordering::SeqCst), 1);
}
