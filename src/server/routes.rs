use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::driver::TurnRequest;
use crate::errors::RelayError;
use crate::models::{ChatResponse, Role, ToolSpec, TranscriptTurn};
use crate::upload::AttachmentSource;

use super::schemas::{
    ApiFunctionCall, ApiMessage, ApiTool, ApiToolCall, ChatCompletionRequest,
    ChatCompletionResponse, Choice, ContentPart, MessageContent, ModelInfo, ModelList,
    ResponseMessage, Usage,
};
use super::state::AppState;

pub const MODEL_ID: &str = "chatrelay-browser";

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/threads", get(list_threads))
        .route("/v1/threads/new", post(new_thread))
        .route("/status", get(status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Bearer-token check on everything except the health probe. A missing
/// configured token disables auth entirely.
async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(token) = &state.cfg.api_token {
        let expected = format!("Bearer {token}");
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return api_error(StatusCode::UNAUTHORIZED, "invalid or missing bearer token");
        }
    }
    next.run(request).await
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.driver.status().await)
}

async fn list_models() -> impl IntoResponse {
    Json(ModelList {
        object: "list",
        data: vec![ModelInfo {
            id: MODEL_ID,
            object: "model",
            created: unix_now(),
            owned_by: "chatrelay",
        }],
    })
}

async fn list_threads(State(state): State<AppState>) -> Response {
    match state.driver.list_threads().await {
        Ok(threads) => Json(json!({ "threads": threads })).into_response(),
        Err(err) => relay_error(err),
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let (model, turn, prompt_chars) = match unpack_request(request) {
        Ok(unpacked) => unpacked,
        Err(response) => return response,
    };
    info!(
        target: "server",
        turns = turn.turns.len(),
        attachments = turn.attachments.len(),
        tools = turn.tools.len(),
        "completion requested"
    );
    match state.driver.send_message(turn).await {
        Ok(response) => Json(shape_response(&model, prompt_chars, response)).into_response(),
        Err(err) => relay_error(err),
    }
}

/// Open a fresh conversation and answer the request as its first turn.
async fn new_thread(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let (model, turn, prompt_chars) = match unpack_request(request) {
        Ok(unpacked) => unpacked,
        Err(response) => return response,
    };
    info!(target: "server", turns = turn.turns.len(), "new thread requested");
    match state.driver.new_chat(turn).await {
        Ok(response) => Json(shape_response(&model, prompt_chars, response)).into_response(),
        Err(err) => relay_error(err),
    }
}

/// Shared validation and conversion for the completion-shaped endpoints.
fn unpack_request(
    request: ChatCompletionRequest,
) -> Result<(String, TurnRequest, usize), Response> {
    if request.stream.unwrap_or(false) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "streaming is not supported; the relay completes whole turns",
        ));
    }
    if request.messages.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "messages must not be empty"));
    }

    let model = request.model.clone().unwrap_or_else(|| MODEL_ID.to_string());
    let turn = convert_request(request)
        .map_err(|reason| api_error(StatusCode::BAD_REQUEST, &reason))?;
    let prompt_chars: usize = turn.turns.iter().map(|t| t.text.len()).sum();
    Ok((model, turn, prompt_chars))
}

/// Unpack the OpenAI request into the relay's turn form, splitting inline
/// attachments out of multi-part content.
fn convert_request(request: ChatCompletionRequest) -> Result<TurnRequest, String> {
    let mut turns = Vec::with_capacity(request.messages.len());
    let mut attachments = Vec::new();

    for message in request.messages {
        turns.push(convert_message(message, &mut attachments)?);
    }

    let tools = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .filter(|t| t.kind == "function")
        .map(|t: ApiTool| ToolSpec {
            name: t.function.name,
            description: t.function.description.unwrap_or_default(),
            parameters: t.function.parameters.unwrap_or_else(|| json!({})),
        })
        .collect();

    Ok(TurnRequest {
        turns,
        attachments,
        tools,
        thread_id: request.thread_id,
    })
}

fn convert_message(
    message: ApiMessage,
    attachments: &mut Vec<AttachmentSource>,
) -> Result<TranscriptTurn, String> {
    let role = match message.role.as_str() {
        "system" | "developer" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        other => return Err(format!("unsupported message role: {other}")),
    };

    let text = match message.content {
        Some(MessageContent::Text(text)) => text,
        Some(MessageContent::Parts(parts)) => {
            let mut pieces = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => pieces.push(text),
                    ContentPart::ImageUrl { image_url } => {
                        attachments.push(AttachmentSource::classify(&image_url.url));
                    }
                    ContentPart::File { file } => {
                        attachments.push(file_attachment(file.file_data, file.filename));
                    }
                }
            }
            pieces.join("\n")
        }
        None => String::new(),
    };

    let tool_calls = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| (call.function.name, call.function.arguments))
        .collect();

    Ok(TranscriptTurn {
        role,
        text,
        tool_call_id: message.tool_call_id,
        tool_calls,
    })
}

fn file_attachment(file_data: String, filename: Option<String>) -> AttachmentSource {
    if file_data.starts_with("data:") {
        AttachmentSource::DataUrl(file_data)
    } else {
        let mime = filename
            .as_deref()
            .and_then(mime_from_filename)
            .unwrap_or("application/octet-stream")
            .to_string();
        AttachmentSource::Base64 {
            data: file_data,
            mime,
            filename,
        }
    }
}

fn mime_from_filename(name: &str) -> Option<&'static str> {
    let ext = name.rsplit('.').next()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "md" => "text/markdown",
        _ => return None,
    })
}

fn shape_response(
    model: &str,
    prompt_chars: usize,
    response: ChatResponse,
) -> ChatCompletionResponse {
    let completion_chars = response.message.len();
    let has_tool_calls = !response.tool_calls.is_empty();

    let tool_calls = has_tool_calls.then(|| {
        response
            .tool_calls
            .iter()
            .map(|call| ApiToolCall {
                id: call.id.clone(),
                kind: "function".to_string(),
                function: ApiFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                },
            })
            .collect()
    });

    let mut content = if has_tool_calls {
        None
    } else {
        Some(response.message)
    };
    // Image turns append saved paths so non-multimodal clients see them.
    if let Some(text) = content.as_mut() {
        for image in &response.images {
            if let Some(path) = &image.local_path {
                text.push_str(&format!("\n[image saved: {}]", path.display()));
            }
        }
    }

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion",
        created: unix_now(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant",
                content,
                tool_calls,
            },
            finish_reason: if has_tool_calls { "tool_calls" } else { "stop" },
        }],
        usage: Usage {
            // Rough estimate; the page exposes no token accounting.
            prompt_tokens: (prompt_chars / 4) as u64,
            completion_tokens: (completion_chars / 4) as u64,
            total_tokens: ((prompt_chars + completion_chars) / 4) as u64,
        },
    }
}

fn relay_error(err: RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(json!({
        "error": {
            "message": err.to_string(),
            "type": "relay_error",
            "retryable": err.is_retryable(),
        }
    }));
    (status, body).into_response()
}

fn api_error(status: StatusCode, message: &str) -> Response {
    let body = Json(json!({
        "error": { "message": message, "type": "invalid_request_error" }
    }));
    (status, body).into_response()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
