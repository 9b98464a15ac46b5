//! chatrelay: a synchronous OpenAI-style chat completion API backed by a
//! persistent authenticated browser session against a chat web app.
//!
//! Exposes modules for integration testing.

pub mod config;
pub mod detector;
pub mod driver;
pub mod echo;
pub mod errors;
pub mod images;
pub mod models;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod toolcall;
pub mod upload;

pub use config::{BusyPolicy, RelayConfig};
pub use driver::{ConversationDriver, TurnRequest};
pub use errors::{RelayError, RelayResult};
pub use models::{ChatResponse, SessionStatus, Thread};
pub use session::SessionManager;
