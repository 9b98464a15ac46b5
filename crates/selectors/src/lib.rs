//! Logical UI elements and their CSS fallback chains.
//!
//! The hosted chat UI changes markup without notice, so nothing outside this
//! crate hard-codes a CSS selector. Callers name a [`LogicalElement`]; the
//! [`SelectorResolver`] walks that element's fallback chain in order and
//! returns the first selector that currently matches a visible node.

use serde::{Deserialize, Serialize};
use std::fmt;

mod error;
mod resolver;
mod set;

pub use error::LocatorError;
pub use resolver::SelectorResolver;
pub use set::SelectorSet;

/// Every UI element the relay interacts with, named by role rather than
/// by markup.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum LogicalElement {
    ChatInput,
    SendButton,
    AssistantMessage,
    AssistantMarkdown,
    StopButton,
    CopyButton,
    NewChatButton,
    SidebarThreadLink,
    LoginIndicator,
    FileUploadInput,
    AttachButton,
}

impl LogicalElement {
    pub fn name(&self) -> &'static str {
        match self {
            LogicalElement::ChatInput => "chat input",
            LogicalElement::SendButton => "send button",
            LogicalElement::AssistantMessage => "assistant message",
            LogicalElement::AssistantMarkdown => "assistant markdown body",
            LogicalElement::StopButton => "stop button",
            LogicalElement::CopyButton => "copy button",
            LogicalElement::NewChatButton => "new chat button",
            LogicalElement::SidebarThreadLink => "sidebar thread link",
            LogicalElement::LoginIndicator => "login indicator",
            LogicalElement::FileUploadInput => "file upload input",
            LogicalElement::AttachButton => "attach button",
        }
    }
}

impl fmt::Display for LogicalElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
