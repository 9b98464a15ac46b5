use crate::LogicalElement;
use std::collections::HashMap;

/// Fallback chains for a particular chat site's markup.
///
/// Each chain is ordered most-specific-first; when the site ships a UI
/// change, this is the only place that needs editing.
#[derive(Clone, Debug, Default)]
pub struct SelectorSet {
    chains: HashMap<LogicalElement, Vec<String>>,
}

impl SelectorSet {
    /// Chains for chatgpt.com as of mid-2025.
    pub fn chatgpt() -> Self {
        let mut set = Self::default();

        set.register(
            LogicalElement::ChatInput,
            &[
                "#prompt-textarea",
                "div[contenteditable='true'][id='prompt-textarea']",
                "div[contenteditable='true']",
            ],
        );
        set.register(
            LogicalElement::SendButton,
            &[
                "button[data-testid='send-button']",
                "button[aria-label='Send prompt']",
                "#prompt-textarea ~ button",
            ],
        );
        set.register(
            LogicalElement::AssistantMessage,
            &[
                "div[data-message-author-role='assistant']",
                "[data-message-author-role='assistant']",
                "div.agent-turn",
            ],
        );
        set.register(
            LogicalElement::AssistantMarkdown,
            &[
                "div[data-message-author-role='assistant'] .markdown",
                "div[data-message-author-role='assistant'] .prose",
                "div.agent-turn .markdown",
            ],
        );
        set.register(
            LogicalElement::StopButton,
            &[
                "button[aria-label='Stop generating']",
                "button[data-testid='stop-button']",
                "button.stop-button",
            ],
        );
        // The copy button only renders once a turn has fully finished
        // generating, which makes it the most reliable completion signal.
        set.register(
            LogicalElement::CopyButton,
            &[
                "button[data-testid='copy-turn-action-button']",
                "button[aria-label='Copy']",
            ],
        );
        set.register(
            LogicalElement::NewChatButton,
            &[
                "a[data-testid='create-new-chat-button']",
                "nav a[href='/']",
                "a[href='/']",
            ],
        );
        set.register(
            LogicalElement::SidebarThreadLink,
            &["nav a[href^='/c/']", "a[href^='/c/']"],
        );
        set.register(
            LogicalElement::LoginIndicator,
            &[
                "button[data-testid='login-button']",
                "[data-testid='login-button']",
            ],
        );
        set.register(
            LogicalElement::FileUploadInput,
            &[
                "input[type='file']",
                "input[data-testid='file-upload']",
                "input[accept*='image']",
                "input[accept*='application']",
            ],
        );
        set.register(
            LogicalElement::AttachButton,
            &[
                "button[aria-label='Attach files']",
                "button[data-testid='upload-button']",
                "button[aria-label='Upload file']",
            ],
        );

        set
    }

    pub fn register(&mut self, element: LogicalElement, selectors: &[&str]) {
        self.chains.insert(
            element,
            selectors.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn chain(&self, element: LogicalElement) -> Option<&[String]> {
        self.chains.get(&element).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chatgpt_set_covers_every_element() {
        let set = SelectorSet::chatgpt();
        for element in [
            LogicalElement::ChatInput,
            LogicalElement::SendButton,
            LogicalElement::AssistantMessage,
            LogicalElement::AssistantMarkdown,
            LogicalElement::StopButton,
            LogicalElement::CopyButton,
            LogicalElement::NewChatButton,
            LogicalElement::SidebarThreadLink,
            LogicalElement::LoginIndicator,
            LogicalElement::FileUploadInput,
            LogicalElement::AttachButton,
        ] {
            let chain = set.chain(element).unwrap_or_else(|| {
                panic!("missing chain for {element}");
            });
            assert!(!chain.is_empty());
        }
    }

    #[test]
    fn registering_replaces_existing_chain() {
        let mut set = SelectorSet::chatgpt();
        set.register(LogicalElement::ChatInput, &["#custom-input"]);
        assert_eq!(
            set.chain(LogicalElement::ChatInput).unwrap(),
            &["#custom-input".to_string()]
        );
    }
}
