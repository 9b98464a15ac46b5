use crate::LogicalElement;
use cdp_bridge::BridgeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocatorError {
    /// Every fallback in the chain was tried and none matched a visible node.
    #[error("no visible match for {element} after trying {tried} selectors")]
    ElementNotFound {
        element: LogicalElement,
        tried: usize,
    },

    /// No fallback chain is registered for this element.
    #[error("no selectors registered for {0}")]
    NoChain(LogicalElement),

    #[error(transparent)]
    Driver(#[from] BridgeError),
}
