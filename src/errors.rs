//! Relay-level error taxonomy.
//!
//! Per-attachment and per-signal failures are absorbed where they happen;
//! only turn-level and process-level failures travel through this type.

use cdp_bridge::BridgeError;
use chatrelay_selectors::{LocatorError, LogicalElement};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The session is not logged in to the chat site. Operator-actionable,
    /// never retried automatically.
    #[error("session is not authenticated; log in via the browser profile")]
    NotAuthenticated,

    /// Every locator fallback for a logical element was exhausted.
    #[error("element not found: {element}")]
    ElementNotFound { element: LogicalElement },

    /// The completion detector never reached a terminal signal. The
    /// session stays usable; the caller may retry.
    #[error(
        "response timed out after {elapsed_ms}ms (expected {expected} assistant turns, observed {observed})"
    )]
    ResponseTimeout {
        elapsed_ms: u64,
        expected: u64,
        observed: u64,
    },

    /// Browser launch or initial navigation failed after retry exhaustion.
    #[error("session launch failed: {0}")]
    SessionLaunch(String),

    /// A turn is already in flight and the busy policy is `reject`.
    #[error("a turn is already in flight")]
    Busy,

    #[error("browser bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("internal relay error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::NotAuthenticated => 401,
            RelayError::ElementNotFound { .. } => 502,
            RelayError::ResponseTimeout { .. } => 504,
            RelayError::SessionLaunch(_) => 503,
            RelayError::Busy => 429,
            RelayError::Bridge(_) => 502,
            RelayError::Internal(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::ResponseTimeout { .. } | RelayError::Busy => true,
            RelayError::Bridge(err) => err.retriable,
            _ => false,
        }
    }
}

impl From<LocatorError> for RelayError {
    fn from(err: LocatorError) -> Self {
        match err {
            LocatorError::ElementNotFound { element, .. } => {
                RelayError::ElementNotFound { element }
            }
            LocatorError::NoChain(element) => RelayError::ElementNotFound { element },
            LocatorError::Driver(err) => RelayError::Bridge(err),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_bridge::BridgeErrorKind;

    #[test]
    fn locator_exhaustion_keeps_logical_name() {
        let err: RelayError = LocatorError::ElementNotFound {
            element: LogicalElement::ChatInput,
            tried: 3,
        }
        .into();
        assert!(err.to_string().contains("chat input"));
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn timeout_is_retryable_and_504() {
        let err = RelayError::ResponseTimeout {
            elapsed_ms: 120_000,
            expected: 3,
            observed: 2,
        };
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), 504);
    }

    #[test]
    fn bridge_retriability_passes_through() {
        let err = RelayError::Bridge(
            BridgeError::new(BridgeErrorKind::CdpIo).retriable(true),
        );
        assert!(err.is_retryable());
    }
}
