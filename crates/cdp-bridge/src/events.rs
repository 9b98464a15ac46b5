use serde::{Deserialize, Serialize};

/// Page-level events the bridge republishes to interested layers.
///
/// The stealth layer subscribes to these to re-inject its patches after
/// every top-level navigation and on every new page/tab.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PageEvent {
    /// The main frame finished navigating to `url`.
    Navigated { url: String },
    /// A new page/tab was attached (popup, window.open, ...).
    Opened { target_id: String },
    /// The CDP connection went away; the session is no longer usable.
    ConnectionLost,
}
