use std::sync::Arc;

use crate::config::RelayConfig;
use crate::driver::ConversationDriver;

#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<ConversationDriver>,
    pub cfg: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(driver: Arc<ConversationDriver>, cfg: RelayConfig) -> Self {
        Self {
            driver,
            cfg: Arc::new(cfg),
        }
    }
}
