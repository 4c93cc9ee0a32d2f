//! Shared application state

use std::sync::Arc;

use huddle_coordination::Coordinator;

use crate::config::Config;

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(coordinator: Coordinator, config: Config) -> Self {
        Self {
            coordinator,
            config: Arc::new(config),
        }
    }
}
