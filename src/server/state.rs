use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::service::ConnectionService;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub service: Arc<ConnectionService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let service = Arc::new(ConnectionService::new(settings.connection.clone()));

        Self {
            settings: Arc::new(settings),
            service,
            start_time: Instant::now(),
        }
    }
}
