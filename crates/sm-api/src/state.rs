use std::sync::Arc;

use crate::config::AppConfig;
use crate::service::ServerService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ServerService>,
    pub config: AppConfig,
}
