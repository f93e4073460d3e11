use std::sync::Arc;

use stablebill_core::billing::ActivationOrchestrator;
use stablebill_core::repository::{AccountRepository, WebhookEndpointRepository};

#[derive(Clone)]
pub struct AppState {
    pub activation: Arc<ActivationOrchestrator>,
    pub accounts: Arc<dyn AccountRepository>,
    pub webhook_endpoints: Arc<dyn WebhookEndpointRepository>,
}

impl AppState {
    pub fn new(
        activation: Arc<ActivationOrchestrator>,
        accounts: Arc<dyn AccountRepository>,
        webhook_endpoints: Arc<dyn WebhookEndpointRepository>,
    ) -> Self {
        Self {
            activation,
            accounts,
            webhook_endpoints,
        }
    }
}
