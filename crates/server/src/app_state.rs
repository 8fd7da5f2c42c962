use std::sync::Arc;

use server_api::{ApiContext, DeliveryConfig};
use tokio::sync::Semaphore;

pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) delivery: DeliveryConfig,
    /// One permit per concurrently served receive stream.
    pub(crate) stream_slots: Arc<Semaphore>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext, delivery: DeliveryConfig, max_active_streams: usize) -> Self {
        Self {
            api,
            delivery,
            stream_slots: Arc::new(Semaphore::new(max_active_streams.max(1))),
        }
    }
}
