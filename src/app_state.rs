use std::sync::Arc;

use crate::config::AppConfig;
use crate::inflight::InFlightRegistry;
use crate::pipeline::FeedPipeline;
use crate::store::FeedStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: FeedPipeline,
    pub store: Arc<dyn FeedStore>,
    /// Ejecuciones en curso por usuario; sustituye al flag "busy" del cliente.
    pub in_flight: InFlightRegistry,
}
