//! C2-C4: the three request handlers dispatched by C1's router, and the
//! shared context they close over.

pub mod pre_request;
pub mod status;
pub mod upload;

use crate::config::AppConfig;
use crate::metrics::CollectorMetrics;
use crate::session::SessionStore;
use crate::storage::StorageService;
use std::sync::Arc;

/// Everything a handler needs beyond the current request: the session
/// store, the storage service, the validated configuration, and the metrics
/// collectors. Cheap to clone -- every field is itself reference-counted.
#[derive(Clone)]
pub struct Context {
    pub sessions: SessionStore,
    pub storage: StorageService,
    pub config: Arc<AppConfig>,
    pub metrics: CollectorMetrics,
}
