use std::sync::Arc;

use clawhub_reconciler::{DriftDetector, Reconciler};
use clawhub_store::StateStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub reconciler: Arc<Reconciler>,
    pub drift: Arc<DriftDetector>,
    pub auth_token: Arc<String>,
}
