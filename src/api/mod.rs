pub mod handlers;
pub mod routes;

pub use routes::*;

use crate::service::ServiceView;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: ServiceView,
}

impl AppState {
    pub fn new(service: ServiceView) -> Self {
        Self { service }
    }
}
