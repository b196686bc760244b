pub mod dirs;
pub mod engine;
pub mod handlers;
pub mod keygen;
pub mod registry;
pub mod reset;
pub mod server;
pub mod store;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The persistence port — sole source of truth between requests.
    pub store: Arc<dyn store::Persistence>,
    pub keygen: Arc<keygen::KeyGenerator>,
}

pub use engine::{Validation, TRIAL_RESET_PROBE};
pub use server::{read_key_file, resolve_data_dir, resolve_master_key, run, ServerConfig};
