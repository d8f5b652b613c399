//! Configuration management for the netlab daemon
//!
//! The loaded configuration is shared through an [`ArcSwap`] so every
//! component reads one consistent snapshot without locking.

mod defaults;
mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::*;

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Global configuration handle
pub type ConfigHandle = Arc<ArcSwap<AppConfig>>;

/// Create a config handle around an already loaded configuration
pub fn config_handle(config: AppConfig) -> ConfigHandle {
    Arc::new(ArcSwap::from_pointee(config))
}
