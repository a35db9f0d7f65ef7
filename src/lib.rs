pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod services;

pub use config::Config;
pub use error::{EngineError, Result};
pub use services::PositionManager;
