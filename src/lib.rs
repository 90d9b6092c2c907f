pub mod config;
pub mod error;
pub mod events;
pub mod http;

pub use config::AppConfig;
pub use error::{AppError, Result};
