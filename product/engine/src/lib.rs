pub mod cmd;
pub mod config;
mod error;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod output_rules;
pub mod paths;
pub mod runner;
pub mod store;
pub mod thumbnail;

pub use error::{EngineError, Result};
