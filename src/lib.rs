pub mod config;
pub mod crawl;
pub mod database_ops;
pub mod enrichment;
pub mod errors;
pub mod normalization;
pub mod orchestrator;
pub mod platforms;
pub mod refresh;
pub mod scheduler;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::{HarvestConfig, RetryPolicy};
pub use errors::HarvestError;
