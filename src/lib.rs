pub mod config;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod replicator;
pub mod rules;
pub mod snapshot;
pub mod supervisor;
pub mod transaction;

pub mod postgres;
pub mod sink;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::Replicator;
