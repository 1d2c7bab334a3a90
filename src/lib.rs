pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod worker;
