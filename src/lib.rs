pub mod api;
pub mod artifacts;
pub mod config;
pub mod content;
pub mod db;
pub mod describer;
pub mod error;
pub mod http;
pub mod intake;
pub mod model;
pub mod notifier;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod retry;
pub mod sheets;
pub mod worker;
