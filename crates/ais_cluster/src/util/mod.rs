pub mod cluster_status;
pub mod errors;
pub mod metrics;
pub mod retry;
pub mod settings;
pub mod status;
pub mod telemetry;
