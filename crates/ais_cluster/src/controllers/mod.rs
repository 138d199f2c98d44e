pub mod cluster_controller;
pub mod membership;
pub mod operations;
pub mod plan;
pub mod state_machine;
