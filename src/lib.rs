pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod domain;
pub mod group;
pub mod optimizer;
#[cfg(feature = "sim")]
pub mod simulation;
pub mod telemetry;
pub mod timer;
