//! # Microgrid Simulation
//!
//! Stand-ins for the devices and processes around the coordinator:
//!
//! - **Load**: building and EV readings with a daily shape and per-replica noise
//! - **Battery**: shared storage whose state of charge follows actuations
//! - **Microgrid**: replica groups, the coordinator and the channels between them

pub mod battery;
pub mod load;
pub mod microgrid;

pub use battery::BatterySimulator;
pub use load::LoadSimulator;
pub use microgrid::{Microgrid, COORDINATOR_GROUP, COORDINATOR_ID};
