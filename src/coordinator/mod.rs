//! Coordinator: aggregates one approved request per load class and turns it
//! into a dispatch for every client.

pub mod aggregator;
pub mod forecast;
pub mod report;
pub mod requests;
pub mod service;

pub use aggregator::{Coordinator, CoordinatorAction, CoordinatorInput, CoordinatorTimer};
pub use forecast::PurchaseForecast;
pub use report::{BatteryReport, ClientReport, CycleOutcome, CycleReport};
pub use requests::{AggregationError, RequestMap, SubmitOutcome};
pub use service::{CoordinatorOutputs, CoordinatorService};
