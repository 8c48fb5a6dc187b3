use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{ClientId, LoadKind};

/// Dispatch outbound from the coordinator to a client, serialized as the
/// tuple `(kind, dispatchVector)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchCommand(pub LoadKind, pub Vec<f64>);

impl DispatchCommand {
    pub fn kind(&self) -> LoadKind {
        self.0
    }

    pub fn vector(&self) -> &[f64] {
        &self.1
    }

    /// The immediate-cycle actuation value; the rest of the vector is informational.
    pub fn immediate(&self) -> Option<f64> {
        self.1.first().copied()
    }
}

/// Per-client allocation produced by one completed optimization
pub type DispatchMap = BTreeMap<ClientId, DispatchCommand>;

/// Command a replica hands to its device after a dispatch is accepted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DeviceCommand {
    /// Cap the consumption of a sheddable load
    LimitPower(f64),
    /// Apply charge (positive) or discharge (negative) power to the battery
    UpdateSoc(f64),
}

impl DeviceCommand {
    pub fn power(&self) -> f64 {
        match self {
            DeviceCommand::LimitPower(p) | DeviceCommand::UpdateSoc(p) => *p,
        }
    }
}
