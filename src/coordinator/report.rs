use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ClientId, DispatchMap, GridSettings, LoadKind, Observation, Timestamp};
use crate::optimizer::SolveStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientReport {
    pub client: ClientId,
    pub kind: LoadKind,
    pub current_power: f64,
    pub predicted: Option<Vec<f64>>,
    pub dispatch: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryReport {
    pub client: ClientId,
    pub initial_soc: f64,
    pub projected_final_soc: f64,
    pub soc_end: f64,
}

/// Record of one completed dispatch cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub id: Uuid,
    pub cycle: u64,
    pub timestamp: Timestamp,
    pub settings: GridSettings,
    pub supply: Vec<f64>,
    pub clients: Vec<ClientReport>,
    pub battery: Option<BatteryReport>,
    /// Total dispatched power per step
    pub aggregate: Vec<f64>,
    /// `None` when the problem never reached a solver
    pub status: Option<SolveStatus>,
    pub objective: Option<f64>,
    pub fallback: bool,
    pub error: Option<String>,
}

/// Solver side of a cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub status: Option<SolveStatus>,
    pub objective: Option<f64>,
    pub fallback: bool,
    pub error: Option<String>,
}

impl CycleReport {
    pub fn new(
        cycle: u64,
        settings: GridSettings,
        supply: Vec<f64>,
        observations: &[Observation],
        dispatch: &DispatchMap,
        outcome: CycleOutcome,
    ) -> Self {
        let clients: Vec<ClientReport> = observations
            .iter()
            .map(|obs| {
                let client = obs.client_id();
                ClientReport {
                    dispatch: dispatch
                        .get(&client)
                        .map(|d| d.vector().to_vec())
                        .unwrap_or_default(),
                    client,
                    kind: obs.kind,
                    current_power: obs.current_power,
                    predicted: obs.predicted_profile().map(<[f64]>::to_vec),
                }
            })
            .collect();

        let battery = observations.iter().find_map(|obs| {
            let params = obs.battery_params()?;
            let client = obs.client_id();
            let charged: f64 = dispatch.get(&client).map(|d| d.vector().iter().sum::<f64>()).unwrap_or(0.0);
            Some(BatteryReport {
                client,
                initial_soc: params.soc,
                projected_final_soc: params.soc + charged / params.capacity,
                soc_end: params.soc_end,
            })
        });

        let steps = dispatch.values().map(|d| d.vector().len()).max().unwrap_or(0);
        let aggregate = (0..steps)
            .map(|j| dispatch.values().filter_map(|d| d.vector().get(j)).sum::<f64>())
            .collect();

        Self {
            id: Uuid::new_v4(),
            cycle,
            timestamp: Timestamp::now(),
            settings,
            supply,
            clients,
            battery,
            aggregate,
            status: outcome.status,
            objective: outcome.objective,
            fallback: outcome.fallback,
            error: outcome.error,
        }
    }
}
