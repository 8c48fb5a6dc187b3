use crate::domain::{relative_deviation, DeviceCommand, DispatchCommand, LoadKind, Observation};

/// Per-kind capabilities the generic consensus agent needs
pub trait LoadStrategy: Send + Sync {
    fn kind(&self) -> LoadKind;

    /// Power figure replicas compare when voting.
    fn comparison_metric(&self, observation: &Observation) -> f64;

    /// Device command for the immediate step of a dispatch vector.
    fn device_command(&self, dispatch: &DispatchCommand) -> Option<DeviceCommand>;
}

/// Building and EV aggregate loads: compared on current power, actuated by capping power.
#[derive(Debug, Clone, Copy)]
pub struct SheddableLoad {
    kind: LoadKind,
}

impl SheddableLoad {
    pub fn new(kind: LoadKind) -> Self {
        Self { kind }
    }
}

impl LoadStrategy for SheddableLoad {
    fn kind(&self) -> LoadKind {
        self.kind
    }

    fn comparison_metric(&self, observation: &Observation) -> f64 {
        observation.current_power
    }

    fn device_command(&self, dispatch: &DispatchCommand) -> Option<DeviceCommand> {
        dispatch.immediate().map(DeviceCommand::LimitPower)
    }
}

/// Battery storage: compared on current power, actuated through a SoC update.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageLoad;

impl LoadStrategy for StorageLoad {
    fn kind(&self) -> LoadKind {
        LoadKind::Battery
    }

    fn comparison_metric(&self, observation: &Observation) -> f64 {
        observation.current_power
    }

    fn device_command(&self, dispatch: &DispatchCommand) -> Option<DeviceCommand> {
        dispatch.immediate().map(DeviceCommand::UpdateSoc)
    }
}

pub fn strategy_for(kind: LoadKind) -> Box<dyn LoadStrategy> {
    match kind {
        LoadKind::Building | LoadKind::EvAggregate => Box::new(SheddableLoad::new(kind)),
        LoadKind::Battery => Box::new(StorageLoad),
    }
}

/// Yes iff `own` deviates from `proposed` by at most `tolerance`, relative to `proposed`.
pub fn approves(own: f64, proposed: f64, tolerance: f64) -> bool {
    relative_deviation(own, proposed) <= tolerance
}
