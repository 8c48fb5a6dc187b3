use chrono::NaiveDateTime;
use tracing::debug;

use crate::domain::{BatteryParams, Observation, ObservationError, ReplicaId, Timestamp};

/// Battery shared by all replicas of the storage load.
///
/// One actuation applies its power for one step: `soc += power / capacity`,
/// with positive power charging. The rating and the physical [0, 1] range are
/// enforced here; the SoC band is left to the dispatch.
#[derive(Debug, Clone)]
pub struct BatterySimulator {
    params: BatteryParams,
    power: f64,
}

impl BatterySimulator {
    pub fn new(params: BatteryParams) -> Self {
        Self { params, power: 0.0 }
    }

    pub fn soc(&self) -> f64 {
        self.params.soc
    }

    pub fn power(&self) -> f64 {
        self.power
    }

    pub fn params(&self) -> &BatteryParams {
        &self.params
    }

    pub fn apply(&mut self, power: f64) {
        let rating = self.params.rating;
        let power = power.clamp(-rating, rating);
        let soc = (self.params.soc + power / self.params.capacity).clamp(0.0, 1.0);
        debug!(power, from = self.params.soc, to = soc, "battery state of charge updated");
        self.params.soc = soc;
        self.power = power;
    }

    pub fn reading(&self, id: ReplicaId, time: NaiveDateTime) -> Result<Observation, ObservationError> {
        Observation::battery(id, Timestamp(time), self.params, self.power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BatteryParams {
        BatteryParams {
            rating: 50.0,
            capacity: 1000.0,
            soc: 0.5,
            soc_lower: 0.2,
            soc_upper: 0.8,
            soc_end: 0.5,
        }
    }

    #[test]
    fn test_charge_and_discharge() {
        let mut battery = BatterySimulator::new(params());
        battery.apply(25.0);
        assert!((battery.soc() - 0.525).abs() < 1e-12);
        battery.apply(-50.0);
        assert!((battery.soc() - 0.475).abs() < 1e-12);
        assert_eq!(battery.power(), -50.0);
    }

    #[test]
    fn test_rating_limits_power() {
        let mut battery = BatterySimulator::new(params());
        battery.apply(500.0);
        assert_eq!(battery.power(), 50.0);
        assert!((battery.soc() - 0.55).abs() < 1e-12);
    }
}
