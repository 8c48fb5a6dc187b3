//! Sheddable load readings as seen by one replica.
//!
//! All replicas of a load follow the same time-of-day shape; each adds its own
//! multiplicative measurement noise, so honest replicas agree within a few
//! percent.

use chrono::{Duration, NaiveDateTime, Timelike};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::domain::{LoadKind, Observation, ObservationError, ReplicaId, Timestamp, HORIZON};

pub struct LoadSimulator {
    kind: LoadKind,
    base_power: f64,
    noise: f64,
    rng: StdRng,
}

impl LoadSimulator {
    /// `noise` is the relative half-width of the uniform measurement error.
    pub fn new(kind: LoadKind, base_power: f64, noise: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            kind,
            base_power,
            noise: noise.abs(),
            rng,
        }
    }

    pub fn kind(&self) -> LoadKind {
        self.kind
    }

    /// Noise-free load at `time`.
    pub fn expected_power(&self, time: NaiveDateTime) -> f64 {
        self.base_power * tod_multiplier(self.kind, time.hour())
    }

    /// Current power plus a prediction for each hour of the horizon.
    pub fn reading(&mut self, id: ReplicaId, time: NaiveDateTime) -> Result<Observation, ObservationError> {
        let predicted: Vec<f64> = (1..=HORIZON as i64)
            .map(|h| self.expected_power(time + Duration::hours(h)))
            .collect();
        let current = self.expected_power(time) * (1.0 + self.sample_noise());
        Observation::profile(id, self.kind, Timestamp(time), predicted, current.max(0.0))
    }

    fn sample_noise(&mut self) -> f64 {
        if self.noise == 0.0 {
            return 0.0;
        }
        self.rng.gen_range(-self.noise..=self.noise)
    }
}

/// Daily demand shape, averaging roughly 1.0 over a day
fn tod_multiplier(kind: LoadKind, hour: u32) -> f64 {
    let hour = hour as f64;
    match kind {
        // office-like building: daytime plateau
        LoadKind::Building => {
            if hour < 6.0 {
                0.6
            } else if hour < 9.0 {
                0.8 + (hour - 6.0) * 0.2
            } else if hour < 17.0 {
                1.4
            } else if hour < 21.0 {
                1.2 - (hour - 17.0) * 0.1
            } else {
                0.7
            }
        }
        // EV fleet plugs in after work
        LoadKind::EvAggregate => {
            if hour < 6.0 {
                1.2
            } else if hour < 17.0 {
                0.5
            } else if hour < 22.0 {
                1.5 + (hour - 17.0) * 0.2
            } else {
                1.4
            }
        }
        LoadKind::Battery => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::relative_deviation;
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 14)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_reading_covers_horizon() {
        let mut sim = LoadSimulator::new(LoadKind::Building, 500.0, 0.0, Some(1));
        let obs = sim.reading("BU1".into(), at(12)).unwrap();
        assert_eq!(obs.predicted_profile().unwrap().len(), HORIZON);
        assert_eq!(obs.current_power, 700.0);
        assert_eq!(obs.predicted_profile().unwrap()[0], sim.expected_power(at(13)));
    }

    #[test]
    fn test_daily_shapes() {
        let bu = LoadSimulator::new(LoadKind::Building, 100.0, 0.0, Some(1));
        assert!(bu.expected_power(at(12)) > bu.expected_power(at(3)));

        let ev = LoadSimulator::new(LoadKind::EvAggregate, 100.0, 0.0, Some(1));
        assert!(ev.expected_power(at(19)) > ev.expected_power(at(12)));
    }

    #[test]
    fn test_replicas_agree_within_noise() {
        let mut a = LoadSimulator::new(LoadKind::EvAggregate, 100.0, 0.01, Some(1));
        let mut b = LoadSimulator::new(LoadKind::EvAggregate, 100.0, 0.01, Some(2));
        for hour in 0..24 {
            let own = a.reading("EV1".into(), at(hour)).unwrap().current_power;
            let peer = b.reading("EV2".into(), at(hour)).unwrap().current_power;
            assert!(relative_deviation(own, peer) < 0.05);
        }
    }
}
