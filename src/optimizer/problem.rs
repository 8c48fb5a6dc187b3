//! Formulation of one dispatch cycle.
//!
//! Decision variables are laid out load-major: the sheddable loads first
//! (building, then EV), each contributing one variable per horizon step,
//! followed by the battery. Battery power is positive while charging, so it
//! draws on the same supply budget as the loads and raises the state of charge
//! by `x / Cbattery` per step.

use itertools::Itertools;
use tracing::debug;

use super::types::DispatchError;
use crate::config::OptimizerConfig;
use crate::domain::{
    BatteryParams, ClientId, DispatchCommand, DispatchMap, GridSettings, GridSupplyProfile,
    LoadKind, MicrogridMode, Observation,
};

/// A building or EV request: shedding is allowed, excess is not
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub client: ClientId,
    pub kind: LoadKind,
    pub requested: Vec<f64>,
    pub current_power: f64,
    pub class_weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatteryRequest {
    pub client: ClientId,
    pub params: BatteryParams,
    pub current_power: f64,
}

impl BatteryRequest {
    /// Bounds on cumulative battery power `(lower, upper, terminal)` that keep
    /// the state of charge inside its band and land it on `SoCend`.
    pub fn cumulative_window(&self) -> (f64, f64, f64) {
        let p = &self.params;
        (
            (p.soc_lower - p.soc) * p.capacity,
            (p.soc_upper - p.soc) * p.capacity,
            (p.soc_end - p.soc) * p.capacity,
        )
    }

    /// State of charge after each step of `dispatch`.
    pub fn projected_soc(&self, dispatch: &[f64]) -> Vec<f64> {
        let p = &self.params;
        dispatch
            .iter()
            .scan(p.soc, |soc, x| {
                *soc += x / p.capacity;
                Some(*soc)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchProblem {
    pub horizon: usize,
    pub loads: Vec<LoadRequest>,
    pub battery: BatteryRequest,
    pub supply: Vec<f64>,
    /// Horizon decay constant of the deviation weights
    pub tau: f64,
}

impl DispatchProblem {
    /// Builds the cycle's problem from one observation per load kind.
    pub fn build<'a>(
        observations: impl IntoIterator<Item = &'a Observation>,
        supply: &GridSupplyProfile,
        settings: &GridSettings,
        cfg: &OptimizerConfig,
        horizon: usize,
    ) -> Result<Self, DispatchError> {
        let observations: Vec<&Observation> = observations.into_iter().collect();
        let find = |kind: LoadKind| {
            observations
                .iter()
                .copied()
                .find(|o| o.kind == kind)
                .ok_or(DispatchError::MissingKind(kind))
        };

        let mut loads = Vec::with_capacity(2);
        for (kind, class_weight) in [
            (LoadKind::Building, settings.weight_building),
            (LoadKind::EvAggregate, settings.weight_ev),
        ] {
            let obs = find(kind)?;
            let requested = obs
                .predicted_profile()
                .ok_or_else(|| DispatchError::InvalidInput(format!("{} request carries no profile", kind)))?;
            loads.push(LoadRequest {
                client: obs.client_id(),
                kind,
                requested: requested.to_vec(),
                current_power: obs.current_power,
                class_weight,
            });
        }

        let obs = find(LoadKind::Battery)?;
        let params = *obs
            .battery_params()
            .ok_or_else(|| DispatchError::InvalidInput("battery request carries no parameters".into()))?;
        let battery = BatteryRequest {
            client: obs.client_id(),
            params,
            current_power: obs.current_power,
        };

        let tau = match settings.microgrid_mode {
            MicrogridMode::GridConnected => cfg.tau_grid_connected,
            MicrogridMode::Islanded => cfg.tau_islanded,
        };

        let problem = Self {
            horizon,
            loads,
            battery,
            supply: supply.values().to_vec(),
            tau,
        };
        problem.validate()?;
        Ok(problem)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.horizon == 0 {
            return Err(DispatchError::InvalidInput("horizon must be positive".into()));
        }
        if !(self.tau.is_finite() && self.tau > 0.0) {
            return Err(DispatchError::InvalidInput(format!("decay constant must be positive, got {}", self.tau)));
        }
        if self.supply.len() != self.horizon {
            return Err(DispatchError::InvalidInput(format!(
                "supply profile has {} steps, expected {}",
                self.supply.len(),
                self.horizon
            )));
        }
        if self.supply.iter().any(|s| !s.is_finite()) {
            return Err(DispatchError::InvalidInput("supply profile is not finite".into()));
        }
        for load in &self.loads {
            if load.requested.len() != self.horizon {
                return Err(DispatchError::InvalidInput(format!(
                    "{} profile has {} steps, expected {}",
                    load.kind,
                    load.requested.len(),
                    self.horizon
                )));
            }
            if load.requested.iter().any(|r| !r.is_finite() || *r < 0.0) {
                return Err(DispatchError::InvalidInput(format!(
                    "{} profile must be finite and non-negative",
                    load.kind
                )));
            }
            if !(load.class_weight.is_finite() && load.class_weight >= 0.0) {
                return Err(DispatchError::InvalidInput(format!(
                    "{} weight must be non-negative",
                    load.kind
                )));
            }
        }
        self.battery
            .params
            .validate()
            .map_err(|e| DispatchError::InvalidInput(e.to_string()))
    }

    pub fn n_vars(&self) -> usize {
        (self.loads.len() + 1) * self.horizon
    }

    pub fn load_var(&self, load: usize, step: usize) -> usize {
        load * self.horizon + step
    }

    pub fn battery_var(&self, step: usize) -> usize {
        self.loads.len() * self.horizon + step
    }

    /// `exp(-step / tau) * classWeight`, with `step` counted from zero.
    pub fn weight(&self, load: usize, step: usize) -> f64 {
        (-(step as f64) / self.tau).exp() * self.loads[load].class_weight
    }

    /// Weighted squared shortfall `sum 0.5 * w * (r - x)^2` over the loads.
    pub fn shortfall_cost(&self, x: &[f64]) -> f64 {
        (0..self.loads.len())
            .cartesian_product(0..self.horizon)
            .map(|(i, j)| {
                let gap = self.loads[i].requested[j] - x[self.load_var(i, j)];
                0.5 * self.weight(i, j) * gap * gap
            })
            .sum()
    }

    /// Exact feasibility of the battery trajectory.
    ///
    /// Loads can always be shed to zero, so the only coupling is the battery:
    /// per step it may discharge up to its rating and charge up to the smaller
    /// of its rating and the supply. The set of reachable cumulative values is
    /// an interval, propagated forward and clipped by the SoC band.
    pub fn check_feasibility(&self) -> Result<(), DispatchError> {
        let rating = self.battery.params.rating;
        let (band_lo, band_hi, target) = self.battery.cumulative_window();
        let (mut lo, mut hi) = (0.0f64, 0.0f64);

        for (step, supply) in self.supply.iter().enumerate() {
            let max_charge = rating.min(*supply);
            if max_charge < -rating {
                return Err(DispatchError::Infeasible(format!(
                    "supply {} at step {} is below the battery discharge limit",
                    supply, step
                )));
            }
            lo = (lo - rating).max(band_lo);
            hi = (hi + max_charge).min(band_hi);
            if lo > hi {
                return Err(DispatchError::Infeasible(format!(
                    "state of charge leaves [{}, {}] by step {}",
                    self.battery.params.soc_lower, self.battery.params.soc_upper, step
                )));
            }
        }

        let slack = 1e-9 * (1.0 + target.abs());
        if target < lo - slack || target > hi + slack {
            return Err(DispatchError::Infeasible(format!(
                "terminal state of charge {} unreachable, cumulative power range [{:.3}, {:.3}] vs {:.3}",
                self.battery.params.soc_end, lo, hi, target
            )));
        }
        debug!(lo, hi, target, "battery trajectory feasible");
        Ok(())
    }

    /// Splits a solution vector into one dispatch command per client.
    pub fn assemble(&self, x: &[f64]) -> DispatchMap {
        let mut dispatch = DispatchMap::new();
        for (i, load) in self.loads.iter().enumerate() {
            let vector = (0..self.horizon).map(|j| x[self.load_var(i, j)]).collect();
            dispatch.insert(load.client.clone(), DispatchCommand(load.kind, vector));
        }
        let battery = (0..self.horizon).map(|j| x[self.battery_var(j)]).collect();
        dispatch.insert(
            self.battery.client.clone(),
            DispatchCommand(LoadKind::Battery, battery),
        );
        dispatch
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{GridPowerMode, Timestamp, HORIZON};
    use rstest::rstest;

    pub(crate) fn battery_params(soc_end: f64) -> BatteryParams {
        BatteryParams {
            rating: 50.0,
            capacity: 1000.0,
            soc: 0.5,
            soc_lower: 0.2,
            soc_upper: 0.8,
            soc_end,
        }
    }

    pub(crate) fn scenario_observations(params: BatteryParams) -> Vec<Observation> {
        let ts = Timestamp::now();
        vec![
            Observation::profile("BU1".into(), LoadKind::Building, ts, vec![500.0; HORIZON], 480.0).unwrap(),
            Observation::profile("EV2".into(), LoadKind::EvAggregate, ts, vec![100.0; HORIZON], 90.0).unwrap(),
            Observation::battery("BESS1".into(), ts, params, 0.0).unwrap(),
        ]
    }

    pub(crate) fn scenario(mode: MicrogridMode, supply: f64, params: BatteryParams) -> DispatchProblem {
        let settings = GridSettings {
            microgrid_mode: mode,
            grid_power_mode: GridPowerMode::Constant,
            grid_power: supply,
            ..GridSettings::default()
        };
        let profile = GridSupplyProfile::select(&settings, &[]);
        DispatchProblem::build(
            &scenario_observations(params),
            &profile,
            &settings,
            &OptimizerConfig::default(),
            HORIZON,
        )
        .unwrap()
    }

    #[test]
    fn test_build_orders_loads_and_keys_by_client() {
        let p = scenario(MicrogridMode::GridConnected, 1000.0, battery_params(0.5));
        assert_eq!(p.loads[0].kind, LoadKind::Building);
        assert_eq!(p.loads[1].kind, LoadKind::EvAggregate);
        assert_eq!(p.loads[1].client, ClientId::from("EV"));
        assert_eq!(p.battery.client, ClientId::from("BESS"));
        assert_eq!(p.n_vars(), 72);
        assert_eq!(p.battery_var(0), 48);
    }

    #[test]
    fn test_missing_kind_is_reported() {
        let obs = scenario_observations(battery_params(0.5));
        let err = DispatchProblem::build(
            &obs[..2],
            &GridSupplyProfile::constant(1000.0),
            &GridSettings::default(),
            &OptimizerConfig::default(),
            HORIZON,
        )
        .unwrap_err();
        assert_eq!(err, DispatchError::MissingKind(LoadKind::Battery));
    }

    #[rstest]
    #[case(MicrogridMode::GridConnected, 8.0)]
    #[case(MicrogridMode::Islanded, 1.5)]
    fn test_weights_decay_with_mode(#[case] mode: MicrogridMode, #[case] tau: f64) {
        let p = scenario(mode, 1000.0, battery_params(0.5));
        assert_eq!(p.tau, tau);
        assert_eq!(p.weight(0, 0), 1.0);
        assert!((p.weight(0, 3) - (-3.0 / tau).exp()).abs() < 1e-12);
        assert!(p.weight(1, 10) < p.weight(1, 9));
    }

    #[rstest]
    #[case(MicrogridMode::GridConnected, 1000.0, 0.5, true)]
    #[case(MicrogridMode::GridConnected, 1000.0, 0.8, true)]
    // 24 steps at 50 can move SoC by at most 1.2, but the band caps it at 0.8
    #[case(MicrogridMode::GridConnected, 1000.0, 0.85, false)]
    #[case(MicrogridMode::Islanded, 0.0, 0.45, true)]
    // no supply to charge from while islanded
    #[case(MicrogridMode::Islanded, 0.0, 0.55, false)]
    fn test_feasibility(#[case] mode: MicrogridMode, #[case] supply: f64, #[case] soc_end: f64, #[case] ok: bool) {
        let p = scenario(mode, supply, battery_params(soc_end));
        assert_eq!(p.check_feasibility().is_ok(), ok);
    }

    #[test]
    fn test_rating_limits_reachable_soc() {
        let mut params = battery_params(0.5);
        params.rating = 1.0;
        params.soc_end = 0.6;
        let p = scenario(MicrogridMode::GridConnected, 1000.0, params);
        // 24 * 1.0 / 1000 = 0.024 < 0.1
        assert!(matches!(p.check_feasibility(), Err(DispatchError::Infeasible(_))));
    }

    #[test]
    fn test_projected_soc_and_assemble() {
        let p = scenario(MicrogridMode::GridConnected, 1000.0, battery_params(0.5));
        let soc = p.battery.projected_soc(&[10.0, -20.0]);
        assert!((soc[0] - 0.51).abs() < 1e-12);
        assert!((soc[1] - 0.49).abs() < 1e-12);

        let x: Vec<f64> = (0..p.n_vars()).map(|v| v as f64).collect();
        let dispatch = p.assemble(&x);
        assert_eq!(dispatch.len(), 3);
        assert_eq!(dispatch[&ClientId::from("EV")].vector()[0], 24.0);
        assert_eq!(dispatch[&ClientId::from("BESS")].kind(), LoadKind::Battery);
    }

    #[test]
    fn test_shortfall_cost() {
        let p = scenario(MicrogridMode::GridConnected, 1000.0, battery_params(0.5));
        let mut x = vec![0.0; p.n_vars()];
        for (i, load) in p.loads.iter().enumerate() {
            for j in 0..p.horizon {
                x[p.load_var(i, j)] = load.requested[j];
            }
        }
        assert_eq!(p.shortfall_cost(&x), 0.0);

        // shedding 10 from the first building step costs 0.5 * 1 * 100
        x[p.load_var(0, 0)] -= 10.0;
        assert!((p.shortfall_cost(&x) - 50.0).abs() < 1e-9);
    }
}
