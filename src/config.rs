use anyhow::{ensure, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::{GridPowerMode, GridSettings, MicrogridMode, HORIZON};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub consensus: ConsensusConfig,
    pub coordinator: CoordinatorConfig,
    pub grid: GridConfig,
    pub optimizer: OptimizerConfig,
    pub telemetry: TelemetryConfig,
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Maximum relative deviation for a "yes" vote
    pub vote_tolerance: f64,
    pub vote_retry_ms: u64,
    pub max_vote_retries: u32,
    pub leader_wait_ms: u64,
    pub actuation_retry_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            vote_tolerance: 0.05,
            vote_retry_ms: 5000,
            max_vote_retries: 3,
            leader_wait_ms: 5000,
            actuation_retry_ms: 5000,
        }
    }
}

impl ConsensusConfig {
    pub fn vote_retry(&self) -> Duration {
        Duration::from_millis(self.vote_retry_ms)
    }
    pub fn leader_wait(&self) -> Duration {
        Duration::from_millis(self.leader_wait_ms)
    }
    pub fn actuation_retry(&self) -> Duration {
        Duration::from_millis(self.actuation_retry_ms)
    }
}

/// What the coordinator sends when a cycle cannot be solved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Previous dispatch for the client, advanced by one step
    #[default]
    HoldPrevious,
    /// All-zero allocation
    Zero,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub horizon: usize,
    pub clients_per_cycle: usize,
    pub initial_purchased_power: f64,
    pub recheck_ms: u64,
    pub stall_warning_ms: u64,
    pub fallback: FallbackPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            horizon: HORIZON,
            clients_per_cycle: 3,
            initial_purchased_power: 1000.0,
            recheck_ms: 5000,
            stall_warning_ms: 60_000,
            fallback: FallbackPolicy::HoldPrevious,
        }
    }
}

impl CoordinatorConfig {
    pub fn recheck(&self) -> Duration {
        Duration::from_millis(self.recheck_ms)
    }
    pub fn stall_warning(&self) -> Duration {
        Duration::from_millis(self.stall_warning_ms)
    }
}

/// Operator defaults applied until the first grid command arrives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub microgrid_mode: MicrogridMode,
    pub grid_power_mode: GridPowerMode,
    pub grid_power: f64,
    pub weight_building: f64,
    pub weight_ev: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        let s = GridSettings::default();
        Self {
            microgrid_mode: s.microgrid_mode,
            grid_power_mode: s.grid_power_mode,
            grid_power: s.grid_power,
            weight_building: s.weight_building,
            weight_ev: s.weight_ev,
        }
    }
}

impl GridConfig {
    pub fn settings(&self) -> GridSettings {
        GridSettings {
            microgrid_mode: self.microgrid_mode,
            grid_power_mode: self.grid_power_mode,
            grid_power: self.grid_power,
            weight_building: self.weight_building,
            weight_ev: self.weight_ev,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Quadratic,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub strategy: StrategyKind,
    /// Horizon decay constant while grid-connected
    pub tau_grid_connected: f64,
    /// Horizon decay constant while islanded
    pub tau_islanded: f64,
    pub admm: AdmmConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Quadratic,
            tau_grid_connected: 8.0,
            tau_islanded: 1.5,
            admm: AdmmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmmConfig {
    pub rho: f64,
    pub sigma: f64,
    pub alpha: f64,
    pub eps_abs: f64,
    pub eps_rel: f64,
    pub eps_infeasible: f64,
    pub max_iterations: usize,
    pub check_every: usize,
    /// Ruiz equilibration passes over the problem data
    pub scaling_iterations: usize,
    /// Solve the guessed active set exactly once it stops changing
    pub polish: bool,
    /// At the iteration limit, the best iterate is still accepted when its
    /// residuals are within this multiple of the stopping tolerances
    pub loose_factor: f64,
}

impl Default for AdmmConfig {
    fn default() -> Self {
        Self {
            rho: 0.1,
            sigma: 1e-6,
            alpha: 1.6,
            eps_abs: 1e-6,
            eps_rel: 1e-6,
            eps_infeasible: 1e-7,
            max_iterations: 40_000,
            check_every: 10,
            scaling_iterations: 10,
            polish: true,
            loose_factor: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub json: bool,
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: true,
            default_filter: "info".to_string(),
        }
    }
}

/// In-process microgrid used by the binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub replicas_per_load: usize,
    pub cycle_ms: u64,
    pub building_power: f64,
    pub ev_power: f64,
    /// Relative measurement noise between replicas of the same load
    pub replica_noise: f64,
    pub battery_rating: f64,
    pub battery_capacity: f64,
    pub battery_soc: f64,
    pub battery_soc_lower: f64,
    pub battery_soc_upper: f64,
    pub battery_soc_end: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            replicas_per_load: 3,
            cycle_ms: 10_000,
            building_power: 500.0,
            ev_power: 100.0,
            replica_noise: 0.01,
            battery_rating: 50.0,
            battery_capacity: 1000.0,
            battery_soc: 0.5,
            battery_soc_lower: 0.2,
            battery_soc_upper: 0.8,
            battery_soc_end: 0.5,
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("MGC__").split("__"))
    }

    pub fn load() -> Result<Self> {
        let cfg: Self = Self::figment().extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Profiles, supply and dispatch vectors are all `HORIZON` steps long on
    /// the wire, so the planning horizon cannot differ from it.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.coordinator.horizon == HORIZON,
            "coordinator.horizon is {} but request profiles carry {} steps",
            self.coordinator.horizon,
            HORIZON
        );
        ensure!(
            self.coordinator.clients_per_cycle > 0,
            "coordinator.clients_per_cycle must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_files() {
        figment::Jail::expect_with(|_jail| {
            let cfg = Config::load().expect("defaults load");
            assert_eq!(cfg.coordinator.horizon, 24);
            assert_eq!(cfg.consensus.max_vote_retries, 3);
            assert_eq!(cfg.optimizer.tau_grid_connected, 8.0);
            assert_eq!(cfg.coordinator.fallback, FallbackPolicy::HoldPrevious);
            Ok(())
        });
    }

    #[test]
    fn test_toml_and_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/default.toml",
                r#"
                [optimizer]
                strategy = "linear"

                [grid]
                microgrid_mode = 1
                "#,
            )?;
            jail.set_env("MGC__CONSENSUS__VOTE_RETRY_MS", "250");
            jail.set_env("MGC__COORDINATOR__FALLBACK", "zero");

            let cfg = Config::load().expect("layered load");
            assert_eq!(cfg.optimizer.strategy, StrategyKind::Linear);
            assert_eq!(cfg.grid.microgrid_mode, MicrogridMode::Islanded);
            assert_eq!(cfg.consensus.vote_retry(), Duration::from_millis(250));
            assert_eq!(cfg.coordinator.fallback, FallbackPolicy::Zero);
            Ok(())
        });
    }

    #[test]
    fn test_mismatched_horizon_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MGC__COORDINATOR__HORIZON", "12");
            let err = Config::load().unwrap_err();
            assert!(err.to_string().contains("coordinator.horizon is 12"), "{}", err);
            Ok(())
        });
    }
}
