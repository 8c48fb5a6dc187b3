use serde::{Deserialize, Serialize};
use validator::Validate;

use super::types::HORIZON;

/// Microgrid operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum MicrogridMode {
    #[default]
    GridConnected,
    Islanded,
}

impl TryFrom<u8> for MicrogridMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MicrogridMode::GridConnected),
            1 => Ok(MicrogridMode::Islanded),
            other => Err(format!("unknown microgrid mode {}", other)),
        }
    }
}

impl From<MicrogridMode> for u8 {
    fn from(mode: MicrogridMode) -> Self {
        match mode {
            MicrogridMode::GridConnected => 0,
            MicrogridMode::Islanded => 1,
        }
    }
}

/// Source of the grid supply cap while grid-connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum GridPowerMode {
    /// Power purchased one day ahead (rolling forecast)
    #[default]
    DayAhead,
    /// Constant grid power
    Constant,
}

impl TryFrom<u8> for GridPowerMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(GridPowerMode::DayAhead),
            1 => Ok(GridPowerMode::Constant),
            other => Err(format!("unknown grid power mode {}", other)),
        }
    }
}

impl From<GridPowerMode> for u8 {
    fn from(mode: GridPowerMode) -> Self {
        match mode {
            GridPowerMode::DayAhead => 0,
            GridPowerMode::Constant => 1,
        }
    }
}

/// Operator command inbound to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GridCommand {
    pub microgrid_mode: MicrogridMode,
    pub grid_power_mode: GridPowerMode,
    #[validate(range(min = 0.0))]
    pub grid_power: f64,
    #[validate(range(min = 0.0))]
    pub weight_building: f64,
    #[validate(range(min = 0.0))]
    pub weight_ev: f64,
}

/// Grid settings the dispatch optimizer runs against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSettings {
    pub microgrid_mode: MicrogridMode,
    pub grid_power_mode: GridPowerMode,
    pub grid_power: f64,
    pub weight_building: f64,
    pub weight_ev: f64,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            microgrid_mode: MicrogridMode::GridConnected,
            grid_power_mode: GridPowerMode::DayAhead,
            grid_power: 1000.0,
            weight_building: 1.0,
            weight_ev: 1.0,
        }
    }
}

impl From<GridCommand> for GridSettings {
    fn from(cmd: GridCommand) -> Self {
        Self {
            microgrid_mode: cmd.microgrid_mode,
            grid_power_mode: cmd.grid_power_mode,
            grid_power: cmd.grid_power,
            weight_building: cmd.weight_building,
            weight_ev: cmd.weight_ev,
        }
    }
}

/// Available grid power for each future step of the horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GridSupplyProfile(pub Vec<f64>);

impl GridSupplyProfile {
    pub fn constant(value: f64) -> Self {
        Self(vec![value; HORIZON])
    }

    pub fn zero() -> Self {
        Self::constant(0.0)
    }

    /// Picks the supply policy for the cycle: day-ahead purchase forecast,
    /// constant grid power, or nothing when islanded.
    pub fn select(settings: &GridSettings, purchased: &[f64]) -> Self {
        match (settings.microgrid_mode, settings.grid_power_mode) {
            (MicrogridMode::Islanded, _) => Self::zero(),
            (MicrogridMode::GridConnected, GridPowerMode::DayAhead) => Self(purchased.to_vec()),
            (MicrogridMode::GridConnected, GridPowerMode::Constant) => {
                Self::constant(settings.grid_power)
            }
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
