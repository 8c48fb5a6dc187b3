use serde::{Deserialize, Serialize};

use super::types::{ClientId, LoadKind, ObservationError, ReplicaId, Timestamp, HORIZON};

/// Physical parameters and state reported by a battery unit.
///
/// Field names follow the device vocabulary (`Rbess`, `Cbattery`, ...) so the
/// mapping payload of a battery request stays readable by existing tooling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryParams {
    /// Power rating (charge and discharge limit)
    #[serde(rename = "Rbess")]
    pub rating: f64,
    /// Capacity used to convert power to state-of-charge change
    #[serde(rename = "Cbattery")]
    pub capacity: f64,
    /// Current state of charge (fraction)
    #[serde(rename = "SoC")]
    pub soc: f64,
    /// Lower state-of-charge bound
    #[serde(rename = "SoCl")]
    pub soc_lower: f64,
    /// Upper state-of-charge bound
    #[serde(rename = "SoCu")]
    pub soc_upper: f64,
    /// State of charge required at the end of the horizon
    #[serde(rename = "SoCend")]
    pub soc_end: f64,
}

impl BatteryParams {
    pub fn validate(&self) -> Result<(), ObservationError> {
        let fields = [
            self.rating,
            self.capacity,
            self.soc,
            self.soc_lower,
            self.soc_upper,
            self.soc_end,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(ObservationError::NonFinite("battery parameters"));
        }
        if self.capacity <= 0.0 {
            return Err(ObservationError::InvalidBattery(format!(
                "capacity must be positive, got {}",
                self.capacity
            )));
        }
        if self.rating < 0.0 {
            return Err(ObservationError::InvalidBattery(format!(
                "power rating must be non-negative, got {}",
                self.rating
            )));
        }
        if self.soc_lower > self.soc_upper {
            return Err(ObservationError::InvalidBattery(format!(
                "SoC band is empty: [{}, {}]",
                self.soc_lower, self.soc_upper
            )));
        }
        Ok(())
    }
}

/// Forecast part of a request: a 24-step profile, or battery parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestPayload {
    Profile(Vec<f64>),
    Battery(BatteryParams),
}

/// One reporting-cycle observation of a load, owned by its replica's
/// consensus agent until released to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ReplicaId,
    pub kind: LoadKind,
    pub timestamp: Timestamp,
    pub payload: RequestPayload,
    pub current_power: f64,
}

impl Observation {
    pub fn profile(
        id: ReplicaId,
        kind: LoadKind,
        timestamp: Timestamp,
        predicted: Vec<f64>,
        current_power: f64,
    ) -> Result<Self, ObservationError> {
        let obs = Self {
            id,
            kind,
            timestamp,
            payload: RequestPayload::Profile(predicted),
            current_power,
        };
        obs.validate()?;
        Ok(obs)
    }

    pub fn battery(
        id: ReplicaId,
        timestamp: Timestamp,
        params: BatteryParams,
        current_power: f64,
    ) -> Result<Self, ObservationError> {
        let obs = Self {
            id,
            kind: LoadKind::Battery,
            timestamp,
            payload: RequestPayload::Battery(params),
            current_power,
        };
        obs.validate()?;
        Ok(obs)
    }

    /// Checks payload shape against the kind and the horizon length.
    pub fn validate(&self) -> Result<(), ObservationError> {
        if !self.current_power.is_finite() {
            return Err(ObservationError::NonFinite("current power"));
        }
        match (&self.payload, self.kind) {
            (RequestPayload::Battery(params), LoadKind::Battery) => params.validate(),
            (RequestPayload::Profile(profile), kind) if kind.is_sheddable() => {
                if profile.len() != HORIZON {
                    return Err(ObservationError::ProfileLength {
                        expected: HORIZON,
                        actual: profile.len(),
                    });
                }
                if profile.iter().any(|v| !v.is_finite()) {
                    return Err(ObservationError::NonFinite("predicted profile"));
                }
                Ok(())
            }
            (_, kind) => Err(ObservationError::PayloadMismatch { kind }),
        }
    }

    pub fn predicted_profile(&self) -> Option<&[f64]> {
        match &self.payload {
            RequestPayload::Profile(p) => Some(p),
            RequestPayload::Battery(_) => None,
        }
    }

    pub fn battery_params(&self) -> Option<&BatteryParams> {
        match &self.payload {
            RequestPayload::Battery(b) => Some(b),
            RequestPayload::Profile(_) => None,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.id.client_id()
    }

    pub fn to_request(&self) -> PowerRequest {
        PowerRequest(
            self.id.clone(),
            self.kind,
            self.timestamp,
            self.payload.clone(),
            self.current_power,
        )
    }
}

/// Submission inbound to the coordinator, serialized as the positional tuple
/// `(clientId, kind, timestamp, predictedProfile | battery mapping, currentPower)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerRequest(
    pub ReplicaId,
    pub LoadKind,
    pub Timestamp,
    pub RequestPayload,
    pub f64,
);

impl PowerRequest {
    pub fn into_observation(self) -> Result<Observation, ObservationError> {
        let PowerRequest(id, kind, timestamp, payload, current_power) = self;
        let obs = Observation {
            id,
            kind,
            timestamp,
            payload,
            current_power,
        };
        obs.validate()?;
        Ok(obs)
    }
}
