use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Number of future steps every predicted profile and dispatch vector covers.
pub const HORIZON: usize = 24;

/// Wire format of observation timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors raised while building or validating an observation
#[derive(Debug, Error, PartialEq)]
pub enum ObservationError {
    #[error("predicted profile has {actual} steps, expected {expected}")]
    ProfileLength { expected: usize, actual: usize },
    #[error("{kind} observation carries the wrong payload")]
    PayloadMismatch { kind: LoadKind },
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    #[error("invalid battery parameters: {0}")]
    InvalidBattery(String),
    #[error("invalid timestamp '{0}'")]
    Timestamp(String),
}

// ============================================================================
// Load classes
// ============================================================================

/// Load class of an observation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    Display, EnumString, EnumIter,
)]
pub enum LoadKind {
    /// Building load
    #[serde(rename = "BU")]
    #[strum(serialize = "BU")]
    Building,
    /// EV charging aggregate
    #[serde(rename = "EV")]
    #[strum(serialize = "EV")]
    EvAggregate,
    /// Battery energy storage
    #[serde(rename = "BESS")]
    #[strum(serialize = "BESS")]
    Battery,
}

impl LoadKind {
    /// Loads whose request may be shed and that enter the quadratic penalty.
    pub fn is_sheddable(&self) -> bool {
        !matches!(self, LoadKind::Battery)
    }
}

// ============================================================================
// Identities
// ============================================================================

/// Identity of one running replica, e.g. `BU1`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Client key shared by all replicas of the same load: the id with its
    /// trailing replica index removed (`BU1` -> `BU`).
    pub fn client_id(&self) -> ClientId {
        let trimmed = self.0.trim_end_matches(|c: char| c.is_ascii_digit());
        if trimmed.is_empty() {
            ClientId(self.0.clone())
        } else {
            ClientId(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key of a load client in the coordinator's request map
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// `YYYY-MM-DD HH:MM:SS` timestamp carried on the wire as a string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub NaiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Local::now().naive_local())
    }

    pub fn parse(s: &str) -> Result<Self, ObservationError> {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .map(Self)
            .map_err(|_| ObservationError::Timestamp(s.to_string()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Numeric helpers
// ============================================================================

/// Additive guard used by every relative-deviation comparison.
pub const DEVIATION_EPSILON: f64 = 1e-9;

/// Relative deviation of `own` from `reference`: |own - reference| / (|reference| + eps)
pub fn relative_deviation(own: f64, reference: f64) -> f64 {
    (own - reference).abs() / (reference.abs() + DEVIATION_EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_client_id_strips_replica_index() {
        assert_eq!(ReplicaId::from("BU1").client_id(), ClientId::from("BU"));
        assert_eq!(ReplicaId::from("EV12").client_id(), ClientId::from("EV"));
        assert_eq!(ReplicaId::from("BESS").client_id(), ClientId::from("BESS"));
        assert_eq!(ReplicaId::from("42").client_id(), ClientId::from("42"));
    }

    #[test]
    fn test_load_kind_wire_names() {
        assert_eq!(LoadKind::Building.to_string(), "BU");
        assert_eq!(LoadKind::from_str("BESS").unwrap(), LoadKind::Battery);
        assert_eq!(serde_json::to_string(&LoadKind::EvAggregate).unwrap(), "\"EV\"");
    }

    #[test]
    fn test_timestamp_round_trip_format() {
        let ts = Timestamp::parse("2024-03-01 13:00:00").unwrap();
        assert_eq!(ts.to_string(), "2024-03-01 13:00:00");
        assert!(Timestamp::parse("2024/03/01").is_err());
    }

    #[test]
    fn test_relative_deviation_zero_guard() {
        assert_eq!(relative_deviation(0.0, 0.0), 0.0);
        assert!((relative_deviation(105.0, 100.0) - 0.05).abs() < 1e-9);
        assert!(relative_deviation(1.0, 0.0) > 1e8);
    }
}
