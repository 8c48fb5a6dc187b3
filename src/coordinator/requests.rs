use std::collections::BTreeMap;
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::domain::{ClientId, LoadKind, Observation, ObservationError};

#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("request buffer full ({capacity} clients), rejecting {client}")]
    Capacity { capacity: usize, client: ClientId },
    #[error("{kind} already requested by {held_by}, rejecting {client}")]
    KindConflict {
        kind: LoadKind,
        held_by: ClientId,
        client: ClientId,
    },
    #[error("{client} switched from {previous} to {kind}")]
    KindChanged {
        client: ClientId,
        previous: LoadKind,
        kind: LoadKind,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] ObservationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Inserted,
    /// Same client submitted again before the cycle ran
    Replaced,
}

/// Observations collected for the current cycle, one per client
#[derive(Debug, Clone)]
pub struct RequestMap {
    entries: BTreeMap<ClientId, Observation>,
    capacity: usize,
}

impl RequestMap {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    pub fn submit(&mut self, obs: Observation) -> Result<SubmitOutcome, AggregationError> {
        let client = obs.client_id();
        if let Some(existing) = self.entries.get(&client) {
            if existing.kind != obs.kind {
                return Err(AggregationError::KindChanged {
                    client,
                    previous: existing.kind,
                    kind: obs.kind,
                });
            }
            self.entries.insert(client, obs);
            return Ok(SubmitOutcome::Replaced);
        }
        if self.entries.len() >= self.capacity {
            return Err(AggregationError::Capacity {
                capacity: self.capacity,
                client,
            });
        }
        if let Some((held_by, _)) = self.entries.iter().find(|(_, o)| o.kind == obs.kind) {
            return Err(AggregationError::KindConflict {
                kind: obs.kind,
                held_by: held_by.clone(),
                client,
            });
        }
        self.entries.insert(client, obs);
        Ok(SubmitOutcome::Inserted)
    }

    /// One observation of every load kind is buffered.
    pub fn is_complete(&self) -> bool {
        LoadKind::iter().all(|kind| self.entries.values().any(|o| o.kind == kind))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, client: &ClientId) -> Option<&Observation> {
        self.entries.get(client)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Empties the map, handing its observations to the caller.
    pub fn take(&mut self) -> Vec<Observation> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BatteryParams, Timestamp};

    fn profile(id: &str, kind: LoadKind) -> Observation {
        Observation::profile(id.into(), kind, Timestamp::now(), vec![1.0; 24], 1.0).unwrap()
    }

    fn battery(id: &str) -> Observation {
        let params = BatteryParams {
            rating: 50.0,
            capacity: 1000.0,
            soc: 0.5,
            soc_lower: 0.2,
            soc_upper: 0.8,
            soc_end: 0.5,
        };
        Observation::battery(id.into(), Timestamp::now(), params, 0.0).unwrap()
    }

    #[test]
    fn test_complete_after_one_of_each_kind() {
        let mut map = RequestMap::new(3);
        assert_eq!(map.submit(profile("BU1", LoadKind::Building)), Ok(SubmitOutcome::Inserted));
        assert_eq!(map.submit(battery("BESS2")), Ok(SubmitOutcome::Inserted));
        assert!(!map.is_complete());
        assert_eq!(map.submit(profile("EV1", LoadKind::EvAggregate)), Ok(SubmitOutcome::Inserted));
        assert!(map.is_complete());
        assert_eq!(map.take().len(), 3);
        assert!(map.is_empty());
    }

    #[test]
    fn test_replica_of_same_client_overwrites() {
        let mut map = RequestMap::new(3);
        map.submit(profile("BU1", LoadKind::Building)).unwrap();
        assert_eq!(map.submit(profile("BU2", LoadKind::Building)), Ok(SubmitOutcome::Replaced));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&ClientId::from("BU")).unwrap().id, crate::domain::ReplicaId::from("BU2"));
    }

    #[test]
    fn test_fourth_client_rejected() {
        let mut map = RequestMap::new(3);
        map.submit(profile("BU1", LoadKind::Building)).unwrap();
        map.submit(profile("EV1", LoadKind::EvAggregate)).unwrap();
        map.submit(battery("BESS1")).unwrap();
        let err = map.submit(profile("HVAC1", LoadKind::Building)).unwrap_err();
        assert!(matches!(err, AggregationError::Capacity { capacity: 3, .. }));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_second_client_of_same_kind_rejected() {
        let mut map = RequestMap::new(3);
        map.submit(profile("BU1", LoadKind::Building)).unwrap();
        let err = map.submit(profile("HALL1", LoadKind::Building)).unwrap_err();
        assert_eq!(
            err,
            AggregationError::KindConflict {
                kind: LoadKind::Building,
                held_by: "BU".into(),
                client: "HALL".into(),
            }
        );
    }

    #[test]
    fn test_client_cannot_change_kind() {
        let mut map = RequestMap::new(3);
        map.submit(profile("X1", LoadKind::Building)).unwrap();
        assert!(matches!(
            map.submit(profile("X2", LoadKind::EvAggregate)),
            Err(AggregationError::KindChanged { .. })
        ));
    }
}
