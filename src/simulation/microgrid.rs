//! In-process microgrid: one replica group per load kind, a coordinator, and
//! simulated devices, wired together with tokio channels.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime, Timelike};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::battery::BatterySimulator;
use super::load::LoadSimulator;
use crate::config::{Config, SimConfig};
use crate::consensus::{ConsensusAgent, Input, ReplicaOutputs, ReplicaRuntime};
use crate::coordinator::{Coordinator, CoordinatorInput, CoordinatorOutputs, CoordinatorService, CycleReport};
use crate::domain::{BatteryParams, DeviceCommand, GridCommand, LoadKind, PowerRequest, ReplicaId, Timestamp};
use crate::group::local::LocalGroup;
use crate::telemetry::EventSink;

/// Coordinator group name and member id used by the simulation
pub const COORDINATOR_GROUP: &str = "coordinator";
pub const COORDINATOR_ID: &str = "C1";

enum Source {
    Load(LoadSimulator),
    Battery,
}

struct SimReplica {
    id: ReplicaId,
    source: Source,
    inputs: mpsc::UnboundedSender<Input>,
}

pub struct Microgrid {
    replicas: Vec<SimReplica>,
    groups: BTreeMap<LoadKind, LocalGroup>,
    coordinator_group: LocalGroup,
    battery: Arc<Mutex<BatterySimulator>>,
    coordinator: mpsc::UnboundedSender<CoordinatorInput>,
    tasks: Vec<JoinHandle<Result<()>>>,
    clock: NaiveDateTime,
}

impl Microgrid {
    /// Spawns every replica, the coordinator and the forwarding tasks. Must be
    /// called from within a tokio runtime. Cycle reports arrive on the
    /// returned receiver.
    pub fn start(cfg: &Config, sink: Arc<dyn EventSink>) -> Result<(Self, mpsc::UnboundedReceiver<CycleReport>)> {
        let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();

        let (coordinator_tx, coordinator_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();
        let (report_tx, reports) = mpsc::unbounded_channel();
        let coordinator_group = LocalGroup::new(COORDINATOR_GROUP);
        let coordinator_id = ReplicaId::from(COORDINATOR_ID);
        let (_, coordinator_events) = coordinator_group.join(coordinator_id.clone());
        let service = CoordinatorService::new(
            Coordinator::new(coordinator_id, COORDINATOR_GROUP, cfg),
            CoordinatorOutputs {
                dispatches: dispatch_tx,
                reports: report_tx,
            },
            sink.clone(),
        );
        tasks.push(tokio::spawn(service.run(coordinator_rx, coordinator_events)));

        let battery = Arc::new(Mutex::new(BatterySimulator::new(battery_params(&cfg.sim))));
        let (submission_tx, mut submission_rx) = mpsc::unbounded_channel::<PowerRequest>();
        let (actuation_tx, mut actuation_rx) = mpsc::unbounded_channel::<(ReplicaId, DeviceCommand)>();

        let mut replicas = Vec::new();
        let mut groups = BTreeMap::new();
        for kind in LoadKind::iter() {
            let group = LocalGroup::new(kind.to_string());
            for index in 1..=cfg.sim.replicas_per_load {
                let id = ReplicaId::new(format!("{}{}", kind, index));
                let (handle, events) = group.join(id.clone());
                let (inputs, input_rx) = mpsc::unbounded_channel();
                let agent = ConsensusAgent::new(id.clone(), kind.to_string(), kind, cfg.consensus.clone());
                let runtime = ReplicaRuntime::new(
                    agent,
                    handle,
                    ReplicaOutputs {
                        submissions: submission_tx.clone(),
                        actuations: actuation_tx.clone(),
                    },
                    sink.clone(),
                );
                tasks.push(tokio::spawn(runtime.run(input_rx, events)));

                let source = match kind {
                    LoadKind::Building => Source::Load(LoadSimulator::new(
                        kind,
                        cfg.sim.building_power,
                        cfg.sim.replica_noise,
                        None,
                    )),
                    LoadKind::EvAggregate => {
                        Source::Load(LoadSimulator::new(kind, cfg.sim.ev_power, cfg.sim.replica_noise, None))
                    }
                    LoadKind::Battery => Source::Battery,
                };
                replicas.push(SimReplica { id, source, inputs });
            }
            let leader = group
                .elect_first()
                .with_context(|| format!("electing leader of group {}", kind))?;
            info!(group = %kind, leader = ?leader, size = group.view().size, "replica group ready");
            groups.insert(kind, group);
        }
        drop(submission_tx);
        drop(actuation_tx);

        let forward = coordinator_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(request) = submission_rx.recv().await {
                if forward.send(CoordinatorInput::Submit(request)).is_err() {
                    break;
                }
            }
            Ok(())
        }));

        let replica_inputs: Vec<_> = replicas.iter().map(|r| r.inputs.clone()).collect();
        tasks.push(tokio::spawn(async move {
            while let Some((client, command)) = dispatch_rx.recv().await {
                debug!(client = %client, kind = %command.kind(), "broadcasting dispatch to replicas");
                for inputs in &replica_inputs {
                    let _ = inputs.send(Input::Dispatch(command.clone()));
                }
            }
            Ok(())
        }));

        let device = battery.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((replica, command)) = actuation_rx.recv().await {
                match command {
                    DeviceCommand::UpdateSoc(power) => {
                        let mut battery = device.lock();
                        battery.apply(power);
                        info!(replica = %replica, power, soc = battery.soc(), "battery actuated");
                    }
                    DeviceCommand::LimitPower(power) => {
                        info!(replica = %replica, limit = power, "load limited");
                    }
                }
            }
            Ok(())
        }));

        let now = Timestamp::now().0;
        Ok((
            Self {
                replicas,
                groups,
                coordinator_group,
                battery,
                coordinator: coordinator_tx,
                tasks,
                clock: now.date().and_hms_opt(now.hour(), 0, 0).unwrap_or(now),
            },
            reports,
        ))
    }

    /// Advances the simulated clock by one step and feeds every replica a fresh reading.
    pub fn tick(&mut self) -> Result<()> {
        self.clock += Duration::hours(1);
        let battery = self.battery.lock().clone();
        for replica in &mut self.replicas {
            let obs = match &mut replica.source {
                Source::Load(sim) => sim.reading(replica.id.clone(), self.clock),
                Source::Battery => battery.reading(replica.id.clone(), self.clock),
            }
            .with_context(|| format!("reading for {}", replica.id))?;
            replica
                .inputs
                .send(Input::Observation(obs))
                .with_context(|| format!("replica {} stopped", replica.id))?;
        }
        debug!(clock = %Timestamp(self.clock), "simulation tick");
        Ok(())
    }

    pub fn grid(&self, command: GridCommand) -> Result<()> {
        self.coordinator
            .send(CoordinatorInput::Grid(command))
            .context("coordinator stopped")
    }

    /// Removes a replica from its group, as if its process had crashed.
    pub fn fail_replica(&mut self, id: &ReplicaId) {
        for group in self.groups.values() {
            group.leave(id);
        }
        self.replicas.retain(|r| &r.id != id);
    }

    pub fn group(&self, kind: LoadKind) -> Option<&LocalGroup> {
        self.groups.get(&kind)
    }

    pub fn coordinator_group(&self) -> &LocalGroup {
        &self.coordinator_group
    }

    pub fn battery_soc(&self) -> f64 {
        self.battery.lock().soc()
    }

    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(replicas = self.replicas.len(), "microgrid stopped");
    }
}

fn battery_params(cfg: &SimConfig) -> BatteryParams {
    BatteryParams {
        rating: cfg.battery_rating,
        capacity: cfg.battery_capacity,
        soc: cfg.battery_soc,
        soc_lower: cfg.battery_soc_lower,
        soc_upper: cfg.battery_soc_upper,
        soc_end: cfg.battery_soc_end,
    }
}
