//! Coordinator state machine: collects one approved observation per load
//! kind, runs the dispatch optimizer once the set is complete, and hands the
//! resulting allocations back to the clients.
//!
//! Like the replica agent it performs no I/O; [`CoordinatorAction`]s are
//! executed by [`super::CoordinatorService`].

use std::time::Duration;
use tracing::{debug, error, info, warn};
use validator::Validate;

use super::forecast::PurchaseForecast;
use super::report::{CycleOutcome, CycleReport};
use super::requests::{RequestMap, SubmitOutcome};
use crate::config::{Config, CoordinatorConfig, OptimizerConfig};
use crate::consensus::Role;
use crate::domain::{
    ClientId, DispatchCommand, DispatchMap, GridCommand, GridSettings, GridSupplyProfile,
    LoadKind, PowerRequest, ReplicaId,
};
use crate::group::{GroupEvent, MembershipView};
use crate::optimizer::{fallback_map, DispatchOptimizer, DispatchProblem, SolveStatus};
use crate::telemetry::{EventKind, TelemetryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorTimer {
    /// Re-evaluate readiness and leadership while requests are buffered
    Recheck,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorInput {
    Submit(PowerRequest),
    Grid(GridCommand),
    Group(GroupEvent),
    Timer(CoordinatorTimer),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorAction {
    SendDispatch { client: ClientId, command: DispatchCommand },
    Report(Box<CycleReport>),
    ArmTimer { timer: CoordinatorTimer, after: Duration },
    HaltTimer(CoordinatorTimer),
    Telemetry(TelemetryEvent),
}

pub struct Coordinator {
    id: ReplicaId,
    cfg: CoordinatorConfig,
    optimizer_cfg: OptimizerConfig,
    optimizer: DispatchOptimizer,
    settings: GridSettings,
    requests: RequestMap,
    purchased: PurchaseForecast,
    last_dispatch: DispatchMap,
    view: MembershipView,
    role: Role,
    recheck_armed: bool,
    waited_checks: u32,
    stall_reported: bool,
    cycles: u64,
}

impl Coordinator {
    pub fn new(id: ReplicaId, group: impl Into<String>, cfg: &Config) -> Self {
        Self::with_optimizer(id, group, cfg, DispatchOptimizer::from_config(&cfg.optimizer))
    }

    pub fn with_optimizer(
        id: ReplicaId,
        group: impl Into<String>,
        cfg: &Config,
        optimizer: DispatchOptimizer,
    ) -> Self {
        let view = MembershipView::alone(group);
        let role = Role::from_view(&view, &id);
        Self {
            id,
            requests: RequestMap::new(cfg.coordinator.clients_per_cycle),
            purchased: PurchaseForecast::new(cfg.coordinator.initial_purchased_power, cfg.coordinator.horizon),
            cfg: cfg.coordinator.clone(),
            optimizer_cfg: cfg.optimizer.clone(),
            optimizer,
            settings: cfg.grid.settings(),
            last_dispatch: DispatchMap::new(),
            view,
            role,
            recheck_armed: false,
            waited_checks: 0,
            stall_reported: false,
            cycles: 0,
        }
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn settings(&self) -> &GridSettings {
        &self.settings
    }

    pub fn requests(&self) -> &RequestMap {
        &self.requests
    }

    pub fn purchase_forecast(&self) -> Vec<f64> {
        self.purchased.values()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn handle(&mut self, input: CoordinatorInput) -> Vec<CoordinatorAction> {
        let mut out = Vec::new();
        match input {
            CoordinatorInput::Submit(request) => self.on_submit(request, &mut out),
            CoordinatorInput::Grid(command) => self.on_grid(command, &mut out),
            CoordinatorInput::Group(event) => self.on_group(event, &mut out),
            CoordinatorInput::Timer(CoordinatorTimer::Recheck) => {
                self.recheck_armed = false;
                self.on_recheck(&mut out);
            }
        }
        out
    }

    fn on_submit(&mut self, request: PowerRequest, out: &mut Vec<CoordinatorAction>) {
        let replica = request.0.clone();
        let obs = match request.into_observation() {
            Ok(obs) => obs,
            Err(e) => {
                warn!(coordinator = %self.id, from = %replica, error = %e, "rejecting malformed request");
                out.push(self.event(EventKind::RequestRejected, replica.to_string()));
                return;
            }
        };
        let client = obs.client_id();
        info!(coordinator = %self.id, client = %client, kind = %obs.kind, "request received");

        match self.requests.submit(obs) {
            Ok(SubmitOutcome::Inserted) => {
                out.push(self.event(EventKind::ReqPower, client.to_string()));
            }
            Ok(SubmitOutcome::Replaced) => {
                warn!(coordinator = %self.id, client = %client, "duplicate request, keeping the newest");
                out.push(self.event(EventKind::DuplicateRequest, client.to_string()));
            }
            Err(e) => {
                warn!(coordinator = %self.id, client = %client, error = %e, "request rejected");
                out.push(self.event(EventKind::RequestRejected, client.to_string()));
                return;
            }
        }
        self.evaluate(out);
    }

    fn on_grid(&mut self, command: GridCommand, out: &mut Vec<CoordinatorAction>) {
        if let Err(e) = command.validate() {
            warn!(coordinator = %self.id, error = %e, "rejecting grid command");
            return;
        }
        self.settings = GridSettings::from(command);
        info!(
            coordinator = %self.id,
            microgrid_mode = ?self.settings.microgrid_mode,
            grid_power_mode = ?self.settings.grid_power_mode,
            grid_power = self.settings.grid_power,
            "grid settings updated"
        );
        out.push(self.event(EventKind::GridData, self.id.to_string()));
    }

    fn on_group(&mut self, event: GroupEvent, out: &mut Vec<CoordinatorAction>) {
        let Some(view) = event.view().cloned() else {
            debug!(coordinator = %self.id, "ignoring non-membership group event");
            return;
        };
        self.view = view;
        match &event {
            GroupEvent::LeaderElected { leader, .. } => {
                out.push(self.event(EventKind::LeaderElected, leader.to_string()));
            }
            GroupEvent::LeaderExited { leader, .. } => {
                out.push(self.event(EventKind::LeaderLeft, leader.to_string()));
            }
            GroupEvent::MemberLeft { member, .. } => {
                out.push(self.event(EventKind::MemberLeft, member.to_string()));
            }
            _ => {}
        }
        let role = Role::from_view(&self.view, &self.id);
        if role != self.role {
            info!(coordinator = %self.id, from = ?self.role, to = ?role, "role changed");
            self.role = role;
            self.evaluate(out);
        }
    }

    fn on_recheck(&mut self, out: &mut Vec<CoordinatorAction>) {
        if self.requests.is_empty() {
            return;
        }
        self.waited_checks += 1;
        let waited = self.cfg.recheck() * self.waited_checks;
        if !self.requests.is_complete() && waited >= self.cfg.stall_warning() && !self.stall_reported {
            warn!(
                coordinator = %self.id,
                buffered = self.requests.len(),
                waited_ms = waited.as_millis() as u64,
                "aggregation stalled"
            );
            self.stall_reported = true;
            out.push(self.event(EventKind::AggregationStalled, self.id.to_string()));
        }
        self.evaluate(out);
    }

    /// Decides what to do with the buffer given the current role.
    fn evaluate(&mut self, out: &mut Vec<CoordinatorAction>) {
        if self.requests.is_empty() {
            self.halt_recheck(out);
            return;
        }
        if !self.requests.is_complete() {
            self.arm_recheck(out);
            return;
        }
        match self.role.clone() {
            Role::Leader | Role::Singleton => self.run_cycle(out),
            Role::Follower { leader: Some(leader) } => {
                info!(coordinator = %self.id, leader = %leader, "leader coordinator owns dispatch, discarding buffer");
                self.requests.clear();
                self.reset_wait();
                self.halt_recheck(out);
            }
            Role::Follower { leader: None } => {
                info!(coordinator = %self.id, "no coordinator leader yet, holding requests");
                self.arm_recheck(out);
            }
        }
    }

    fn run_cycle(&mut self, out: &mut Vec<CoordinatorAction>) {
        let observations = self.requests.take();
        self.reset_wait();
        self.halt_recheck(out);
        self.cycles += 1;

        let newest: f64 = observations
            .iter()
            .filter(|o| o.kind.is_sheddable())
            .filter_map(|o| o.predicted_profile().and_then(|p| p.last()))
            .sum();
        self.purchased.roll(newest);
        let supply = GridSupplyProfile::select(&self.settings, &self.purchased.values());

        info!(
            coordinator = %self.id,
            cycle = self.cycles,
            strategy = self.optimizer.strategy_name(),
            "running dispatch optimization"
        );
        out.push(self.event(EventKind::Optimization, self.optimizer.strategy_name().to_string()));

        let result = DispatchProblem::build(
            &observations,
            &supply,
            &self.settings,
            &self.optimizer_cfg,
            self.cfg.horizon,
        )
        .and_then(|problem| self.optimizer.optimize(&problem));

        let (dispatch, outcome) = match result {
            Ok(solution) => {
                info!(coordinator = %self.id, cycle = self.cycles, objective = solution.objective, "dispatch solved");
                (
                    solution.dispatch,
                    CycleOutcome {
                        status: Some(SolveStatus::Solved),
                        objective: Some(solution.objective),
                        fallback: false,
                        error: None,
                    },
                )
            }
            Err(e) => {
                error!(
                    coordinator = %self.id,
                    cycle = self.cycles,
                    error = %e,
                    policy = ?self.cfg.fallback,
                    "dispatch failed, applying fallback"
                );
                out.push(self.event(EventKind::DispatchFallback, self.id.to_string()));
                let clients: Vec<(ClientId, LoadKind)> =
                    observations.iter().map(|o| (o.client_id(), o.kind)).collect();
                let dispatch = fallback_map(
                    self.cfg.fallback,
                    clients.iter().map(|(c, k)| (c, *k)),
                    &self.last_dispatch,
                    self.cfg.horizon,
                );
                (
                    dispatch,
                    CycleOutcome {
                        status: e.status(),
                        objective: None,
                        fallback: true,
                        error: Some(e.to_string()),
                    },
                )
            }
        };

        for (client, command) in &dispatch {
            debug!(coordinator = %self.id, client = %client, immediate = ?command.immediate(), "sending dispatch");
            out.push(self.event(EventKind::SendPower, client.to_string()));
            out.push(CoordinatorAction::SendDispatch {
                client: client.clone(),
                command: command.clone(),
            });
        }

        let report = CycleReport::new(
            self.cycles,
            self.settings,
            supply.values().to_vec(),
            &observations,
            &dispatch,
            outcome,
        );
        out.push(CoordinatorAction::Report(Box::new(report)));
        self.last_dispatch = dispatch;
    }

    fn reset_wait(&mut self) {
        self.waited_checks = 0;
        self.stall_reported = false;
    }

    fn arm_recheck(&mut self, out: &mut Vec<CoordinatorAction>) {
        if !self.recheck_armed {
            self.recheck_armed = true;
            out.push(CoordinatorAction::ArmTimer {
                timer: CoordinatorTimer::Recheck,
                after: self.cfg.recheck(),
            });
        }
    }

    fn halt_recheck(&mut self, out: &mut Vec<CoordinatorAction>) {
        if self.recheck_armed {
            self.recheck_armed = false;
            out.push(CoordinatorAction::HaltTimer(CoordinatorTimer::Recheck));
        }
    }

    fn event(&self, kind: EventKind, target: String) -> CoordinatorAction {
        CoordinatorAction::Telemetry(TelemetryEvent::new(
            kind,
            self.view.group.clone(),
            self.id.to_string(),
            target,
        ))
    }
}
