//! Full dispatch cycles through the public API: the reference three-client
//! scenario against both strategies, and a simulated microgrid with replica
//! groups in front of the coordinator.

use std::sync::Arc;
use std::time::Duration;

use microgrid_coordinator::config::{Config, OptimizerConfig, StrategyKind};
use microgrid_coordinator::coordinator::{Coordinator, CoordinatorAction, CoordinatorInput, CycleReport};
use microgrid_coordinator::domain::{
    BatteryParams, ClientId, DispatchCommand, GridPowerMode, GridSettings, GridSupplyProfile, LoadKind,
    MicrogridMode, Observation, PowerRequest, ReplicaId, Timestamp, HORIZON,
};
use microgrid_coordinator::optimizer::{DispatchOptimizer, DispatchProblem, SolveStatus};
use microgrid_coordinator::simulation::Microgrid;
use microgrid_coordinator::telemetry::{ChannelSink, EventKind, TelemetryEvent};
use proptest::prelude::*;
use tokio::sync::mpsc;

const SUPPLY_TOL: f64 = 1e-2;
const SOC_TOL: f64 = 1e-3;

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

fn requests(building: Vec<f64>, ev: Vec<f64>) -> Vec<PowerRequest> {
    let ts = Timestamp::parse("2024-03-01 13:00:00").unwrap();
    vec![
        Observation::profile("BU1".into(), LoadKind::Building, ts, building, 480.0).unwrap(),
        Observation::profile("EV1".into(), LoadKind::EvAggregate, ts, ev, 90.0).unwrap(),
        Observation::battery("BESS1".into(), ts, params(), 0.0).unwrap(),
    ]
    .iter()
    .map(Observation::to_request)
    .collect()
}

fn constant_supply(strategy: StrategyKind, supply: f64) -> Config {
    let mut cfg = Config::default();
    cfg.grid.grid_power_mode = GridPowerMode::Constant;
    cfg.grid.grid_power = supply;
    cfg.optimizer.strategy = strategy;
    cfg
}

fn run_cycle(cfg: &Config, requests: Vec<PowerRequest>) -> (Vec<(ClientId, DispatchCommand)>, CycleReport) {
    let mut coordinator = Coordinator::new("C1".into(), "coordinator", cfg);
    let mut actions = Vec::new();
    for request in requests {
        actions.extend(coordinator.handle(CoordinatorInput::Submit(request)));
    }
    let mut dispatches = Vec::new();
    let mut report = None;
    for action in actions {
        match action {
            CoordinatorAction::SendDispatch { client, command } => dispatches.push((client, command)),
            CoordinatorAction::Report(r) => report = Some(*r),
            _ => {}
        }
    }
    (dispatches, report.expect("a complete buffer runs one cycle"))
}

fn vector<'a>(dispatches: &'a [(ClientId, DispatchCommand)], client: &str) -> &'a [f64] {
    dispatches
        .iter()
        .find(|(c, _)| c.0 == client)
        .map(|(_, d)| d.vector())
        .unwrap_or_else(|| panic!("no dispatch for {}", client))
}

fn check_reference_scenario(strategy: StrategyKind) {
    let cfg = constant_supply(strategy, 1000.0);
    let (dispatches, report) = run_cycle(&cfg, requests(vec![500.0; HORIZON], vec![100.0; HORIZON]));

    assert_eq!(report.status, Some(SolveStatus::Solved));
    assert!(!report.fallback);
    assert_eq!(dispatches.len(), 3);

    let bu = vector(&dispatches, "BU");
    let ev = vector(&dispatches, "EV");
    let bess = vector(&dispatches, "BESS");
    for j in 0..HORIZON {
        assert!(bu[j] + ev[j] + bess[j] <= 1000.0 + SUPPLY_TOL);
        assert!(bu[j] >= 0.0 && bu[j] <= 500.0);
        assert!(ev[j] >= 0.0 && ev[j] <= 100.0);
        assert!(bess[j].abs() <= 50.0);
    }

    let mut soc = 0.5;
    for x in bess {
        soc += x / 1000.0;
        assert!(soc >= 0.2 - SOC_TOL && soc <= 0.8 + SOC_TOL);
    }
    assert!((soc - 0.5).abs() < SOC_TOL);
    let battery = report.battery.expect("battery in report");
    assert!((battery.projected_final_soc - 0.5).abs() < SOC_TOL);
}

#[test]
fn test_reference_scenario_quadratic() {
    check_reference_scenario(StrategyKind::Quadratic);
}

#[cfg(feature = "optimization")]
#[test]
fn test_reference_scenario_linear() {
    check_reference_scenario(StrategyKind::Linear);
}

#[test]
fn test_wire_tuples_in_and_out() {
    let cfg = constant_supply(StrategyKind::Quadratic, 1000.0);
    let raw = serde_json::json!([
        ["BU2", "BU", "2024-03-01 13:00:00", vec![500.0; HORIZON], 480.0],
        ["EV1", "EV", "2024-03-01 13:00:00", vec![100.0; HORIZON], 90.0],
        ["BESS3", "BESS", "2024-03-01 13:00:00",
            {"Rbess": 50.0, "Cbattery": 1000.0, "SoC": 0.5, "SoCl": 0.2, "SoCu": 0.8, "SoCend": 0.5}, 0.0]
    ]);
    let requests: Vec<PowerRequest> = serde_json::from_value(raw).unwrap();
    let (dispatches, _) = run_cycle(&cfg, requests);

    let (client, command) = dispatches.iter().find(|(c, _)| c.0 == "BESS").unwrap();
    assert_eq!(client, &ReplicaId::from("BESS3").client_id());
    let json = serde_json::to_value(command).unwrap();
    assert_eq!(json[0], "BESS");
    assert_eq!(json[1].as_array().unwrap().len(), HORIZON);
}

fn dispatch_mode(mode: u8) -> (MicrogridMode, GridPowerMode) {
    match mode {
        0 => (MicrogridMode::Islanded, GridPowerMode::Constant),
        1 => (MicrogridMode::GridConnected, GridPowerMode::Constant),
        _ => (MicrogridMode::GridConnected, GridPowerMode::DayAhead),
    }
}

prop_compose! {
    fn battery_params()(
        rating in 5.0f64..80.0,
        capacity in 200.0f64..2000.0,
        soc_lower in 0.05f64..0.4,
        soc_upper in 0.6f64..0.95,
        start in 0.0f64..=1.0,
        end in 0.0f64..=1.0,
    ) -> BatteryParams {
        let band = soc_upper - soc_lower;
        BatteryParams {
            rating,
            capacity,
            soc: soc_lower + start * band,
            soc_lower,
            soc_upper,
            soc_end: soc_lower + end * band,
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_dispatch_respects_bounds_and_supply(
        building in prop::collection::vec(0.0f64..800.0, HORIZON),
        ev in prop::collection::vec(0.0f64..300.0, HORIZON),
        purchased in prop::collection::vec(0.0f64..1500.0, HORIZON),
        grid_power in 0.0f64..1500.0,
        mode in 0u8..3,
        params in battery_params(),
    ) {
        let ts = Timestamp::parse("2024-03-01 13:00:00").unwrap();
        let observations = vec![
            Observation::profile("BU1".into(), LoadKind::Building, ts, building.clone(), 480.0).unwrap(),
            Observation::profile("EV1".into(), LoadKind::EvAggregate, ts, ev.clone(), 90.0).unwrap(),
            Observation::battery("BESS1".into(), ts, params, 0.0).unwrap(),
        ];
        let (microgrid_mode, grid_power_mode) = dispatch_mode(mode);
        let settings = GridSettings {
            microgrid_mode,
            grid_power_mode,
            grid_power,
            ..GridSettings::default()
        };
        let supply = GridSupplyProfile::select(&settings, &purchased);
        let cfg = OptimizerConfig::default();
        let problem = DispatchProblem::build(&observations, &supply, &settings, &cfg, HORIZON).unwrap();
        let result = DispatchOptimizer::from_config(&cfg).optimize(&problem);

        if problem.check_feasibility().is_err() {
            prop_assert_eq!(result.unwrap_err().status(), Some(SolveStatus::Infeasible));
            return Ok(());
        }
        let solution = match result {
            Ok(solution) => solution,
            Err(e) => return Err(TestCaseError::fail(format!("feasible instance not solved: {}", e))),
        };

        let bu = solution.dispatch[&ClientId::from("BU")].vector();
        let evd = solution.dispatch[&ClientId::from("EV")].vector();
        let bess = solution.dispatch[&ClientId::from("BESS")].vector();
        for j in 0..HORIZON {
            prop_assert!(bu[j] >= 0.0 && bu[j] <= building[j]);
            prop_assert!(evd[j] >= 0.0 && evd[j] <= ev[j]);
            prop_assert!(bess[j].abs() <= params.rating);
            prop_assert!(bu[j] + evd[j] + bess[j] <= problem.supply[j] + SUPPLY_TOL);
        }

        let soc = problem.battery.projected_soc(bess);
        for s in &soc {
            prop_assert!(*s >= params.soc_lower - SOC_TOL && *s <= params.soc_upper + SOC_TOL);
        }
        prop_assert!((soc[HORIZON - 1] - params.soc_end).abs() < SOC_TOL);
    }
}

async fn wait_for(
    telemetry: &mut mpsc::UnboundedReceiver<TelemetryEvent>,
    event: EventKind,
    id: &str,
) -> TelemetryEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let ev = telemetry.recv().await.expect("telemetry channel open");
            if ev.event == event && ev.id == id {
                return ev;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} from {}", event, id))
}

fn sim_config() -> Config {
    let mut cfg = Config::default();
    cfg.sim.replicas_per_load = 3;
    cfg.sim.replica_noise = 0.01;
    cfg
}

#[tokio::test]
async fn test_simulated_microgrid_runs_a_cycle() {
    let (sink, mut telemetry) = ChannelSink::new();
    let (mut grid, mut reports) = Microgrid::start(&sim_config(), Arc::new(sink)).unwrap();
    grid.tick().unwrap();

    let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.cycle, 1);
    assert_eq!(report.status, Some(SolveStatus::Solved));
    let mut clients: Vec<String> = report.clients.iter().map(|c| c.client.to_string()).collect();
    clients.sort();
    assert_eq!(clients, vec!["BESS", "BU", "EV"]);

    // the battery group leader applies the immediate step
    let actuated = wait_for(&mut telemetry, EventKind::Actuate, "BESS1").await;
    assert_eq!(actuated.group, "BESS");

    grid.shutdown();
}

#[tokio::test]
async fn test_losing_a_leader_falls_back_to_singletons() {
    let (sink, _telemetry) = ChannelSink::new();
    let (mut grid, mut reports) = Microgrid::start(&sim_config(), Arc::new(sink)).unwrap();
    grid.fail_replica(&"BU1".into());
    assert_eq!(grid.group(LoadKind::Building).unwrap().view().size, 2);

    grid.tick().unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(report.clients.iter().any(|c| c.kind == LoadKind::Building));

    grid.shutdown();
}
