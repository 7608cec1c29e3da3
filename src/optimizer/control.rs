// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Amount Optimizer
//
// generate → simulate → aggregate → compare, until the simulated counts
// match the real ones or a limit is reached. Strictly sequential: every
// iteration needs the output of the previous simulation.

use serde::Serialize;
use tracing::{info, warn};

use super::state::{OptimizationState, RunState};
use crate::collaborator::SimulationCycle;
use crate::config::OptimizerConfig;
use crate::error::Result;
use crate::store::{read_aggregate, SensorStore};

/// One comparison of simulated against real counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    /// Amount the compared simulation was generated with.
    pub amount: u64,
    pub simulated_total: u64,
    pub difference: i64,
    /// Step in effect after this iteration.
    pub step: i64,
    pub state: RunState,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationOutcome {
    pub state: RunState,
    pub final_amount: u64,
    pub iterations: u32,
    pub real_total: u64,
    pub last_difference: Option<i64>,
    pub history: Vec<IterationRecord>,
}

pub struct AmountOptimizer<'a, S: SensorStore + ?Sized, C: SimulationCycle> {
    store: &'a S,
    cycle: C,
    real_store: String,
    simulated_store: String,
    sensor_count: u32,
    config: OptimizerConfig,
}

impl<'a, S: SensorStore + ?Sized, C: SimulationCycle> AmountOptimizer<'a, S, C> {
    pub fn new(
        store: &'a S,
        cycle: C,
        real_store: impl Into<String>,
        simulated_store: impl Into<String>,
        sensor_count: u32,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            store,
            cycle,
            real_store: real_store.into(),
            simulated_store: simulated_store.into(),
            sensor_count,
            config,
        }
    }

    pub fn cycle(&self) -> &C {
        &self.cycle
    }

    /// Clear the previous simulation's rows, then regenerate for `amount`.
    fn refresh(&mut self, amount: u64) -> Result<()> {
        let removed = self.store.clear(&self.simulated_store)?;
        info!(removed, amount, "cleared simulated store, regenerating");
        self.cycle.regenerate(amount)
    }

    pub fn run(&mut self) -> Result<OptimizationOutcome> {
        self.run_from(OptimizationState::new(&self.config))
    }

    /// Run to a terminal state starting from `state`.
    pub fn run_from(&mut self, mut state: OptimizationState) -> Result<OptimizationOutcome> {
        let real = read_aggregate(self.store, &self.real_store, self.sensor_count)?;
        state.start();
        info!(
            sensors = self.sensor_count,
            real_total = real.total(),
            amount = state.current_amount,
            "optimizer started"
        );

        if self.config.prime_simulation {
            self.refresh(state.current_amount)?;
        }

        let mut history = Vec::new();
        loop {
            let simulated = read_aggregate(self.store, &self.simulated_store, self.sensor_count)?;
            let difference = simulated.signed_difference(&real);
            let amount = state.current_amount;
            let outcome = state.advance(difference);
            history.push(IterationRecord {
                iteration: state.iteration_count,
                amount,
                simulated_total: simulated.total(),
                difference,
                step: state.last_step,
                state: outcome,
            });
            info!(
                iteration = state.iteration_count,
                amount,
                difference,
                step = state.last_step,
                state = outcome.label(),
                "compared simulated counts"
            );

            if outcome.is_terminal() {
                match outcome {
                    RunState::Converged => info!(amount, "converged"),
                    other => warn!(amount, state = other.label(), "{}", other.description()),
                }
                break;
            }
            self.refresh(state.current_amount)?;
        }

        Ok(OptimizationOutcome {
            state: state.state,
            final_amount: state.current_amount,
            iterations: state.iteration_count,
            real_total: real.total(),
            last_difference: history.last().map(|r| r.difference),
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CalibrationError;
    use crate::store::WindowStats;
    use chrono::NaiveDateTime;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// In-memory store: the real counts are fixed, the simulated counts are
    /// a linear function of the last regenerated amount.
    struct FakeStore {
        real: Vec<u64>,
        simulated: RefCell<Vec<u64>>,
        log: RefCell<Vec<String>>,
        /// Simulated-store sensor whose count query fails.
        broken_sensor: Option<u32>,
    }

    impl SensorStore for FakeStore {
        fn count_for_sensor(&self, store: &str, sensor_id: u32) -> Result<u64> {
            if store != "real" && self.broken_sensor == Some(sensor_id) {
                return Err(CalibrationError::Connectivity(rusqlite::Error::QueryReturnedNoRows));
            }
            let i = (sensor_id - 1) as usize;
            Ok(match store {
                "real" => self.real[i],
                _ => self.simulated.borrow().get(i).copied().unwrap_or(0),
            })
        }

        fn clear(&self, store: &str) -> Result<usize> {
            self.log.borrow_mut().push(format!("clear {}", store));
            let n = self.simulated.borrow().len();
            self.simulated.borrow_mut().clear();
            Ok(n)
        }

        fn window_stats(
            &self,
            _: &str,
            _: u32,
            _: NaiveDateTime,
            _: NaiveDateTime,
        ) -> Result<Option<WindowStats>> {
            Ok(None)
        }

        fn earliest_timestamp(&self, _: &str) -> Result<Option<NaiveDateTime>> {
            Ok(None)
        }

        fn max_sensor_id(&self, _: &str) -> Result<u32> {
            Ok(self.real.len() as u32)
        }
    }

    /// Every sensor sees `amount * ratio` vehicles.
    struct LinearCycle<'a> {
        store: &'a FakeStore,
        ratio: f64,
        amounts: Vec<u64>,
        fail_at: Option<usize>,
    }

    impl SimulationCycle for LinearCycle<'_> {
        fn regenerate(&mut self, amount: u64) -> Result<()> {
            if self.fail_at == Some(self.amounts.len()) {
                return Err(CalibrationError::ProcessFailure {
                    program: "sumo".into(),
                    status: "exit code 1".into(),
                });
            }
            self.store.log.borrow_mut().push(format!("regenerate {}", amount));
            self.amounts.push(amount);
            let per_sensor = (amount as f64 * self.ratio) as u64;
            *self.store.simulated.borrow_mut() = vec![per_sensor; self.store.real.len()];
            Ok(())
        }
    }

    fn fake(real_per_sensor: u64, sensors: usize) -> FakeStore {
        FakeStore {
            real: vec![real_per_sensor; sensors],
            simulated: RefCell::new(Vec::new()),
            log: RefCell::new(Vec::new()),
            broken_sensor: None,
        }
    }

    /// Every sensor sees `per_sensor` vehicles whatever the amount. Fails
    /// once `limit` regenerations have run so a runaway loop ends.
    struct ConstantCycle<'a> {
        store: &'a FakeStore,
        per_sensor: u64,
        amounts: Vec<u64>,
        limit: usize,
    }

    impl SimulationCycle for ConstantCycle<'_> {
        fn regenerate(&mut self, amount: u64) -> Result<()> {
            if self.amounts.len() >= self.limit {
                return Err(CalibrationError::config("regeneration limit reached"));
            }
            self.amounts.push(amount);
            *self.store.simulated.borrow_mut() = vec![self.per_sensor; self.store.real.len()];
            Ok(())
        }
    }

    #[test]
    fn finds_amount_matching_real_counts() {
        // 13 sensors, each sees 1% of the amount; reality corresponds to 137_000.
        let store = fake(1_370, 13);
        let cycle = LinearCycle { store: &store, ratio: 0.01, amounts: Vec::new(), fail_at: None };
        let mut opt = AmountOptimizer::new(&store, cycle, "real", "sim", 13, OptimizerConfig::default());
        let out = opt.run().unwrap();

        assert_eq!(out.state, RunState::Converged);
        let diff = out.last_difference.unwrap();
        assert!(diff.abs() < 2_000, "difference {}", diff);
        assert_eq!(out.iterations as usize, out.history.len());
        assert_eq!(opt.cycle().amounts[0], 100_000, "primed with the initial amount");
    }

    #[test]
    fn store_is_cleared_before_every_regeneration() {
        let store = fake(1_370, 13);
        let cycle = LinearCycle { store: &store, ratio: 0.01, amounts: Vec::new(), fail_at: None };
        let mut opt = AmountOptimizer::new(&store, cycle, "real", "sim", 13, OptimizerConfig::default());
        opt.run().unwrap();

        let log = store.log.borrow();
        assert!(!log.is_empty());
        for pair in log.chunks(2) {
            assert_eq!(pair[0], "clear sim");
            assert!(pair[1].starts_with("regenerate "), "{:?}", pair);
        }
    }

    #[test]
    fn unreachable_demand_aborts_at_ceiling() {
        // Reality needs far more than the ceiling allows.
        let store = fake(10_000, 13);
        let cycle = LinearCycle { store: &store, ratio: 0.01, amounts: Vec::new(), fail_at: None };
        let mut opt = AmountOptimizer::new(&store, cycle, "real", "sim", 13, OptimizerConfig::default());
        let out = opt.run().unwrap();
        assert_eq!(out.state, RunState::AbortedLimit);
        assert!(out.final_amount > 200_000);
    }

    #[test]
    fn converged_start_does_not_regenerate_again() {
        let store = fake(1_000, 13);
        let cycle = LinearCycle { store: &store, ratio: 0.01, amounts: Vec::new(), fail_at: None };
        let mut opt = AmountOptimizer::new(&store, cycle, "real", "sim", 13, OptimizerConfig::default());
        let out = opt.run().unwrap();
        assert_eq!(out.state, RunState::Converged);
        assert_eq!(out.final_amount, 100_000);
        assert_eq!(out.iterations, 1);
        assert_eq!(opt.cycle().amounts, vec![100_000]);
    }

    #[test]
    fn collaborator_failure_aborts_the_loop() {
        let store = fake(10_000, 13);
        let cycle = LinearCycle { store: &store, ratio: 0.01, amounts: Vec::new(), fail_at: Some(2) };
        let mut opt = AmountOptimizer::new(&store, cycle, "real", "sim", 13, OptimizerConfig::default());
        let err = opt.run().unwrap_err();
        assert!(matches!(err, CalibrationError::ProcessFailure { .. }));
        assert_eq!(opt.cycle().amounts.len(), 2);
    }

    #[test]
    fn unprimed_run_compares_existing_simulation_first() {
        let store = fake(1_000, 2);
        *store.simulated.borrow_mut() = vec![1_100, 1_000];
        let cycle = LinearCycle { store: &store, ratio: 0.01, amounts: Vec::new(), fail_at: None };
        let config = OptimizerConfig { prime_simulation: false, ..OptimizerConfig::default() };
        let mut opt = AmountOptimizer::new(&store, cycle, "real", "sim", 2, config);
        let out = opt.run().unwrap();
        assert_eq!(out.state, RunState::Converged);
        assert_eq!(out.history[0].difference, 100);
        assert!(opt.cycle().amounts.is_empty());
    }

    #[test]
    fn history_tracks_each_amount() {
        let store = fake(1_370, 13);
        let cycle = LinearCycle { store: &store, ratio: 0.01, amounts: Vec::new(), fail_at: None };
        let mut opt = AmountOptimizer::new(&store, cycle, "real", "sim", 13, OptimizerConfig::default());
        let out = opt.run().unwrap();
        let compared: Vec<u64> = out.history.iter().map(|r| r.amount).collect();
        let mut generated: HashMap<u64, usize> = HashMap::new();
        for a in &opt.cycle().amounts {
            *generated.entry(*a).or_default() += 1;
        }
        for amount in compared {
            assert!(generated.contains_key(&amount), "{} compared but never generated", amount);
        }
    }

    #[test]
    fn persistent_overshoot_stops_at_zero_amount() {
        let store = fake(10, 13);
        let cycle = ConstantCycle { store: &store, per_sensor: 5_000, amounts: Vec::new(), limit: 500 };
        let mut opt = AmountOptimizer::new(&store, cycle, "real", "sim", 13, OptimizerConfig::default());
        let out = opt.run().unwrap();
        assert_eq!(out.state, RunState::AbortedStep);
        assert_eq!(out.final_amount, 0);
        assert!(opt.cycle().amounts.len() < 10, "{} regenerations", opt.cycle().amounts.len());
    }

    #[test]
    fn failing_sensor_read_discards_the_aggregate() {
        let mut store = fake(1_370, 13);
        store.broken_sensor = Some(7);
        let cycle = LinearCycle { store: &store, ratio: 0.01, amounts: Vec::new(), fail_at: None };
        let mut opt = AmountOptimizer::new(&store, cycle, "real", "sim", 13, OptimizerConfig::default());
        let err = opt.run().unwrap_err();
        assert!(matches!(err, CalibrationError::Connectivity(_)), "{:?}", err);
        // Primed once, then the partial read stops the run before any comparison.
        assert_eq!(opt.cycle().amounts, vec![100_000]);
    }
}
