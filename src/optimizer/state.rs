// Copyright 2026 Hypermesh Foundation. All rights reserved.
// Traffic Demand Calibrator - Optimizer State
//
// The damped bisection over the total trip amount, free of any I/O so each
// decision can be checked on its own.

use serde::{Deserialize, Serialize};

use crate::config::OptimizerConfig;

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Real aggregate not read yet.
    Init,
    Running,
    /// Simulated counts are within the tolerance band of the real counts.
    Converged,
    /// Amount exceeded the ceiling; calibrators have to absorb the rest.
    AbortedLimit,
    /// Step size collapsed below the step tolerance, or the amount is zero
    /// and the simulation still overshoots.
    AbortedStep,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::AbortedLimit | Self::AbortedStep)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Running => "RUNNING",
            Self::Converged => "CONVERGED",
            Self::AbortedLimit => "ABORTED_LIMIT",
            Self::AbortedStep => "ABORTED_STEP",
        }
    }

    /// Human-readable description of this state.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Init => "waiting for the real sensor aggregate",
            Self::Running => "adjusting the trip amount",
            Self::Converged => "simulated counts match the real counts within tolerance",
            Self::AbortedLimit => {
                "amount ceiling exceeded, base demand no longer credible; calibrate manually"
            }
            Self::AbortedStep => {
                "step size collapsed or amount already zero, the search cannot refine further"
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OptimizationState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationState {
    pub current_amount: u64,
    /// Signed change applied last; its sign is the current search direction.
    pub last_step: i64,
    pub tolerance_difference: i64,
    pub tolerance_step: i64,
    pub amount_ceiling: u64,
    pub iteration_count: u32,
    pub state: RunState,
}

impl OptimizationState {
    pub fn new(config: &OptimizerConfig) -> Self {
        let initial_step = config
            .initial_step
            .unwrap_or_else(|| i64::try_from(config.initial_amount / 2).unwrap_or(i64::MAX));
        Self {
            current_amount: config.initial_amount,
            last_step: initial_step,
            tolerance_difference: config.tolerance_difference,
            tolerance_step: config.tolerance_step,
            amount_ceiling: config.amount_ceiling,
            iteration_count: 0,
            state: RunState::Init,
        }
    }

    /// Same thresholds, different starting point.
    pub fn starting_at(config: &OptimizerConfig, amount: u64, step: i64) -> Self {
        Self {
            current_amount: amount,
            last_step: step,
            ..Self::new(config)
        }
    }

    pub fn start(&mut self) {
        if self.state == RunState::Init {
            self.state = RunState::Running;
        }
    }

    /// `-tol < difference < tol`.
    pub fn within_tolerance(&self, difference: i64) -> bool {
        -self.tolerance_difference < difference && difference < self.tolerance_difference
    }

    pub fn step_collapsed(&self) -> bool {
        -self.tolerance_step < self.last_step && self.last_step < self.tolerance_step
    }

    pub fn above_ceiling(&self) -> bool {
        self.current_amount > self.amount_ceiling
    }

    /// Already at zero trips and still overshooting: no lower amount exists.
    pub fn at_floor(&self, difference: i64) -> bool {
        self.current_amount == 0 && difference > 0
    }

    /// Next signed step for a difference. Undershooting while moving down,
    /// or overshooting while moving up, flips the direction and halves the
    /// step. Otherwise the step is kept.
    pub fn next_step(last_step: i64, difference: i64) -> i64 {
        if difference < 0 && last_step < 0 {
            (last_step / 2).saturating_abs()
        } else if difference > 0 && last_step > 0 {
            -(last_step / 2)
        } else {
            last_step
        }
    }

    /// Feed the difference of one simulated run. Either the state turns
    /// terminal or the amount moves by the next step.
    pub fn advance(&mut self, difference: i64) -> RunState {
        self.start();
        self.iteration_count += 1;

        if self.within_tolerance(difference) {
            self.state = RunState::Converged;
        } else if self.step_collapsed() || self.at_floor(difference) {
            self.state = RunState::AbortedStep;
        } else if self.above_ceiling() {
            self.state = RunState::AbortedLimit;
        } else if difference != 0 {
            self.last_step = Self::next_step(self.last_step, difference);
            self.current_amount = self.current_amount.saturating_add_signed(self.last_step);
        }
        self.state
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OptimizerConfig {
        OptimizerConfig::default()
    }

    #[test]
    fn initial_step_is_half_the_amount() {
        let s = OptimizationState::new(&config());
        assert_eq!(s.current_amount, 100_000);
        assert_eq!(s.last_step, 50_000);
        assert_eq!(s.state, RunState::Init);
    }

    #[test]
    fn small_difference_converges_without_moving() {
        let mut s = OptimizationState::starting_at(&config(), 100_000, 50_000);
        assert_eq!(s.advance(-500), RunState::Converged);
        assert_eq!(s.current_amount, 100_000);
        assert_eq!(s.iteration_count, 1);
    }

    #[test]
    fn tolerance_band_is_open_on_both_sides() {
        let s = OptimizationState::starting_at(&config(), 100_000, 50_000);
        assert!(s.within_tolerance(0));
        assert!(s.within_tolerance(1_999));
        assert!(s.within_tolerance(-1_999));
        assert!(!s.within_tolerance(2_000));
        assert!(!s.within_tolerance(-2_000));
        assert!(!s.within_tolerance(i64::MIN + 1));
        assert!(!s.within_tolerance(i64::MAX));
    }

    #[test]
    fn both_bounds_must_hold_for_convergence() {
        // A one-sided check would accept any large undershoot.
        let mut s = OptimizationState::starting_at(&config(), 100_000, 50_000);
        assert_eq!(s.advance(-50_000), RunState::Running);
        assert_eq!(s.current_amount, 150_000);
        let mut s = OptimizationState::starting_at(&config(), 100_000, 50_000);
        assert_eq!(s.advance(50_000), RunState::Running);
        assert_eq!(s.current_amount, 75_000);
    }

    #[test]
    fn collapsed_step_stops_the_search() {
        let mut s = OptimizationState::starting_at(&config(), 120_000, -99);
        assert_eq!(s.advance(-10_000), RunState::AbortedStep);
        assert_eq!(s.current_amount, 120_000);

        let s = OptimizationState::starting_at(&config(), 120_000, 100);
        assert!(!s.step_collapsed());
        let s = OptimizationState::starting_at(&config(), 120_000, -100);
        assert!(!s.step_collapsed());
    }

    #[test]
    fn continuing_upward_crosses_the_ceiling() {
        let mut s = OptimizationState::starting_at(&config(), 190_000, 20_000);
        assert_eq!(s.advance(-3_000), RunState::Running);
        assert_eq!(s.current_amount, 210_000);
        assert_eq!(s.advance(-3_000), RunState::AbortedLimit);
        assert_eq!(s.current_amount, 210_000);
    }

    #[test]
    fn overshoot_while_rising_halves_and_reverses() {
        let mut s = OptimizationState::starting_at(&config(), 190_000, 20_000);
        assert_eq!(s.advance(3_000), RunState::Running);
        assert_eq!(s.last_step, -10_000);
        assert_eq!(s.current_amount, 180_000);
    }

    #[test]
    fn step_only_shrinks_on_direction_flips() {
        assert_eq!(OptimizationState::next_step(50_000, -10_000), 50_000);
        assert_eq!(OptimizationState::next_step(50_000, 10_000), -25_000);
        assert_eq!(OptimizationState::next_step(-25_000, 10_000), -25_000);
        assert_eq!(OptimizationState::next_step(-25_000, -10_000), 12_500);
        assert_eq!(OptimizationState::next_step(-25_001, -10_000), 12_500);
        assert_eq!(OptimizationState::next_step(25_001, 10_000), -12_500);
    }

    #[test]
    fn amount_never_goes_negative() {
        let mut s = OptimizationState::starting_at(&config(), 1_000, -50_000);
        assert_eq!(s.advance(10_000), RunState::Running);
        assert_eq!(s.current_amount, 0);
    }

    #[test]
    fn overshoot_at_zero_amount_stops() {
        let mut s = OptimizationState::starting_at(&config(), 1_000, -50_000);
        assert_eq!(s.advance(10_000), RunState::Running);
        assert_eq!(s.current_amount, 0);
        assert_eq!(s.advance(10_000), RunState::AbortedStep);
        assert_eq!(s.current_amount, 0);
        assert_eq!(s.iteration_count, 2);
    }

    #[test]
    fn undershoot_at_zero_amount_climbs_back() {
        let mut s = OptimizationState::starting_at(&config(), 0, -50_000);
        assert_eq!(s.advance(-10_000), RunState::Running);
        assert_eq!(s.current_amount, 25_000);
    }

    #[test]
    fn extreme_steps_do_not_overflow() {
        assert_eq!(OptimizationState::next_step(i64::MIN, -1), i64::MAX / 2 + 1);
        let huge = OptimizerConfig { initial_amount: u64::MAX, ..config() };
        assert_eq!(OptimizationState::new(&huge).last_step, i64::MAX);
    }

    #[test]
    fn ceiling_is_exclusive() {
        let s = OptimizationState::starting_at(&config(), 200_000, 1_000);
        assert!(!s.above_ceiling());
        let s = OptimizationState::starting_at(&config(), 200_001, 1_000);
        assert!(s.above_ceiling());
    }

    #[test]
    fn terminal_states() {
        assert!(!RunState::Init.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Converged.is_terminal());
        assert!(RunState::AbortedLimit.is_terminal());
        assert!(RunState::AbortedStep.is_terminal());
        assert_eq!(RunState::AbortedLimit.label(), "ABORTED_LIMIT");
    }
}
