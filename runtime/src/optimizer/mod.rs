//! Model-predictive ground acceleration planner.
//!
//! Each cycle builds a QP over the linearized wheeled pendulum, solves it with
//! Clarabel and keeps only the first control of the plan.

pub mod dynamics;
pub mod problem;

use std::time::{Duration, Instant};

use clarabel::solver::{DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus};
use nalgebra::DVector;

use crate::config::OptimizerConfig;
use crate::error::InfeasibleProblem;
use crate::estimator::BodyState;
use crate::reference::GroundReference;
use dynamics::{PendulumModel, PITCH, PITCH_RATE, POSITION, STATE_DIM, VELOCITY};
use problem::OptimizationProblem;

/// First control of a successful solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plan {
    /// Ground acceleration for this cycle (m/s²).
    pub acceleration: f64,
    pub iterations: u32,
    pub solve_time: Duration,
}

pub struct TrajectoryOptimizer {
    config: OptimizerConfig,
    model: PendulumModel,
    previous_control: f64,
}

impl TrajectoryOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        let model = PendulumModel::new(config.pendulum_length, config.gravity, config.timestep);
        Self {
            config,
            model,
            previous_control: 0.0,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Solve the horizon problem from `body` toward `reference`.
    pub fn plan(
        &mut self,
        body: &BodyState,
        reference: &GroundReference,
    ) -> Result<Plan, InfeasibleProblem> {
        let start = Instant::now();

        let mut x0 = DVector::zeros(STATE_DIM);
        x0[POSITION] = body.ground_position;
        x0[PITCH] = body.pitch;
        x0[VELOCITY] = body.ground_velocity;
        x0[PITCH_RATE] = body.pitch_rate;

        let problem = OptimizationProblem::new(
            &self.model,
            &self.config,
            x0,
            reference.position,
            reference.velocity,
            self.previous_control,
        );
        let qp = problem.to_qp();

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.config.max_iterations)
            .time_limit(self.config.time_budget)
            .verbose(false)
            .build()
            .map_err(|e| InfeasibleProblem::new(format!("solver settings: {e:?}")))?;

        let mut solver = DefaultSolver::new(&qp.p, &qp.q, &qp.a, &qp.b, &qp.cones, settings)
            .map_err(|e| InfeasibleProblem::new(format!("solver setup: {e:?}")))?;
        solver.solve();

        let solution = &solver.solution;
        if !matches!(
            solution.status,
            SolverStatus::Solved | SolverStatus::AlmostSolved
        ) {
            return Err(InfeasibleProblem::new(format!("{:?}", solution.status)));
        }

        let solve_time = start.elapsed();
        if solve_time.as_secs_f64() > self.config.time_budget {
            return Err(InfeasibleProblem::new(format!(
                "time budget exceeded ({} µs)",
                solve_time.as_micros()
            )));
        }

        let acceleration = solution.x[problem.horizon() * STATE_DIM];
        if !acceleration.is_finite() {
            return Err(InfeasibleProblem::new("non-finite solution"));
        }

        Ok(Plan {
            acceleration,
            iterations: solution.iterations,
            solve_time,
        })
    }

    /// Remember the acceleration actually applied this cycle, for the rate cost.
    pub fn record_applied(&mut self, acceleration: f64) {
        self.previous_control = acceleration;
    }

    pub fn reset(&mut self) {
        self.previous_control = 0.0;
    }
}
