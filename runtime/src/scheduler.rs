//! Fixed-period balance loop.
//!
//! One cycle: drain operator commands → fetch observation → pipeline
//! (observation side) → estimator → controller → pipeline (action side) →
//! clamp → dispatch → report. Cycles never overlap. The loop sleeps to the
//! next period boundary between cycles and checks the shutdown flag there.
//!
//! The deadline is checked once the controller has stepped. A late cycle
//! re-sends the previous action and leaves the action side untouched.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serde::Serialize;

use crate::config::BalancerConfig;
use crate::controller::{BalanceController, Mode, OperatorCommand, Transition};
use crate::error::{AssemblyError, Fault, PipelineError};
use crate::estimator::{
    orientation_key, pitch_key, wheel_velocity_key, BodyState, Estimator,
};
use crate::frame::{Action, Schema};
use crate::pipeline::Pipeline;
use crate::reference::{ConstantReference, ReferenceSource};
use crate::report::{CycleReport, Reporter, SolverOutcome, TracingReporter};
use crate::spine::Spine;

// ── Clocks ──

/// Time source of the loop.
pub trait Clock: Send {
    fn now(&self) -> Instant;
    fn sleep_until(&self, deadline: Instant);
}

/// Monotonic wall clock with high-precision sleep (avoids OS scheduler jitter).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            spin_sleep::sleep(deadline - now);
        }
    }
}

/// Deterministic clock for tests: every `now()` advances time by `step`,
/// and sleeping jumps straight to the deadline.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed_ns: AtomicU64,
    step_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(step: Duration) -> Self {
        Self {
            origin: Instant::now(),
            elapsed_ns: AtomicU64::new(0),
            step_ns: AtomicU64::new(step.as_nanos() as u64),
        }
    }

    pub fn set_step(&self, step: Duration) {
        self.step_ns.store(step.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let step = self.step_ns.load(Ordering::SeqCst);
        let before = self.elapsed_ns.fetch_add(step, Ordering::SeqCst);
        self.origin + Duration::from_nanos(before + step)
    }

    fn sleep_until(&self, deadline: Instant) {
        let target = deadline.saturating_duration_since(self.origin).as_nanos() as u64;
        self.elapsed_ns.fetch_max(target, Ordering::SeqCst);
    }
}

impl<C: Clock + Sync> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep_until(&self, deadline: Instant) {
        (**self).sleep_until(deadline)
    }
}

// ── Statistics ──

/// Loop timing statistics, surfaced in the shutdown summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    pub cycles: u64,
    pub overruns: u64,
    /// Cycles where the optimizer failed and the feedback law was used.
    pub fallbacks: u64,
    pub faults: u64,
    pub max_processing: Duration,
    // Welford running mean, in seconds
    mean_processing_s: f64,
}

impl LoopStats {
    fn record(&mut self, processing: Duration, overrun: bool) {
        self.cycles += 1;
        self.max_processing = self.max_processing.max(processing);
        let delta = processing.as_secs_f64() - self.mean_processing_s;
        self.mean_processing_s += delta / self.cycles as f64;
        if overrun {
            self.overruns += 1;
        }
    }

    pub fn mean_processing(&self) -> Duration {
        Duration::from_secs_f64(self.mean_processing_s.max(0.0))
    }

    /// Fraction of cycles that overran (0.0 to 1.0).
    pub fn overrun_ratio(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            self.overruns as f64 / self.cycles as f64
        }
    }
}

// ── Loop ──

pub struct BalanceLoop<S: Spine> {
    spine: S,
    pipeline: Pipeline,
    estimator: Estimator,
    controller: BalanceController,
    reference: Box<dyn ReferenceSource>,
    commands: Option<Receiver<OperatorCommand>>,
    pending: Vec<OperatorCommand>,
    reporter: Box<dyn Reporter>,
    clock: Box<dyn Clock>,
    period: Duration,
    fetch_timeout: Duration,
    last_state: Option<BodyState>,
    last_dispatched: Option<Action>,
    next_boundary: Option<Instant>,
    cycle: u64,
    stats: LoopStats,
}

impl<S: Spine> BalanceLoop<S> {
    /// Validate the configuration and assemble the loop around `spine`.
    pub fn new(config: &BalancerConfig, spine: S) -> Result<Self, AssemblyError> {
        config.validate()?;

        let controller = BalanceController::new(config);
        let pipeline = Pipeline::assemble(
            &config.pipeline,
            &spine.observation_schema(),
            controller.action_schema(),
            config.cycle.dt(),
        )?;
        check_estimator_inputs(pipeline.observation_schema())?;

        tracing::info!(
            "Balance loop assembled: {} Hz, {} transforms, fetch timeout {:?}",
            config.cycle.frequency,
            pipeline.len(),
            config.cycle.fetch_timeout()
        );

        Ok(Self {
            spine,
            pipeline,
            estimator: Estimator::new(&config.estimator, config.cycle.dt()),
            controller,
            reference: Box::new(ConstantReference::default()),
            commands: None,
            pending: Vec::new(),
            reporter: Box::new(TracingReporter),
            clock: Box::new(SystemClock),
            period: config.cycle.period(),
            fetch_timeout: config.cycle.fetch_timeout(),
            last_state: None,
            last_dispatched: None,
            next_boundary: None,
            cycle: 0,
            stats: LoopStats::default(),
        })
    }

    pub fn with_reference(mut self, reference: impl ReferenceSource + 'static) -> Self {
        self.reference = Box::new(reference);
        self
    }

    pub fn with_commands(mut self, commands: Receiver<OperatorCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Queue a command for the start of the next cycle.
    pub fn command(&mut self, command: OperatorCommand) {
        self.pending.push(command);
    }

    pub fn mode(&self) -> Mode {
        self.controller.mode()
    }

    pub fn controller(&self) -> &BalanceController {
        &self.controller
    }

    pub fn spine(&self) -> &S {
        &self.spine
    }

    pub fn spine_mut(&mut self) -> &mut S {
        &mut self.spine
    }

    pub fn into_spine(self) -> S {
        self.spine
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    pub fn last_state(&self) -> Option<&BodyState> {
        self.last_state.as_ref()
    }

    /// Run one complete cycle.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let mut transition = self.apply_commands();

        let observation = match self.spine.fetch_observation(self.fetch_timeout) {
            Ok(observation) => observation,
            Err(e) => return self.fault_cycle(Fault::Connectivity(e), transition),
        };
        let started = self.clock.now();

        let reference = self.reference.reference();
        let filtered = self.pipeline.observation(&observation);
        let body = match self.estimator.estimate(&filtered, self.last_state.as_ref()) {
            Ok(body) => body,
            Err(e) => return self.fault_cycle(e.into(), transition),
        };
        self.last_state = Some(body);

        let checkpoint = self.controller.checkpoint();
        let output = self.controller.step(&body, &reference);
        transition = output.transition.or(transition);

        let processing = self.clock.now().saturating_duration_since(started);
        let overrun = processing > self.period;

        // Late: re-send the previous action and undo the controller step.
        let action = if overrun && self.controller.mode().is_active() {
            self.controller.rollback(&checkpoint);
            self.last_dispatched
                .clone()
                .unwrap_or_else(|| self.controller.zero_action())
        } else {
            let mut action = self.pipeline.action(output.action);
            self.controller.limits().clamp(&mut action);
            if self.controller.mode().is_active() {
                action
            } else {
                self.controller.zero_action()
            }
        };

        if let Err(e) = self.spine.dispatch_action(&action) {
            return self.fault_cycle(Fault::Connectivity(e), transition);
        }
        self.last_dispatched = Some(action);

        self.stats.record(processing, overrun);
        if matches!(output.solver, Some(SolverOutcome::Fallback { .. })) {
            self.stats.fallbacks += 1;
        }

        let report = CycleReport {
            cycle: self.cycle,
            mode: self.controller.mode(),
            transition,
            overrun,
            solver: output.solver,
            fault: None,
        };
        self.reporter.report(&report);
        report
    }

    /// Drain queued and channel commands into the mode machine.
    fn apply_commands(&mut self) -> Option<Transition> {
        let mut commands = std::mem::take(&mut self.pending);
        if let Some(rx) = &self.commands {
            commands.extend(rx.try_iter());
        }

        let mut last = None;
        for command in commands {
            if let Some(t) = self.controller.command(command) {
                if t.to == Mode::Balancing {
                    self.pipeline.reset();
                    self.last_state = None;
                }
                last = Some(t);
            }
        }
        last
    }

    /// Zero actuation and FALLEN. Dispatch is best effort.
    fn fault_cycle(&mut self, fault: Fault, transition: Option<Transition>) -> CycleReport {
        let transition = self.controller.fault().or(transition);

        let zero = self.controller.zero_action();
        if let Err(e) = self.spine.dispatch_action(&zero) {
            tracing::error!("Failed to dispatch zero action: {}", e);
        }
        self.last_dispatched = Some(zero);

        self.stats.record(Duration::ZERO, false);
        self.stats.faults += 1;

        let report = CycleReport {
            cycle: self.cycle,
            mode: self.controller.mode(),
            transition,
            overrun: false,
            solver: None,
            fault: Some(fault),
        };
        self.reporter.report(&report);
        report
    }

    /// Sleep to the next period boundary. When late, re-synchronize to the
    /// first boundary after now.
    pub fn wait_next_boundary(&mut self) {
        let now = self.clock.now();
        let mut next = self.next_boundary.unwrap_or(now) + self.period;
        if next <= now {
            let mut skipped = 0u32;
            while next <= now {
                next += self.period;
                skipped += 1;
            }
            tracing::debug!("Late by {} periods, re-synchronizing", skipped);
        }
        self.clock.sleep_until(next);
        self.next_boundary = Some(next);
    }

    /// Run until `shutdown` is set. The flag is checked between cycles only.
    pub fn run(&mut self, shutdown: &AtomicBool) -> &LoopStats {
        self.run_for(shutdown, None)
    }

    /// Like [`run`](Self::run), stopping after `max_cycles` if given.
    pub fn run_for(&mut self, shutdown: &AtomicBool, max_cycles: Option<u64>) -> &LoopStats {
        tracing::info!("Entering balance loop at {:?} period", self.period);
        let mut cycles = 0u64;
        while !shutdown.load(Ordering::SeqCst) && max_cycles.map_or(true, |max| cycles < max) {
            self.run_cycle();
            cycles += 1;
            self.wait_next_boundary();
        }
        tracing::info!("Balance loop stopped after {} cycles", cycles);
        &self.stats
    }
}

/// The estimator needs a pitch source and both wheel velocities.
fn check_estimator_inputs(schema: &Schema) -> Result<(), PipelineError> {
    let missing = |key| PipelineError::MissingKey {
        transform: "estimator".to_string(),
        key,
    };
    if !schema.contains(&orientation_key()) && !schema.contains(&pitch_key()) {
        return Err(missing(orientation_key()));
    }
    for side in ["left", "right"] {
        let key = wheel_velocity_key(side);
        if !schema.contains(&key) {
            return Err(missing(key));
        }
    }
    Ok(())
}
