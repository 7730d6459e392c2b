//! Per-cycle reports.

use serde::Serialize;

use crate::controller::{Mode, Transition};
use crate::error::Fault;

/// What the trajectory optimizer did this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SolverOutcome {
    Solved {
        acceleration: f64,
        iterations: u32,
        solve_time_us: u64,
    },
    /// No acceptable solution; the direct feedback command was used instead.
    Fallback { status: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Mode after this cycle.
    pub mode: Mode,
    pub transition: Option<Transition>,
    /// Processing exceeded the period; the previous action was held.
    pub overrun: bool,
    pub solver: Option<SolverOutcome>,
    pub fault: Option<Fault>,
}

/// Consumer of cycle reports, called on the control thread after dispatch.
pub trait Reporter: Send {
    fn report(&mut self, report: &CycleReport);
}

/// Logs reports with `tracing`: faults at error, overruns and fallbacks at
/// warn, the rest at debug. Transitions are logged by the controller.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&mut self, report: &CycleReport) {
        if let Some(fault) = &report.fault {
            tracing::error!(cycle = report.cycle, "Fault: {}", fault);
        }
        if report.overrun {
            tracing::warn!(cycle = report.cycle, "Cycle overrun, holding previous action");
        }
        match &report.solver {
            Some(SolverOutcome::Fallback { status }) => {
                tracing::warn!(cycle = report.cycle, "Optimizer fallback: {}", status);
            }
            Some(SolverOutcome::Solved {
                acceleration,
                iterations,
                solve_time_us,
            }) => {
                tracing::debug!(
                    cycle = report.cycle,
                    acceleration,
                    iterations,
                    solve_time_us,
                    "Optimizer solved"
                );
            }
            None => {}
        }
        tracing::debug!(cycle = report.cycle, mode = %report.mode, "Cycle done");
    }
}

/// Collects reports in memory.
impl Reporter for Vec<CycleReport> {
    fn report(&mut self, report: &CycleReport) {
        self.push(report.clone());
    }
}
