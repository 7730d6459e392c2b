//! Balance control loop for a two-wheeled self-balancing robot.
//!
//! Each cycle the loop fetches an observation from the spine, runs it
//! through the transform pipeline, estimates the body state, lets the
//! balance controller pick an action, and dispatches it back.

pub mod config;
pub mod controller;
pub mod error;
pub mod estimator;
pub mod frame;
pub mod gamepad;
pub mod optimizer;
pub mod pipeline;
pub mod reference;
pub mod report;
pub mod scheduler;
pub mod spine;

pub use config::BalancerConfig;
pub use controller::{BalanceController, Mode, OperatorCommand};
pub use frame::{Action, Observation, Schema, SignalKey};
pub use scheduler::{BalanceLoop, LoopStats};
pub use spine::Spine;
