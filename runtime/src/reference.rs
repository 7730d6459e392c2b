//! Motion references supplied to the controller each cycle.

use serde::{Deserialize, Serialize};

/// Operator reference for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    /// Target ground velocity (m/s).
    pub ground_velocity: f64,
    /// Absolute ground position target (m). When absent, the controller
    /// integrates `ground_velocity` into its own position reference.
    pub ground_position: Option<f64>,
    /// Target yaw rate (rad/s), realized by differential wheel speeds.
    pub yaw_rate: f64,
}

impl Reference {
    pub fn velocity(ground_velocity: f64) -> Self {
        Self {
            ground_velocity,
            ..Default::default()
        }
    }
}

/// Sagittal target the balance laws track this cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroundReference {
    pub position: f64,
    pub velocity: f64,
}

/// Source of references, polled once per cycle from the control thread.
pub trait ReferenceSource: Send {
    fn reference(&mut self) -> Reference;
}

/// Always returns the same reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantReference(pub Reference);

impl ReferenceSource for ConstantReference {
    fn reference(&mut self) -> Reference {
        self.0
    }
}
