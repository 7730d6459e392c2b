//! Direct feedback law.

use crate::config::FeedbackGains;
use crate::estimator::BodyState;
use crate::reference::GroundReference;

/// Linear state feedback to ground acceleration.
///
/// ```text
/// a = k_x (x - x_ref) + k_v (v - v_ref) + k_θ θ + k_ω θ̇ + k_i ∫(x - x_ref)
/// ```
///
/// All gains are positive for a stable upright: leaning forward accelerates
/// the wheels forward under the body.
#[derive(Debug, Clone)]
pub struct FeedbackLaw {
    gains: FeedbackGains,
    max_acceleration: f64,
}

impl FeedbackLaw {
    pub fn new(gains: FeedbackGains, max_acceleration: f64) -> Self {
        Self {
            gains,
            max_acceleration,
        }
    }

    pub fn gains(&self) -> &FeedbackGains {
        &self.gains
    }

    pub fn acceleration(
        &self,
        body: &BodyState,
        reference: &GroundReference,
        position_error_integral: f64,
    ) -> f64 {
        let g = &self.gains;
        let a = g.position * (body.ground_position - reference.position)
            + g.velocity * (body.ground_velocity - reference.velocity)
            + g.pitch * body.pitch
            + g.pitch_rate * body.pitch_rate
            + g.integral * position_error_integral;
        a.clamp(-self.max_acceleration, self.max_acceleration)
    }

    /// Accumulate the position error, bounded by the configured integral limit.
    pub fn integrate_error(&self, integral: f64, position_error: f64, dt: f64) -> f64 {
        let limit = self.gains.integral_limit;
        (integral + position_error * dt).clamp(-limit, limit)
    }
}
