//! Leg coordination for the whole-body law.
//!
//! Each leg is a planar hip–knee chain in the sagittal plane, hip at the
//! origin, x forward and z up. Hip angle is measured from the downward
//! vertical, knee angle relative to the thigh:
//!
//! ```text
//! x = l1 sin(q1) + l2 sin(q1 + q2)
//! z = -l1 cos(q1) - l2 cos(q1 + q2)
//! ```
//!
//! Leaning forward moves the wheels forward under the hips, which shifts the
//! center of mass back over the contact point.

use nalgebra::{Matrix2, Vector2};
use serde::Serialize;

use crate::config::LegConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LegPose {
    pub hip: f64,
    pub knee: f64,
}

/// Outcome of one IK solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IkResult {
    pub pose: LegPose,
    pub converged: bool,
    pub iterations: usize,
    /// Remaining wheel position error (m).
    pub error: f64,
}

pub struct LegCoordinator {
    config: LegConfig,
    nominal: LegPose,
    last: LegPose,
}

impl LegCoordinator {
    pub fn new(config: LegConfig) -> Self {
        let nominal = crouch_pose(&config);
        Self {
            config,
            nominal,
            last: nominal,
        }
    }

    /// Knee-forward pose with the wheel straight below the hip.
    pub fn nominal(&self) -> LegPose {
        self.nominal
    }

    pub fn forward_kinematics(&self, pose: &LegPose) -> Vector2<f64> {
        let (l1, l2) = (self.config.thigh_length, self.config.shank_length);
        let q12 = pose.hip + pose.knee;
        Vector2::new(
            l1 * pose.hip.sin() + l2 * q12.sin(),
            -l1 * pose.hip.cos() - l2 * q12.cos(),
        )
    }

    fn jacobian(&self, pose: &LegPose) -> Matrix2<f64> {
        let (l1, l2) = (self.config.thigh_length, self.config.shank_length);
        let q12 = pose.hip + pose.knee;
        Matrix2::new(
            l1 * pose.hip.cos() + l2 * q12.cos(),
            l2 * q12.cos(),
            l1 * pose.hip.sin() + l2 * q12.sin(),
            l2 * q12.sin(),
        )
    }

    /// Horizontal wheel offset under the hip for a given pitch.
    pub fn target_offset(&self, pitch: f64) -> f64 {
        (self.config.com_gain * pitch).clamp(-self.config.max_shift, self.config.max_shift)
    }

    /// Solve for the pose placing the wheel at the pitch-dependent target,
    /// starting from the previous solution.
    pub fn solve(&mut self, pitch: f64) -> IkResult {
        let target = Vector2::new(self.target_offset(pitch), -self.config.height);
        let result = self.solve_for(&target, self.last);
        self.last = result.pose;
        if !result.converged {
            tracing::debug!(
                "Leg IK stopped after {} iterations, error {:.2e} m",
                result.iterations,
                result.error
            );
        }
        result
    }

    /// Damped least squares: `dq = Jᵀ (J Jᵀ + λ² I)⁻¹ e`.
    pub fn solve_for(&self, target: &Vector2<f64>, init: LegPose) -> IkResult {
        let damping = self.config.damping * self.config.damping;
        let mut q = Vector2::new(init.hip, init.knee);
        let pose = |q: &Vector2<f64>| LegPose {
            hip: q.x,
            knee: q.y,
        };

        for iteration in 0..self.config.max_iterations {
            let error = target - self.forward_kinematics(&pose(&q));
            if error.norm() < self.config.tolerance {
                return IkResult {
                    pose: pose(&q),
                    converged: true,
                    iterations: iteration,
                    error: error.norm(),
                };
            }

            let jacobian = self.jacobian(&pose(&q));
            let damped = jacobian * jacobian.transpose() + Matrix2::identity() * damping;
            let Some(damped_inv) = damped.try_inverse() else {
                return IkResult {
                    pose: pose(&q),
                    converged: false,
                    iterations: iteration,
                    error: error.norm(),
                };
            };
            q += jacobian.transpose() * damped_inv * error;
        }

        let error = (target - self.forward_kinematics(&pose(&q))).norm();
        IkResult {
            pose: pose(&q),
            converged: error < self.config.tolerance,
            iterations: self.config.max_iterations,
            error,
        }
    }

    /// Stiffness and damping multiplier for the hip and knee servos.
    /// Legs stiffen in proportion to how hard the robot is turning.
    pub fn gain_scale(&self, yaw_rate: f64) -> f64 {
        let turning = (yaw_rate.abs() / self.config.turning_yaw_rate).clamp(0.0, 1.0);
        self.config.gain_scale.clamp(0.1, 2.0) + self.config.turning_gain_scale * turning
    }

    /// Pose the next warm-started solve begins from.
    pub fn last_pose(&self) -> LegPose {
        self.last
    }

    /// Restore the warm start, e.g. after a cycle whose pose was never sent.
    pub fn restore(&mut self, pose: LegPose) {
        self.last = pose;
    }

    pub fn reset(&mut self) {
        self.last = self.nominal;
    }
}

/// Closed-form knee-forward solution for the wheel at `(0, -height)`.
fn crouch_pose(config: &LegConfig) -> LegPose {
    let (l1, l2, d) = (config.thigh_length, config.shank_length, config.height);
    let cos_knee = ((d * d - l1 * l1 - l2 * l2) / (2.0 * l1 * l2)).clamp(-1.0, 1.0);
    let knee = cos_knee.acos();
    let hip = -(l2 * knee.sin()).atan2(l1 + l2 * knee.cos());
    LegPose { hip, knee }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn coordinator() -> LegCoordinator {
        LegCoordinator::new(LegConfig::default())
    }

    #[test]
    fn test_nominal_pose_reaches_height() {
        let legs = coordinator();
        let foot = legs.forward_kinematics(&legs.nominal());
        assert_relative_eq!(foot.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(foot.y, -0.3, epsilon = 1e-12);
        assert!(legs.nominal().knee > 0.0);
    }

    #[test]
    fn test_upright_keeps_nominal_pose() {
        let mut legs = coordinator();
        let result = legs.solve(0.0);
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.pose, legs.nominal());
    }

    #[test]
    fn test_lean_shifts_wheels_forward() {
        let mut legs = coordinator();
        let result = legs.solve(0.3);
        assert!(result.converged, "error {}", result.error);

        let foot = legs.forward_kinematics(&result.pose);
        assert_relative_eq!(foot.x, 0.03, epsilon = 1e-5);
        assert_relative_eq!(foot.y, -0.3, epsilon = 1e-5);
    }

    #[test]
    fn test_offset_is_bounded() {
        let legs = coordinator();
        assert_eq!(legs.target_offset(5.0), 0.06);
        assert_eq!(legs.target_offset(-5.0), -0.06);
    }

    #[test]
    fn test_warm_start_and_reset() {
        let mut legs = coordinator();
        legs.solve(0.4);
        let warm = legs.solve(0.4);
        assert_eq!(warm.iterations, 0);

        legs.reset();
        let cold = legs.solve(0.4);
        assert!(cold.iterations > 0);
    }

    #[test]
    fn test_turning_stiffens_legs() {
        let legs = coordinator();
        assert_relative_eq!(legs.gain_scale(0.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(legs.gain_scale(-0.5), 1.5, epsilon = 1e-12);
        assert_relative_eq!(legs.gain_scale(4.0), 2.0, epsilon = 1e-12);

        let soft = LegCoordinator::new(LegConfig {
            gain_scale: 0.0,
            turning_gain_scale: 0.5,
            ..LegConfig::default()
        });
        assert_relative_eq!(soft.gain_scale(0.0), 0.1, epsilon = 1e-12);
        assert_relative_eq!(soft.gain_scale(1.0), 0.6, epsilon = 1e-12);
    }
}
