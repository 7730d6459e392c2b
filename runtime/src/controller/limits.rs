//! Hard actuator limits.

use crate::config::{ActuatorLimits, ClampPolicy};
use crate::frame::{Action, SignalKey};

pub const WHEELS: [&str; 2] = ["left_wheel", "right_wheel"];
pub const LEG_JOINTS: [&str; 4] = ["left_hip", "left_knee", "right_hip", "right_knee"];

impl ActuatorLimits {
    /// Magnitude bound for one action component.
    ///
    /// Components with no configured limit are bounded by zero, so an
    /// unexpected key can never reach the actuators with a non-zero value.
    pub fn limit_for(&self, key: &SignalKey) -> f64 {
        if let ClampPolicy::Shared { limit } = self.clamp {
            return limit;
        }
        let is_wheel = WHEELS.contains(&key.block());
        let is_leg = LEG_JOINTS.contains(&key.block());
        match key.field() {
            "velocity" if is_wheel => self.wheel_velocity,
            "feedforward_torque" if is_wheel => self.wheel_torque,
            "position" if is_leg => self.leg_position,
            "kp_scale" | "kd_scale" if is_leg => self.leg_gain_scale,
            _ => 0.0,
        }
    }

    /// Clamp every component in place. Non-finite values become zero.
    /// Each saturated component is logged at warn; returns how many were.
    pub fn clamp(&self, action: &mut Action) -> usize {
        let mut saturated = 0;
        for (key, value) in action.entries_mut() {
            let limit = self.limit_for(&key);
            for x in value.iter_mut() {
                let clamped = if x.is_finite() { x.clamp(-limit, limit) } else { 0.0 };
                if clamped != *x {
                    tracing::warn!("{}: {} clamped to {}", key, x, clamped);
                    saturated += 1;
                }
                *x = clamped;
            }
        }
        saturated
    }

    /// True when every component of `action` is within its bound.
    pub fn admits(&self, action: &Action) -> bool {
        action.keys().all(|key| {
            let limit = self.limit_for(&key);
            action
                .get(&key)
                .is_some_and(|v| v.iter().all(|x| x.is_finite() && x.abs() <= limit))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::capture;

    fn key(block: &str, field: &str) -> SignalKey {
        SignalKey::new(block, field)
    }

    #[test]
    fn test_per_group_clamp() {
        let limits = ActuatorLimits::default();
        let mut action = Action::new()
            .with(key("left_wheel", "velocity"), vec![100.0])
            .with(key("right_wheel", "feedforward_torque"), vec![-5.0])
            .with(key("left_knee", "position"), vec![1.0])
            .with(key("left_wheel", "position"), vec![3.0]);
        assert!(!limits.admits(&action));

        assert_eq!(limits.clamp(&mut action), 3);
        assert_eq!(action.scalar(&key("left_wheel", "velocity")), Some(30.0));
        assert_eq!(action.scalar(&key("right_wheel", "feedforward_torque")), Some(-1.7));
        assert_eq!(action.scalar(&key("left_knee", "position")), Some(1.0));
        assert_eq!(action.scalar(&key("left_wheel", "position")), Some(0.0));
        assert!(limits.admits(&action));
    }

    #[test]
    fn test_shared_clamp() {
        let limits = ActuatorLimits {
            clamp: ClampPolicy::Shared { limit: 2.0 },
            ..Default::default()
        };
        let mut action = Action::new()
            .with(key("left_wheel", "velocity"), vec![-10.0])
            .with(key("left_hip", "position"), vec![2.5]);
        limits.clamp(&mut action);
        assert_eq!(action.scalar(&key("left_wheel", "velocity")), Some(-2.0));
        assert_eq!(action.scalar(&key("left_hip", "position")), Some(2.0));
    }

    #[test]
    fn test_non_finite_values_are_zeroed() {
        let limits = ActuatorLimits::default();
        let mut action = Action::new().with(key("right_wheel", "velocity"), vec![f64::NAN]);
        assert!(!limits.admits(&action));
        assert_eq!(limits.clamp(&mut action), 1);
        assert_eq!(action.scalar(&key("right_wheel", "velocity")), Some(0.0));
    }

    #[test]
    fn test_leg_gain_scales_are_bounded() {
        let limits = ActuatorLimits::default();
        let mut action = Action::new()
            .with(key("left_hip", "kp_scale"), vec![1.5])
            .with(key("right_knee", "kd_scale"), vec![9.0]);
        assert_eq!(limits.clamp(&mut action), 1);
        assert_eq!(action.scalar(&key("left_hip", "kp_scale")), Some(1.5));
        assert_eq!(
            action.scalar(&key("right_knee", "kd_scale")),
            Some(limits.leg_gain_scale)
        );
    }

    #[test]
    fn test_saturation_is_logged() {
        let limits = ActuatorLimits::default();
        let mut action = Action::new()
            .with(key("left_wheel", "velocity"), vec![45.0])
            .with(key("right_wheel", "velocity"), vec![3.0]);
        let (saturated, logs) = capture::logs(|| limits.clamp(&mut action));
        assert_eq!(saturated, 1);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("left_wheel.velocity: 45 clamped to 30"));
        assert!(!logs.contains("right_wheel.velocity"));

        let (saturated, logs) = capture::logs(|| limits.clamp(&mut action));
        assert_eq!(saturated, 0);
        assert!(logs.is_empty());
    }
}
