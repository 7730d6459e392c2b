//! Balance controller: mode machine wrapped around the active control law.
//!
//! Every law produces a ground acceleration, integrated into the commanded
//! ground velocity and converted to wheel angular velocities. The tilt check
//! runs before any law, and only BALANCING emits a non-zero action.

mod feedback;
mod limits;
mod mode;
mod whole_body;

pub use feedback::FeedbackLaw;
pub use limits::{LEG_JOINTS, WHEELS};
pub use mode::{Mode, OperatorCommand, Signal, Transition};
pub use whole_body::{IkResult, LegCoordinator, LegPose};

use crate::config::{ActuatorLimits, BalancerConfig, ControlLaw, ControllerConfig};
use crate::estimator::BodyState;
use crate::frame::{Action, Schema, SignalKey};
use crate::optimizer::TrajectoryOptimizer;
use crate::reference::{GroundReference, Reference};
use crate::report::SolverOutcome;

/// Cross-cycle controller memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerState {
    pub mode: Mode,
    /// Accumulated ground position error (m·s).
    pub position_error_integral: f64,
    /// Integrated position reference. Anchored to the measured position on
    /// the first balancing cycle.
    pub reference_position: Option<f64>,
    /// Ground velocity sent to the wheels (m/s).
    pub commanded_velocity: f64,
    /// Ground acceleration applied on the last balancing cycle (m/s²).
    pub last_acceleration: f64,
}

/// Action-side controller memory, taken before a step so the step can be
/// undone when its action is not dispatched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Checkpoint {
    commanded_velocity: f64,
    last_acceleration: f64,
    leg_pose: Option<LegPose>,
}

/// Result of one controller step.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlOutput {
    pub action: Action,
    pub transition: Option<Transition>,
    pub solver: Option<SolverOutcome>,
}

pub fn wheel_key(wheel: &str, field: &str) -> SignalKey {
    SignalKey::new(wheel, field)
}

pub fn leg_key(joint: &str) -> SignalKey {
    SignalKey::new(joint, "position")
}

/// `field` is `kp_scale` or `kd_scale`.
pub fn leg_gain_key(joint: &str, field: &str) -> SignalKey {
    SignalKey::new(joint, field)
}

pub struct BalanceController {
    config: ControllerConfig,
    limits: ActuatorLimits,
    dt: f64,
    wheel_radius: f64,
    right_sign: f64,
    feedback: FeedbackLaw,
    optimizer: Option<TrajectoryOptimizer>,
    legs: Option<LegCoordinator>,
    state: ControllerState,
    action_schema: Schema,
}

impl BalanceController {
    pub fn new(config: &BalancerConfig) -> Self {
        let controller = &config.controller;
        let optimizer = match controller.law {
            ControlLaw::DirectFeedback => None,
            ControlLaw::ModelPredictive | ControlLaw::WholeBody => {
                Some(TrajectoryOptimizer::new(config.optimizer.clone()))
            }
        };
        let legs = config.legs.clone().map(LegCoordinator::new);

        let mut action_schema = Schema::new();
        for wheel in WHEELS {
            action_schema.insert(wheel_key(wheel, "velocity"), 1);
            action_schema.insert(wheel_key(wheel, "feedforward_torque"), 1);
        }
        if legs.is_some() {
            for joint in LEG_JOINTS {
                action_schema.insert(leg_key(joint), 1);
                action_schema.insert(leg_gain_key(joint, "kp_scale"), 1);
                action_schema.insert(leg_gain_key(joint, "kd_scale"), 1);
            }
        }

        tracing::info!(
            "Balance controller: law={:?}, legs={}, fall_pitch={} rad",
            controller.law,
            legs.is_some(),
            controller.fall_pitch
        );

        Self {
            config: controller.clone(),
            limits: config.limits.clone(),
            dt: config.cycle.dt(),
            wheel_radius: config.estimator.wheel_radius,
            right_sign: if config.estimator.right_wheel_mirrored {
                -1.0
            } else {
                1.0
            },
            feedback: FeedbackLaw::new(controller.gains.clone(), controller.max_acceleration),
            optimizer,
            legs,
            state: ControllerState::default(),
            action_schema,
        }
    }

    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn law(&self) -> ControlLaw {
        self.config.law
    }

    pub fn limits(&self) -> &ActuatorLimits {
        &self.limits
    }

    /// Keys of every action this controller emits.
    pub fn action_schema(&self) -> &Schema {
        &self.action_schema
    }

    pub fn zero_action(&self) -> Action {
        self.action_schema.zero_frame()
    }

    /// Feed a signal to the mode machine. Returns the transition if the mode changed.
    pub fn signal(&mut self, signal: Signal) -> Option<Transition> {
        let from = self.state.mode;
        let to = from.next(signal);
        if to == from {
            return None;
        }

        match to {
            Mode::Stopped => self.reset(),
            Mode::Balancing => self.reset_integrators(),
            Mode::Fallen => {}
        }
        self.state.mode = to;

        if to == Mode::Fallen {
            tracing::warn!("Controller {} -> {} on {:?}", from, to, signal);
        } else {
            tracing::info!("Controller {} -> {} on {:?}", from, to, signal);
        }
        Some(Transition { from, to, signal })
    }

    pub fn command(&mut self, command: OperatorCommand) -> Option<Transition> {
        self.signal(command.into())
    }

    /// Invalid observation or lost connectivity.
    pub fn fault(&mut self) -> Option<Transition> {
        self.signal(Signal::Fault)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            commanded_velocity: self.state.commanded_velocity,
            last_acceleration: self.state.last_acceleration,
            leg_pose: self.legs.as_ref().map(LegCoordinator::last_pose),
        }
    }

    /// Undo the action-side memory of the steps since `checkpoint`: the
    /// commanded velocity, the optimizer's previous control and the leg warm
    /// start go back to what was last sent. Reference and integral terms
    /// track measurements and are kept.
    pub fn rollback(&mut self, checkpoint: &Checkpoint) {
        self.state.commanded_velocity = checkpoint.commanded_velocity;
        self.state.last_acceleration = checkpoint.last_acceleration;
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.record_applied(checkpoint.last_acceleration);
        }
        if let (Some(legs), Some(pose)) = (self.legs.as_mut(), checkpoint.leg_pose) {
            legs.restore(pose);
        }
    }

    /// Compute this cycle's action.
    pub fn step(&mut self, body: &BodyState, reference: &Reference) -> ControlOutput {
        let tilt = if body.pitch.abs() > self.config.fall_pitch {
            Signal::Tilted
        } else {
            Signal::Nominal
        };
        let transition = self.signal(tilt);

        if self.state.mode != Mode::Balancing {
            return ControlOutput {
                action: self.zero_action(),
                transition,
                solver: None,
            };
        }

        let ground = self.update_reference(body, reference);
        let position_error = body.ground_position - ground.position;
        self.state.position_error_integral =
            self.feedback
                .integrate_error(self.state.position_error_integral, position_error, self.dt);

        let (acceleration, solver, feedforward) = self.acceleration(body, &ground);
        let acceleration =
            acceleration.clamp(-self.config.max_acceleration, self.config.max_acceleration);
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.record_applied(acceleration);
        }
        self.state.last_acceleration = acceleration;

        let max_velocity =
            self.limits.limit_for(&wheel_key("left_wheel", "velocity")) * self.wheel_radius;
        self.state.commanded_velocity = (self.state.commanded_velocity + acceleration * self.dt)
            .clamp(-max_velocity, max_velocity);

        let mut action = self.wheel_action(reference.yaw_rate, acceleration, feedforward);
        self.set_leg_commands(&mut action, body.pitch, reference.yaw_rate);
        self.limits.clamp(&mut action);

        ControlOutput {
            action,
            transition,
            solver,
        }
    }

    fn update_reference(&mut self, body: &BodyState, reference: &Reference) -> GroundReference {
        let position = match reference.ground_position {
            Some(position) => position,
            None => match self.state.reference_position {
                Some(position) => position + reference.ground_velocity * self.dt,
                None => body.ground_position,
            },
        };
        self.state.reference_position = Some(position);
        GroundReference {
            position,
            velocity: reference.ground_velocity,
        }
    }

    /// Returns the acceleration, the optimizer outcome and whether the
    /// feed-forward torque applies.
    fn acceleration(
        &mut self,
        body: &BodyState,
        ground: &GroundReference,
    ) -> (f64, Option<SolverOutcome>, bool) {
        let feedback =
            self.feedback
                .acceleration(body, ground, self.state.position_error_integral);

        let Some(optimizer) = self.optimizer.as_mut() else {
            return (feedback, None, false);
        };

        match optimizer.plan(body, ground) {
            Ok(plan) => (
                plan.acceleration,
                Some(SolverOutcome::Solved {
                    acceleration: plan.acceleration,
                    iterations: plan.iterations,
                    solve_time_us: u64::try_from(plan.solve_time.as_micros()).unwrap_or(u64::MAX),
                }),
                true,
            ),
            Err(infeasible) => {
                tracing::debug!("Falling back to feedback law: {}", infeasible);
                (
                    feedback,
                    Some(SolverOutcome::Fallback {
                        status: infeasible.status,
                    }),
                    false,
                )
            }
        }
    }

    fn wheel_action(&self, yaw_rate: f64, acceleration: f64, feedforward: bool) -> Action {
        let v = self.state.commanded_velocity;
        let turn = yaw_rate * self.config.wheel_distance / 2.0;
        let r = self.wheel_radius;

        let torque = if feedforward {
            self.config.body_mass * r * acceleration / 2.0
        } else {
            0.0
        };

        Action::new()
            .with(wheel_key("left_wheel", "velocity"), vec![(v - turn) / r])
            .with(
                wheel_key("right_wheel", "velocity"),
                vec![self.right_sign * (v + turn) / r],
            )
            .with(wheel_key("left_wheel", "feedforward_torque"), vec![torque])
            .with(
                wheel_key("right_wheel", "feedforward_torque"),
                vec![self.right_sign * torque],
            )
    }

    fn set_leg_commands(&mut self, action: &mut Action, pitch: f64, yaw_rate: f64) {
        let law = self.config.law;
        let Some(legs) = self.legs.as_mut() else {
            return;
        };
        let pose = if law == ControlLaw::WholeBody {
            legs.solve(pitch).pose
        } else {
            legs.nominal()
        };
        let gain = legs.gain_scale(yaw_rate);
        for side in ["left", "right"] {
            action.set(&leg_key(&format!("{side}_hip")), vec![pose.hip]);
            action.set(&leg_key(&format!("{side}_knee")), vec![pose.knee]);
        }
        for joint in LEG_JOINTS {
            action.set(&leg_gain_key(joint, "kp_scale"), vec![gain]);
            action.set(&leg_gain_key(joint, "kd_scale"), vec![gain]);
        }
    }

    fn reset_integrators(&mut self) {
        self.state.position_error_integral = 0.0;
        self.state.reference_position = None;
        self.state.commanded_velocity = 0.0;
        self.state.last_acceleration = 0.0;
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.reset();
        }
        if let Some(legs) = self.legs.as_mut() {
            legs.reset();
        }
    }

    fn reset(&mut self) {
        self.reset_integrators();
        self.state = ControllerState {
            mode: self.state.mode,
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClampPolicy, LegConfig, OptimizerConfig};
    use approx::assert_relative_eq;

    fn config(law: ControlLaw) -> BalancerConfig {
        let mut config = BalancerConfig::default();
        config.controller.law = law;
        config.optimizer = OptimizerConfig {
            time_budget: 1.0,
            max_iterations: 100,
            ..Default::default()
        };
        if law == ControlLaw::WholeBody {
            config.legs = Some(LegConfig::default());
        }
        config
    }

    fn balancing(law: ControlLaw) -> BalanceController {
        let mut controller = BalanceController::new(&config(law));
        controller.command(OperatorCommand::Start);
        controller
    }

    fn lean(pitch: f64) -> BodyState {
        BodyState {
            pitch,
            ..Default::default()
        }
    }

    fn left_velocity(action: &Action) -> f64 {
        action.scalar(&wheel_key("left_wheel", "velocity")).unwrap()
    }

    #[test]
    fn test_stopped_emits_zero() {
        let mut controller = BalanceController::new(&config(ControlLaw::DirectFeedback));
        let out = controller.step(&lean(0.2), &Reference::velocity(0.5));
        assert_eq!(controller.mode(), Mode::Stopped);
        assert!(out.action.is_zero());
        assert_eq!(out.action.schema(), *controller.action_schema());
    }

    #[test]
    fn test_start_transition_is_reported_once() {
        let mut controller = BalanceController::new(&config(ControlLaw::DirectFeedback));
        let t = controller.command(OperatorCommand::Start).unwrap();
        assert_eq!((t.from, t.to), (Mode::Stopped, Mode::Balancing));
        assert!(controller.command(OperatorCommand::Start).is_none());
    }

    #[test]
    fn test_forward_lean_drives_wheels_forward() {
        let mut controller = balancing(ControlLaw::DirectFeedback);
        let out = controller.step(&lean(0.05), &Reference::default());
        let left = left_velocity(&out.action);
        let right = out
            .action
            .scalar(&wheel_key("right_wheel", "velocity"))
            .unwrap();
        assert!(left > 0.0);
        // Mirrored right wheel.
        assert_relative_eq!(right, -left, epsilon = 1e-12);
        assert_relative_eq!(
            controller.state().commanded_velocity,
            64.1 * 0.05 * 0.005,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_yaw_rate_turns_differentially() {
        let mut controller = balancing(ControlLaw::DirectFeedback);
        let out = controller.step(&lean(0.0), &Reference {
            yaw_rate: 1.0,
            ..Default::default()
        });
        let left = left_velocity(&out.action);
        let right = out
            .action
            .scalar(&wheel_key("right_wheel", "velocity"))
            .unwrap();
        // (0 ∓ 1.0 * 0.3 / 2) / 0.06, right mirrored.
        assert_relative_eq!(left, -2.5, epsilon = 1e-12);
        assert_relative_eq!(right, -2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_tilt_forces_fallen_with_zero_action() {
        let mut controller = balancing(ControlLaw::DirectFeedback);
        controller.step(&lean(0.1), &Reference::default());

        let out = controller.step(&lean(1.2), &Reference::default());
        assert_eq!(controller.mode(), Mode::Fallen);
        assert!(out.action.is_zero());
        let t = out.transition.unwrap();
        assert_eq!((t.from, t.to, t.signal), (Mode::Balancing, Mode::Fallen, Signal::Tilted));
    }

    #[test]
    fn test_fallen_is_absorbing_until_reset() {
        let mut controller = balancing(ControlLaw::DirectFeedback);
        controller.step(&lean(-1.5), &Reference::default());
        assert_eq!(controller.mode(), Mode::Fallen);

        controller.command(OperatorCommand::Start);
        for _ in 0..10 {
            let out = controller.step(&lean(0.0), &Reference::velocity(1.0));
            assert!(out.action.is_zero());
            assert_eq!(controller.mode(), Mode::Fallen);
        }

        controller.command(OperatorCommand::Reset);
        assert_eq!(controller.mode(), Mode::Stopped);
        controller.command(OperatorCommand::Start);
        assert_eq!(controller.mode(), Mode::Balancing);
    }

    #[test]
    fn test_stop_resets_state() {
        let mut controller = balancing(ControlLaw::DirectFeedback);
        for _ in 0..10 {
            controller.step(&lean(0.05), &Reference::velocity(0.2));
        }
        assert!(controller.state().commanded_velocity != 0.0);

        controller.command(OperatorCommand::Stop);
        assert_eq!(
            *controller.state(),
            ControllerState {
                mode: Mode::Stopped,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_reference_position_anchors_then_integrates() {
        let mut controller = balancing(ControlLaw::DirectFeedback);
        let body = BodyState {
            ground_position: 2.0,
            ..Default::default()
        };
        controller.step(&body, &Reference::velocity(1.0));
        assert_eq!(controller.state().reference_position, Some(2.0));
        controller.step(&body, &Reference::velocity(1.0));
        assert_relative_eq!(
            controller.state().reference_position.unwrap(),
            2.005,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_actions_respect_limits() {
        let mut cfg = config(ControlLaw::DirectFeedback);
        cfg.limits.clamp = ClampPolicy::Shared { limit: 1.0 };
        let mut controller = BalanceController::new(&cfg);
        controller.command(OperatorCommand::Start);
        for _ in 0..200 {
            let out = controller.step(&lean(0.9), &Reference::velocity(3.0));
            assert!(controller.limits().admits(&out.action));
        }
    }

    #[test]
    fn test_model_predictive_reports_solver_and_feedforward() {
        let mut controller = balancing(ControlLaw::ModelPredictive);
        let out = controller.step(&lean(0.05), &Reference::default());
        let Some(SolverOutcome::Solved { acceleration, .. }) = out.solver else {
            panic!("expected a solved plan, got {:?}", out.solver);
        };
        let torque = out
            .action
            .scalar(&wheel_key("left_wheel", "feedforward_torque"))
            .unwrap();
        assert_relative_eq!(torque, 5.0 * 0.06 * acceleration / 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_infeasible_plan_falls_back_to_feedback() {
        let mut mpc_config = config(ControlLaw::ModelPredictive);
        mpc_config.optimizer.tilt_limit = 0.01;
        let mut mpc = BalanceController::new(&mpc_config);
        mpc.command(OperatorCommand::Start);
        let mut direct = balancing(ControlLaw::DirectFeedback);

        for i in 0..5 {
            let body = BodyState {
                pitch: 0.1,
                ground_velocity: 0.01 * i as f64,
                ..Default::default()
            };
            let a = mpc.step(&body, &Reference::default());
            let b = direct.step(&body, &Reference::default());
            assert!(matches!(a.solver, Some(SolverOutcome::Fallback { .. })));
            assert_eq!(a.action, b.action);
        }
    }

    #[test]
    fn test_whole_body_moves_legs() {
        let mut controller = balancing(ControlLaw::WholeBody);
        let nominal = LegCoordinator::new(LegConfig::default()).nominal();

        let out = controller.step(&lean(0.3), &Reference::default());
        let hip = out.action.scalar(&leg_key("left_hip")).unwrap();
        assert!((hip - nominal.hip).abs() > 1e-3);
        assert_eq!(out.action.scalar(&leg_key("right_hip")), Some(hip));
        assert!(controller.limits().admits(&out.action));
    }

    #[test]
    fn test_legs_hold_nominal_pose_without_whole_body() {
        let mut cfg = config(ControlLaw::DirectFeedback);
        cfg.legs = Some(LegConfig::default());
        let mut controller = BalanceController::new(&cfg);
        controller.command(OperatorCommand::Start);
        let nominal = LegCoordinator::new(LegConfig::default()).nominal();

        let out = controller.step(&lean(0.3), &Reference::default());
        assert_eq!(out.action.scalar(&leg_key("left_knee")), Some(nominal.knee));
        assert_eq!(out.action.schema(), *controller.action_schema());
    }

    #[test]
    fn test_turning_raises_leg_gains() {
        let mut cfg = config(ControlLaw::DirectFeedback);
        cfg.legs = Some(LegConfig {
            gain_scale: 0.8,
            turning_gain_scale: 0.6,
            turning_yaw_rate: 2.0,
            ..LegConfig::default()
        });
        let mut controller = BalanceController::new(&cfg);
        controller.command(OperatorCommand::Start);

        let straight = controller.step(&lean(0.0), &Reference::default());
        let turning = controller.step(&lean(0.0), &Reference {
            yaw_rate: -1.0,
            ..Default::default()
        });
        for joint in LEG_JOINTS {
            for field in ["kp_scale", "kd_scale"] {
                let key = leg_gain_key(joint, field);
                assert_relative_eq!(straight.action.scalar(&key).unwrap(), 0.8, epsilon = 1e-12);
                assert_relative_eq!(turning.action.scalar(&key).unwrap(), 1.1, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_rollback_restores_commanded_velocity() {
        let mut controller = balancing(ControlLaw::DirectFeedback);
        controller.step(&lean(0.05), &Reference::default());
        let sent = controller.state().clone();
        let checkpoint = controller.checkpoint();

        controller.step(&lean(0.05), &Reference::default());
        assert!(controller.state().commanded_velocity > sent.commanded_velocity);

        controller.rollback(&checkpoint);
        assert_eq!(controller.state().commanded_velocity, sent.commanded_velocity);
        assert_eq!(controller.state().last_acceleration, sent.last_acceleration);
    }

    #[test]
    fn test_rollback_restores_optimizer_and_leg_memory() {
        let mut controller = balancing(ControlLaw::WholeBody);
        let mut twin = balancing(ControlLaw::WholeBody);
        controller.step(&lean(0.05), &Reference::default());
        twin.step(&lean(0.05), &Reference::default());

        let checkpoint = controller.checkpoint();
        controller.step(&lean(0.3), &Reference::default());
        controller.rollback(&checkpoint);

        let next = BodyState {
            pitch: 0.04,
            ..Default::default()
        };
        let a = controller.step(&next, &Reference::default());
        let b = twin.step(&next, &Reference::default());
        assert_relative_eq!(
            controller.state().commanded_velocity,
            twin.state().commanded_velocity,
            epsilon = 1e-9
        );
        let hip = leg_key("left_hip");
        assert_relative_eq!(
            a.action.scalar(&hip).unwrap(),
            b.action.scalar(&hip).unwrap(),
            epsilon = 1e-6
        );
    }
}
