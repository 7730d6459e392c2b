//! Linearized wheeled inverted pendulum.
//!
//! State `x = [p, θ, v, θ̇]` (ground position, pitch, ground velocity, pitch
//! rate), input `u = a` (ground acceleration of the wheel axle):
//!
//! ```text
//! ṗ = v
//! θ̇ = θ̇
//! v̇ = a
//! θ̈ = (g / ℓ) θ - a / ℓ
//! ```

use nalgebra::{DMatrix, DVector};

pub const STATE_DIM: usize = 4;

pub const POSITION: usize = 0;
pub const PITCH: usize = 1;
pub const VELOCITY: usize = 2;
pub const PITCH_RATE: usize = 3;

/// Continuous-time `(A_c, B_c)` for a pendulum of length `length`.
pub fn continuous_dynamics(length: f64, gravity: f64) -> (DMatrix<f64>, DMatrix<f64>) {
    let mut a_c = DMatrix::zeros(STATE_DIM, STATE_DIM);
    a_c[(POSITION, VELOCITY)] = 1.0;
    a_c[(PITCH, PITCH_RATE)] = 1.0;
    a_c[(PITCH_RATE, PITCH)] = gravity / length;

    let mut b_c = DMatrix::zeros(STATE_DIM, 1);
    b_c[(VELOCITY, 0)] = 1.0;
    b_c[(PITCH_RATE, 0)] = -1.0 / length;

    (a_c, b_c)
}

/// Zero-order-hold discretization through the exponential of the augmented
/// matrix `[A_c B_c; 0 0] dt`.
pub fn discretize(a_c: &DMatrix<f64>, b_c: &DMatrix<f64>, dt: f64) -> (DMatrix<f64>, DMatrix<f64>) {
    let n_x = a_c.nrows();
    let n_u = b_c.ncols();
    let n_aug = n_x + n_u;

    let mut aug = DMatrix::zeros(n_aug, n_aug);
    aug.view_mut((0, 0), (n_x, n_x)).copy_from(a_c);
    aug.view_mut((0, n_x), (n_x, n_u)).copy_from(b_c);
    aug *= dt;

    let exp_aug = matrix_exp(&aug);

    (
        exp_aug.view((0, 0), (n_x, n_x)).clone_owned(),
        exp_aug.view((0, n_x), (n_x, n_u)).clone_owned(),
    )
}

/// `e^M` by scaling and squaring with a truncated Taylor series.
fn matrix_exp(m: &DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();

    let norm_inf = m
        .row_iter()
        .map(|row| row.iter().map(|x| x.abs()).sum::<f64>())
        .fold(0.0_f64, f64::max);

    let s = if norm_inf > 0.5 {
        (norm_inf.log2().ceil() as i32 + 1).max(1) as u32
    } else {
        0
    };
    let m_scaled = m / f64::from(2u32.pow(s));

    let mut result = DMatrix::identity(n, n);
    let mut term = DMatrix::identity(n, n);
    for k in 1..=16 {
        term = &term * &m_scaled / (k as f64);
        result += &term;
        if term.amax() < 1e-17 {
            break;
        }
    }

    for _ in 0..s {
        result = &result * &result;
    }
    result
}

/// Discrete pendulum model at a fixed step.
#[derive(Debug, Clone)]
pub struct PendulumModel {
    pub a_d: DMatrix<f64>,
    pub b_d: DMatrix<f64>,
    pub dt: f64,
}

impl PendulumModel {
    pub fn new(length: f64, gravity: f64, dt: f64) -> Self {
        let (a_c, b_c) = continuous_dynamics(length, gravity);
        let (a_d, b_d) = discretize(&a_c, &b_c, dt);
        Self { a_d, b_d, dt }
    }

    /// Propagate one step under constant acceleration `u`.
    pub fn step(&self, x: &DVector<f64>, u: f64) -> DVector<f64> {
        &self.a_d * x + self.b_d.column(0) * u
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_matrix_exp_of_zero_is_identity() {
        let result = matrix_exp(&DMatrix::zeros(5, 5));
        assert_relative_eq!(result, DMatrix::identity(5, 5), epsilon = 1e-14);
    }

    #[test]
    fn test_matrix_exp_scalar() {
        let m = DMatrix::from_element(1, 1, 2.5);
        assert_relative_eq!(matrix_exp(&m)[(0, 0)], 2.5_f64.exp(), max_relative = 1e-12);
    }

    #[test]
    fn test_cart_part_is_double_integrator() {
        let dt = 0.02;
        let model = PendulumModel::new(0.4, 9.81, dt);
        assert_relative_eq!(model.a_d[(POSITION, POSITION)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(model.a_d[(POSITION, VELOCITY)], dt, epsilon = 1e-12);
        assert_relative_eq!(model.b_d[(POSITION, 0)], dt * dt / 2.0, epsilon = 1e-12);
        assert_relative_eq!(model.b_d[(VELOCITY, 0)], dt, epsilon = 1e-12);
    }

    #[test]
    fn test_pendulum_part_matches_hyperbolic_solution() {
        let (length, gravity, dt): (f64, f64, f64) = (0.4, 9.81, 0.02);
        let omega = (gravity / length).sqrt();
        let model = PendulumModel::new(length, gravity, dt);

        assert_relative_eq!(model.a_d[(PITCH, PITCH)], (omega * dt).cosh(), epsilon = 1e-12);
        assert_relative_eq!(
            model.a_d[(PITCH, PITCH_RATE)],
            (omega * dt).sinh() / omega,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            model.a_d[(PITCH_RATE, PITCH)],
            omega * (omega * dt).sinh(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_upright_equilibrium_is_fixed_point() {
        let model = PendulumModel::new(0.4, 9.81, 0.005);
        let x = DVector::zeros(STATE_DIM);
        assert_relative_eq!(model.step(&x, 0.0), x, epsilon = 1e-15);
    }

    #[test]
    fn test_forward_acceleration_pitches_back() {
        let model = PendulumModel::new(0.4, 9.81, 0.01);
        let x = model.step(&DVector::zeros(STATE_DIM), 1.0);
        assert!(x[VELOCITY] > 0.0);
        assert!(x[PITCH] < 0.0);
        assert!(x[PITCH_RATE] < 0.0);
    }
}
