//! Receding-horizon QP for the wheeled pendulum.
//!
//! Decision variables: `z = [x_1, ..., x_H, u_0, ..., u_{H-1}]`.
//!
//! Cost, in Clarabel's `½ zᵀ P z + qᵀ z` form:
//!
//! ```text
//! Σ_k (x_k - r_k)ᵀ Q_k (x_k - r_k) + R u_k² + R_Δ (u_k - u_{k-1})²
//! ```
//!
//! with `Q_H` scaled by the terminal weight and `u_{-1}` the control applied
//! on the previous cycle.
//!
//! Subject to:
//! - Dynamics: `x_{k+1} = A_d x_k + B_d u_k` (equality)
//! - `|u_k| ≤ a_max`, `|θ_k| ≤ θ_max`, `|v_k| ≤ v_max` (inequality)

use clarabel::algebra::CscMatrix;
use clarabel::solver::SupportedConeT::{self, NonnegativeConeT, ZeroConeT};
use nalgebra::{DMatrix, DVector};

use super::dynamics::{PendulumModel, PITCH, POSITION, STATE_DIM, VELOCITY};
use crate::config::OptimizerConfig;

/// Inequality rows per horizon step: two each for acceleration, pitch and velocity.
const BOX_ROWS: usize = 6;

/// One cycle's optimization problem. Built, solved and dropped.
pub struct OptimizationProblem<'a> {
    pub model: &'a PendulumModel,
    pub config: &'a OptimizerConfig,
    pub initial_state: DVector<f64>,
    /// Reference state for steps `1..=H`, stacked.
    pub reference: DVector<f64>,
    pub previous_control: f64,
}

/// Matrices in the form expected by `clarabel::solver::DefaultSolver::new`.
pub struct QuadraticProgram {
    pub p: CscMatrix<f64>,
    pub q: Vec<f64>,
    pub a: CscMatrix<f64>,
    pub b: Vec<f64>,
    pub cones: Vec<SupportedConeT<f64>>,
}

impl<'a> OptimizationProblem<'a> {
    /// Set up the problem for the tracking reference `r_k = [x_ref + v_ref k dt, 0, v_ref, 0]`.
    pub fn new(
        model: &'a PendulumModel,
        config: &'a OptimizerConfig,
        initial_state: DVector<f64>,
        reference_position: f64,
        reference_velocity: f64,
        previous_control: f64,
    ) -> Self {
        let h = config.horizon;
        let mut reference = DVector::zeros(STATE_DIM * h);
        for k in 0..h {
            let off = k * STATE_DIM;
            let t = (k + 1) as f64 * model.dt;
            reference[off + POSITION] = reference_position + reference_velocity * t;
            reference[off + VELOCITY] = reference_velocity;
        }

        Self {
            model,
            config,
            initial_state,
            reference,
            previous_control,
        }
    }

    pub fn horizon(&self) -> usize {
        self.config.horizon
    }

    fn num_states(&self) -> usize {
        STATE_DIM * self.horizon()
    }

    fn num_variables(&self) -> usize {
        self.num_states() + self.horizon()
    }

    fn control_index(&self, k: usize) -> usize {
        self.num_states() + k
    }

    pub fn to_qp(&self) -> QuadraticProgram {
        let (p, q) = self.build_cost();
        let (a, b, n_eq, n_ineq) = self.build_constraints();

        QuadraticProgram {
            p: dmatrix_to_csc_upper_tri(&p),
            q: q.iter().copied().collect(),
            a: dmatrix_to_csc(&a),
            b: b.iter().copied().collect(),
            cones: vec![ZeroConeT(n_eq), NonnegativeConeT(n_ineq)],
        }
    }

    fn build_cost(&self) -> (DMatrix<f64>, DVector<f64>) {
        let h = self.horizon();
        let n_z = self.num_variables();
        let cfg = self.config;

        let mut p = DMatrix::zeros(n_z, n_z);
        let mut q = DVector::zeros(n_z);

        for k in 0..h {
            let off = k * STATE_DIM;
            let scale = if k + 1 == h { cfg.terminal_weight } else { 1.0 };
            for (i, &w) in cfg.state_weights.iter().enumerate() {
                let w = w * scale;
                p[(off + i, off + i)] += 2.0 * w;
                q[off + i] -= 2.0 * w * self.reference[off + i];
            }
        }

        let rd = cfg.rate_weight;
        for k in 0..h {
            let u = self.control_index(k);
            p[(u, u)] += 2.0 * (cfg.control_weight + rd);
            if k == 0 {
                q[u] -= 2.0 * rd * self.previous_control;
            } else {
                let prev = self.control_index(k - 1);
                p[(prev, prev)] += 2.0 * rd;
                p[(u, prev)] -= 2.0 * rd;
                p[(prev, u)] -= 2.0 * rd;
            }
        }

        (p, q)
    }

    /// Returns `(A, b, n_eq, n_ineq)`, equalities first.
    ///
    /// Clarabel's nonnegative cone reads `A z + s = b, s ≥ 0`, i.e. `A z ≤ b`.
    fn build_constraints(&self) -> (DMatrix<f64>, DVector<f64>, usize, usize) {
        let h = self.horizon();
        let n_z = self.num_variables();
        let n_eq = STATE_DIM * h;
        let n_ineq = BOX_ROWS * h;
        let a_d = &self.model.a_d;
        let b_d = &self.model.b_d;
        let cfg = self.config;

        let mut a = DMatrix::zeros(n_eq + n_ineq, n_z);
        let mut b = DVector::zeros(n_eq + n_ineq);

        // k = 0:  x_1 - B_d u_0 = A_d x_0
        // k ≥ 1:  x_{k+1} - A_d x_k - B_d u_k = 0
        let mut row = 0;
        for k in 0..h {
            let next = k * STATE_DIM;
            let u = self.control_index(k);
            for i in 0..STATE_DIM {
                a[(row + i, next + i)] = 1.0;
                a[(row + i, u)] = -b_d[(i, 0)];
            }
            if k == 0 {
                let ax0 = a_d * &self.initial_state;
                for i in 0..STATE_DIM {
                    b[row + i] = ax0[i];
                }
            } else {
                let current = (k - 1) * STATE_DIM;
                for i in 0..STATE_DIM {
                    for j in 0..STATE_DIM {
                        a[(row + i, current + j)] = -a_d[(i, j)];
                    }
                }
            }
            row += STATE_DIM;
        }

        let mut bound = |row: &mut usize, col: usize, limit: f64| {
            a[(*row, col)] = 1.0;
            b[*row] = limit;
            a[(*row + 1, col)] = -1.0;
            b[*row + 1] = limit;
            *row += 2;
        };
        for k in 0..h {
            let off = k * STATE_DIM;
            bound(&mut row, self.control_index(k), cfg.acceleration_limit);
            bound(&mut row, off + PITCH, cfg.tilt_limit);
            bound(&mut row, off + VELOCITY, cfg.velocity_limit);
        }
        debug_assert_eq!(row, n_eq + n_ineq);

        (a, b, n_eq, n_ineq)
    }
}

/// Full matrix to CSC, dropping exact zeros.
fn dmatrix_to_csc(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v != 0.0 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Upper triangle of a symmetric matrix to CSC.
fn dmatrix_to_csc_upper_tri(m: &DMatrix<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..=j.min(nrows.saturating_sub(1)) {
            let v = m[(i, j)];
            if v != 0.0 {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn setup(horizon: usize) -> (PendulumModel, OptimizerConfig) {
        let config = OptimizerConfig {
            horizon,
            ..Default::default()
        };
        let model = PendulumModel::new(config.pendulum_length, config.gravity, config.timestep);
        (model, config)
    }

    #[test]
    fn test_reference_trajectory_advances_position() {
        let (model, config) = setup(3);
        let problem =
            OptimizationProblem::new(&model, &config, DVector::zeros(STATE_DIM), 1.0, 0.5, 0.0);
        for k in 0..3 {
            let off = k * STATE_DIM;
            let t = (k + 1) as f64 * config.timestep;
            assert_relative_eq!(problem.reference[off + POSITION], 1.0 + 0.5 * t, epsilon = 1e-12);
            assert_eq!(problem.reference[off + PITCH], 0.0);
            assert_eq!(problem.reference[off + VELOCITY], 0.5);
        }
    }

    #[test]
    fn test_dimensions() {
        let (model, config) = setup(4);
        let problem =
            OptimizationProblem::new(&model, &config, DVector::zeros(STATE_DIM), 0.0, 0.0, 0.0);
        let qp = problem.to_qp();
        let n_z = 5 * 4;
        assert_eq!(qp.q.len(), n_z);
        assert_eq!(qp.p.n, n_z);
        assert_eq!(qp.a.m, 4 * 4 + 6 * 4);
        assert_eq!(qp.a.n, n_z);
        assert_eq!(qp.b.len(), qp.a.m);
    }

    #[test]
    fn test_rate_cost_couples_consecutive_controls() {
        let (model, config) = setup(3);
        let problem =
            OptimizationProblem::new(&model, &config, DVector::zeros(STATE_DIM), 0.0, 0.0, 2.0);
        let (p, q) = problem.build_cost();
        let (u0, u1, u2) = (12, 13, 14);
        let rd = config.rate_weight;
        let r = config.control_weight;

        assert_relative_eq!(p[(u0, u1)], -2.0 * rd, epsilon = 1e-12);
        assert_relative_eq!(p[(u1, u0)], -2.0 * rd, epsilon = 1e-12);
        assert_relative_eq!(p[(u1, u1)], 2.0 * (r + 2.0 * rd), epsilon = 1e-12);
        assert_relative_eq!(p[(u2, u2)], 2.0 * (r + rd), epsilon = 1e-12);
        assert_relative_eq!(q[u0], -2.0 * rd * 2.0, epsilon = 1e-12);
        assert_eq!(q[u1], 0.0);
    }

    #[test]
    fn test_terminal_weight_applies_to_last_step() {
        let (model, config) = setup(3);
        let problem =
            OptimizationProblem::new(&model, &config, DVector::zeros(STATE_DIM), 0.0, 0.0, 0.0);
        let (p, _) = problem.build_cost();
        let w = config.state_weights[PITCH];
        assert_relative_eq!(p[(PITCH, PITCH)], 2.0 * w, epsilon = 1e-12);
        assert_relative_eq!(
            p[(2 * STATE_DIM + PITCH, 2 * STATE_DIM + PITCH)],
            2.0 * w * config.terminal_weight,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_upper_triangle_conversion() {
        let m = DMatrix::from_row_slice(3, 3, &[2.0, -1.0, 0.0, -1.0, 2.0, 0.5, 0.0, 0.5, 3.0]);
        let csc = dmatrix_to_csc_upper_tri(&m);
        assert_eq!(csc.colptr, vec![0, 1, 3, 5]);
        assert_eq!(csc.rowval, vec![0, 0, 1, 1, 2]);
        assert_eq!(csc.nzval, vec![2.0, -1.0, 2.0, 0.5, 3.0]);
    }
}
