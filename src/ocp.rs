use na::{DMatrix, DVector, Vector2, Vector4};

use crate::error::NmpcError;
use crate::integrators::RadauIIA2;
use crate::types::Float;

/// Which stage the large position-target penalty lands on. The reference
/// formulation penalized the initial stage; penalizing the terminal stage is
/// the behavior consistent with driving the arm upright, so it is the
/// default. The terminal state is pinned by bounds in both cases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPenalty {
    InitialStage,
    TerminalStage,
}

/// Static layout of the flat decision vector
///     w = [X_0, ..., X_N, U_0, ..., U_{N-1}]
/// with nx = 4 state entries per stage and nu control entries per stage.
/// Offsets are fixed for the life of one MPC run.
#[derive(Clone, Copy, Debug)]
pub struct HorizonLayout {
    /// Number of control stages N; there are N + 1 state stages.
    pub n: usize,
    pub nx: usize,
    pub nu: usize,
}

impl HorizonLayout {
    pub fn new(n: usize, nu: usize) -> Self {
        HorizonLayout { n, nx: 4, nu }
    }

    pub fn n_vars(&self) -> usize {
        (self.n + 1) * self.nx + self.n * self.nu
    }

    pub fn n_constraints(&self) -> usize {
        self.n * self.nx
    }

    pub fn x_offset(&self, k: usize) -> usize {
        debug_assert!(k <= self.n);
        k * self.nx
    }

    pub fn u_offset(&self, k: usize) -> usize {
        debug_assert!(k < self.n);
        (self.n + 1) * self.nx + k * self.nu
    }

    pub fn state_of(&self, w: &DVector<Float>, k: usize) -> Vector4<Float> {
        let o = self.x_offset(k);
        Vector4::new(w[o], w[o + 1], w[o + 2], w[o + 3])
    }

    pub fn control_of(&self, w: &DVector<Float>, k: usize) -> DVector<Float> {
        let o = self.u_offset(k);
        DVector::from_fn(self.nu, |i, _| w[o + i])
    }
}

/// Builds the discretized optimal control problem: continuity constraints
/// linking consecutive stages through the nominal integrator, the quadratic
/// tracking-plus-effort cost, and the box bounds that pin the first stage to
/// the measured plant state and the last stage to the upright target.
#[derive(Debug)]
pub struct OcpBuilder {
    pub integrator: RadauIIA2,
    pub layout: HorizonLayout,
    /// Discretization interval h = T / N
    pub h: Float,
    pub q_target: Vector2<Float>,
    pub position_weight: Float,
    pub penalty: TargetPenalty,
    pub u_max: Float,
}

impl OcpBuilder {
    pub fn target_state(&self) -> Vector4<Float> {
        Vector4::new(self.q_target[0], self.q_target[1], 0.0, 0.0)
    }

    fn penalized_stage(&self) -> usize {
        match self.penalty {
            TargetPenalty::InitialStage => 0,
            TargetPenalty::TerminalStage => self.layout.n,
        }
    }

    /// Continuity-constraint residual g(w): block k is
    ///     Integrator(x_k, u_k, h) - x_{k+1}
    pub fn constraint_residual(&self, w: &DVector<Float>) -> Result<DVector<Float>, NmpcError> {
        let lay = &self.layout;
        let mut g = DVector::zeros(lay.n_constraints());
        for k in 0..lay.n {
            let xk = lay.state_of(w, k);
            let uk = lay.control_of(w, k);
            let x_next = self.integrator.step(&xk, &uk, self.h)?;
            let xk1 = lay.state_of(w, k + 1);
            for r in 0..lay.nx {
                g[lay.nx * k + r] = x_next[r] - xk1[r];
            }
        }
        Ok(g)
    }

    /// Residual and Jacobian of the continuity constraints at the current
    /// iterate, in one pass. Block row k carries the integrator
    /// sensitivities at the columns of X_k and U_k and -I at X_{k+1}.
    pub fn linearize(
        &self,
        w: &DVector<Float>,
    ) -> Result<(DVector<Float>, DMatrix<Float>), NmpcError> {
        let lay = &self.layout;
        let mut g = DVector::zeros(lay.n_constraints());
        let mut jac = DMatrix::zeros(lay.n_constraints(), lay.n_vars());
        for k in 0..lay.n {
            let xk = lay.state_of(w, k);
            let uk = lay.control_of(w, k);
            let (x_next, dx_dx, dx_du) = self.integrator.step_with_sensitivities(&xk, &uk, self.h)?;

            let row = lay.nx * k;
            let xk1 = lay.state_of(w, k + 1);
            for r in 0..lay.nx {
                g[row + r] = x_next[r] - xk1[r];
                jac[(row + r, lay.x_offset(k + 1) + r)] = -1.0;
                for c in 0..lay.nx {
                    jac[(row + r, lay.x_offset(k) + c)] = dx_dx[(r, c)];
                }
                for c in 0..lay.nu {
                    jac[(row + r, lay.u_offset(k) + c)] = dx_du[(r, c)];
                }
            }
        }
        Ok((g, jac))
    }

    /// Constant cost Hessian of
    ///     J(w) = sum_k |dq_k|^2 + sum_k |u_k|^2
    ///          + weight * |q_s - q_target|^2
    /// where s is the penalized stage. Diagonal, constant across iterations.
    pub fn cost_hessian(&self) -> DMatrix<Float> {
        let lay = &self.layout;
        let mut P = DMatrix::zeros(lay.n_vars(), lay.n_vars());
        for k in 0..=lay.n {
            let o = lay.x_offset(k);
            P[(o + 2, o + 2)] = 2.0;
            P[(o + 3, o + 3)] = 2.0;
        }
        for k in 0..lay.n {
            let o = lay.u_offset(k);
            for i in 0..lay.nu {
                P[(o + i, o + i)] = 2.0;
            }
        }
        let o = lay.x_offset(self.penalized_stage());
        P[(o, o)] += 2.0 * self.position_weight;
        P[(o + 1, o + 1)] += 2.0 * self.position_weight;
        P
    }

    /// Cost gradient at the iterate w
    pub fn cost_gradient(&self, w: &DVector<Float>) -> DVector<Float> {
        let lay = &self.layout;
        let mut g = DVector::zeros(lay.n_vars());
        for k in 0..=lay.n {
            let o = lay.x_offset(k);
            g[o + 2] = 2.0 * w[o + 2];
            g[o + 3] = 2.0 * w[o + 3];
        }
        for k in 0..lay.n {
            let o = lay.u_offset(k);
            for i in 0..lay.nu {
                g[o + i] = 2.0 * w[o + i];
            }
        }
        let o = lay.x_offset(self.penalized_stage());
        g[o] += 2.0 * self.position_weight * (w[o] - self.q_target[0]);
        g[o + 1] += 2.0 * self.position_weight * (w[o + 1] - self.q_target[1]);
        g
    }

    /// Box bounds on the decision vector: controls clamped to +-u_max, the
    /// first state stage pinned to the measured plant state, the last state
    /// stage pinned to the upright target, everything else free.
    pub fn bounds(&self, x_current: &Vector4<Float>) -> (DVector<Float>, DVector<Float>) {
        let lay = &self.layout;
        let mut lb = DVector::from_element(lay.n_vars(), Float::NEG_INFINITY);
        let mut ub = DVector::from_element(lay.n_vars(), Float::INFINITY);

        for k in 0..lay.n {
            let o = lay.u_offset(k);
            for i in 0..lay.nu {
                lb[o + i] = -self.u_max;
                ub[o + i] = self.u_max;
            }
        }

        let target = self.target_state();
        for r in 0..lay.nx {
            lb[lay.x_offset(0) + r] = x_current[r];
            ub[lay.x_offset(0) + r] = x_current[r];
            lb[lay.x_offset(lay.n) + r] = target[r];
            ub[lay.x_offset(lay.n) + r] = target[r];
        }

        (lb, ub)
    }
}
