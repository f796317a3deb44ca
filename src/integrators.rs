use na::{DMatrix, DVector, Matrix4, Vector4};

use crate::error::NmpcError;
use crate::manipulator::Manipulator;
use crate::types::Float;

const STAGES: usize = 2;
const NX: usize = 4;

/// Butcher tableau of the 2-stage Radau IIA collocation scheme (order 3),
/// collocation points c = [1/3, 1]. The quadrature weights equal the last
/// row of the stage matrix, which is what makes the scheme stiffly accurate.
///
/// Ref: Hairer & Wanner, "Solving Ordinary Differential Equations II",
/// Table 5.2
const A: [[Float; 2]; 2] = [[5.0 / 12.0, -1.0 / 12.0], [3.0 / 4.0, 1.0 / 4.0]];
const B: [Float; 2] = [3.0 / 4.0, 1.0 / 4.0];

/// Single-step implicit Runge-Kutta integrator for the arm dynamics. The
/// control is held constant over the step. Implicitness buys stability at
/// the step sizes the receding-horizon discretization uses, where the
/// swing-up trajectory passes through high-torque regions.
///
/// One instance integrates exactly one model; the nominal and the perturbed
/// plant model each get their own instance and are never mixed.
#[derive(Debug)]
pub struct RadauIIA2 {
    manipulator: Manipulator,
    /// Newton iteration budget for the stage solve
    pub max_iters: usize,
    /// Stage-residual convergence tolerance
    pub tol: Float,
}

struct StageSolution {
    k: [Vector4<Float>; STAGES],
    jac_x: [Matrix4<Float>; STAGES],
    jac_u: [DMatrix<Float>; STAGES],
    /// Converged Newton matrix I - h (A x J), reused for sensitivities
    newton: DMatrix<Float>,
}

impl RadauIIA2 {
    pub fn new(manipulator: Manipulator) -> Self {
        RadauIIA2 {
            manipulator,
            max_iters: 20,
            tol: 1e-10,
        }
    }

    pub fn manipulator(&self) -> &Manipulator {
        &self.manipulator
    }

    /// Advance the state by one interval h under constant control u.
    pub fn step(
        &self,
        x: &Vector4<Float>,
        u: &DVector<Float>,
        h: Float,
    ) -> Result<Vector4<Float>, NmpcError> {
        let stages = self.solve_stages(x, u, h)?;
        Ok(combine(x, &stages.k, h))
    }

    /// Advance the state and return the exact Jacobians of the step output
    /// with respect to x (4x4) and u (4xk), obtained from the implicit
    /// function theorem on the converged stage system.
    pub fn step_with_sensitivities(
        &self,
        x: &Vector4<Float>,
        u: &DVector<Float>,
        h: Float,
    ) -> Result<(Vector4<Float>, Matrix4<Float>, DMatrix<Float>), NmpcError> {
        let stages = self.solve_stages(x, u, h)?;
        let x_next = combine(x, &stages.k, h);
        let nu = self.manipulator.control_dim();

        // dK/dx and dK/du solve the same linear system as the Newton update:
        //     (I - h (A x J)) dK/dx = [J_1; J_2]
        //     (I - h (A x J)) dK/du = [Bj_1; Bj_2]
        let mut rhs_x = DMatrix::zeros(STAGES * NX, NX);
        let mut rhs_u = DMatrix::zeros(STAGES * NX, nu);
        for i in 0..STAGES {
            for r in 0..NX {
                for c in 0..NX {
                    rhs_x[(NX * i + r, c)] = stages.jac_x[i][(r, c)];
                }
                for c in 0..nu {
                    rhs_u[(NX * i + r, c)] = stages.jac_u[i][(r, c)];
                }
            }
        }

        let lu = stages.newton.lu();
        let dk_dx = lu
            .solve(&rhs_x)
            .ok_or(NmpcError::ModelSingularity)?;
        let dk_du = lu
            .solve(&rhs_u)
            .ok_or(NmpcError::ModelSingularity)?;

        let mut dx_dx = Matrix4::identity();
        let mut dx_du = DMatrix::zeros(NX, nu);
        for i in 0..STAGES {
            for r in 0..NX {
                for c in 0..NX {
                    dx_dx[(r, c)] += h * B[i] * dk_dx[(NX * i + r, c)];
                }
                for c in 0..nu {
                    dx_du[(r, c)] += h * B[i] * dk_du[(NX * i + r, c)];
                }
            }
        }

        Ok((x_next, dx_dx, dx_du))
    }

    /// Full-Newton solve of the 8-dimensional nonlinear stage system
    ///     K_i = f(x + h sum_j A_ij K_j, u)
    /// with exact stage Jacobians.
    fn solve_stages(
        &self,
        x: &Vector4<Float>,
        u: &DVector<Float>,
        h: Float,
    ) -> Result<StageSolution, NmpcError> {
        let f0 = self.manipulator.forward_dynamics(x, u)?;
        let mut k = [f0, f0];
        let mut residual = Float::INFINITY;

        for _ in 0..self.max_iters {
            let xs = stage_states(x, &k, h);

            let mut jac_x = [Matrix4::zeros(); STAGES];
            let mut jac_u = [
                DMatrix::zeros(NX, self.manipulator.control_dim()),
                DMatrix::zeros(NX, self.manipulator.control_dim()),
            ];
            let mut r = DVector::zeros(STAGES * NX);
            for i in 0..STAGES {
                let f = self.manipulator.forward_dynamics(&xs[i], u)?;
                let (jx, ju) = self.manipulator.dynamics_jacobians(&xs[i], u)?;
                jac_x[i] = jx;
                jac_u[i] = ju;
                for row in 0..NX {
                    r[NX * i + row] = k[i][row] - f[row];
                }
            }
            residual = r.norm();

            // Newton matrix: block (i, j) = delta_ij I - h A_ij J_i
            let mut newton = DMatrix::identity(STAGES * NX, STAGES * NX);
            for i in 0..STAGES {
                for j in 0..STAGES {
                    for row in 0..NX {
                        for col in 0..NX {
                            newton[(NX * i + row, NX * j + col)] -=
                                h * A[i][j] * jac_x[i][(row, col)];
                        }
                    }
                }
            }

            if residual < self.tol {
                return Ok(StageSolution {
                    k,
                    jac_x,
                    jac_u,
                    newton,
                });
            }

            let delta = newton
                .lu()
                .solve(&r)
                .ok_or(NmpcError::IntegratorNonconvergence {
                    residual,
                    iters: self.max_iters,
                })?;
            for i in 0..STAGES {
                for row in 0..NX {
                    k[i][row] -= delta[NX * i + row];
                }
            }
        }

        Err(NmpcError::IntegratorNonconvergence {
            residual,
            iters: self.max_iters,
        })
    }
}

fn stage_states(
    x: &Vector4<Float>,
    k: &[Vector4<Float>; STAGES],
    h: Float,
) -> [Vector4<Float>; STAGES] {
    let mut xs = [*x, *x];
    for i in 0..STAGES {
        for j in 0..STAGES {
            xs[i] += k[j] * (h * A[i][j]);
        }
    }
    xs
}

fn combine(x: &Vector4<Float>, k: &[Vector4<Float>; STAGES], h: Float) -> Vector4<Float> {
    x + k[0] * (h * B[0]) + k[1] * (h * B[1])
}

#[cfg(test)]
mod integrators_tests {
    use na::dvector;

    use crate::energy::total_energy;
    use crate::manipulator::ArmParams;
    use crate::simulate::rollout;

    use super::*;

    fn elbow_arm() -> Manipulator {
        Manipulator::elbow_actuated(ArmParams::default())
    }

    /// Explicit RK4 reference at a much finer step, used as an independent
    /// oracle for the implicit scheme.
    fn rk4_reference(
        manip: &Manipulator,
        x0: &Vector4<Float>,
        u: &DVector<Float>,
        h: Float,
        n: usize,
    ) -> Vector4<Float> {
        let mut x = *x0;
        for _ in 0..n {
            let f1 = manip.forward_dynamics(&x, u).unwrap();
            let f2 = manip.forward_dynamics(&(x + f1 * (h / 2.0)), u).unwrap();
            let f3 = manip.forward_dynamics(&(x + f2 * (h / 2.0)), u).unwrap();
            let f4 = manip.forward_dynamics(&(x + f3 * h), u).unwrap();
            x += (f1 + f2 * 2.0 + f3 * 2.0 + f4) * (h / 6.0);
        }
        x
    }

    /// Constant elbow torque from rest: the implicit trajectory must match a
    /// fine-step explicit reference.
    #[test]
    fn constant_torque_matches_fine_rk4() {
        // Arrange
        let integrator = RadauIIA2::new(elbow_arm());
        let u = dvector![10.0];
        let x0 = Vector4::zeros();

        // Act
        let mut x = x0;
        for _ in 0..100 {
            x = integrator.step(&x, &u, 0.005).unwrap();
        }

        // Assert
        let x_ref = rk4_reference(integrator.manipulator(), &x0, &u, 1e-4, 5000);
        crate::assert_close!(x[0], x_ref[0], 1e-3);
        crate::assert_close!(x[1], x_ref[1], 1e-3);
        crate::assert_close!(x[2], x_ref[2], 1e-2);
        crate::assert_close!(x[3], x_ref[3], 1e-2);
    }

    /// One h-step vs. two h/2-steps: for an order-3 scheme the difference
    /// shrinks roughly 16x when h halves.
    #[test]
    fn step_halving_convergence_order() {
        let integrator = RadauIIA2::new(elbow_arm());
        let u = dvector![3.0];
        let x = Vector4::new(0.4, -0.3, 0.6, 0.2);

        let err = |h: Float| -> Float {
            let full = integrator.step(&x, &u, h).unwrap();
            let half = integrator.step(&x, &u, h / 2.0).unwrap();
            let halved = integrator.step(&half, &u, h / 2.0).unwrap();
            (full - halved).norm()
        };

        let e1 = err(0.02);
        let e2 = err(0.01);
        assert!(e2 > 0.0);
        assert!(
            e1 / e2 > 8.0,
            "halving the step should shrink the defect ~16x, got {}",
            e1 / e2
        );
    }

    /// With zero control, zero damping and no contact, total mechanical
    /// energy must be conserved up to integrator truncation error.
    #[test]
    fn free_fall_conserves_energy() {
        // Arrange
        let mut params = ArmParams::default();
        params.damping = na::Matrix2::zeros();
        let manip = Manipulator::new(params, DMatrix::identity(2, 2)).unwrap();
        let integrator = RadauIIA2::new(manip);
        let x0 = Vector4::new(1.0, 1.0, 0.5, 0.5);
        let E0 = total_energy(integrator.manipulator(), &x0);

        // Act
        let (xs, _us) = rollout(&integrator, &x0, 1000, 1e-3, |_x| dvector![0.0, 0.0]).unwrap();

        // Assert
        let E = total_energy(integrator.manipulator(), xs.last().unwrap());
        crate::assert_close!(E, E0, 1e-3);
    }

    #[test]
    fn exhausted_newton_budget_reports_nonconvergence() {
        let mut integrator = RadauIIA2::new(elbow_arm());
        integrator.max_iters = 1;

        let x = Vector4::new(0.0, 0.0, 3.0, -2.0);
        let err = integrator.step(&x, &dvector![5.0], 0.5).unwrap_err();
        assert!(matches!(
            err,
            NmpcError::IntegratorNonconvergence { iters: 1, .. }
        ));
    }

    #[test]
    fn sensitivities_match_finite_differences() {
        let integrator = RadauIIA2::new(elbow_arm());
        let x = Vector4::new(0.3, -0.2, 0.4, 0.1);
        let u = dvector![2.0];
        let h = 0.01;
        let eps = 1e-6;

        let (_x_next, dx_dx, dx_du) = integrator.step_with_sensitivities(&x, &u, h).unwrap();

        for j in 0..4 {
            let mut xp = x;
            let mut xm = x;
            xp[j] += eps;
            xm[j] -= eps;
            let fp = integrator.step(&xp, &u, h).unwrap();
            let fm = integrator.step(&xm, &u, h).unwrap();
            for i in 0..4 {
                let fd = (fp[i] - fm[i]) / (2.0 * eps);
                crate::assert_close!(dx_dx[(i, j)], fd, 1e-5);
            }
        }

        let fp = integrator.step(&x, &dvector![2.0 + eps], h).unwrap();
        let fm = integrator.step(&x, &dvector![2.0 - eps], h).unwrap();
        for i in 0..4 {
            let fd = (fp[i] - fm[i]) / (2.0 * eps);
            crate::assert_close!(dx_du[(i, 0)], fd, 1e-5);
        }
    }
}
