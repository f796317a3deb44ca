use na::{DMatrix, DVector, Matrix2, Matrix4, Vector2, Vector4};

use crate::error::NmpcError;
use crate::types::Float;
use crate::GRAVITY;

/// Physical parameters of the two-link planar arm. Immutable once the
/// manipulator is constructed.
///
/// Ref. frame: x to the right, y up, both joints revolute about the out-of-
/// plane axis. q = 0 lays both links along +x.
#[derive(Clone, Debug, PartialEq)]
pub struct ArmParams {
    /// Link masses [kg]
    pub m: [Float; 2],
    /// Link lengths [m]
    pub d: [Float; 2],
    /// Center-of-mass offsets along each link [m]
    pub l: [Float; 2],
    /// Link moments of inertia [kg*m^2]
    pub I: [Float; 2],
    /// Gravity constant [m/s^2]
    pub g: Float,
    /// Diagonal viscous joint damping
    pub damping: Matrix2<Float>,
    /// Contact stiffness of the end-effector ground spring. `None` disables
    /// contact entirely; the perturbed plant model differs from the nominal
    /// model only in this value.
    pub K: Option<Float>,
}

impl Default for ArmParams {
    fn default() -> Self {
        ArmParams {
            m: [1.0, 1.0],
            d: [1.0, 1.0],
            l: [0.5, 0.5],
            I: [0.01, 0.01],
            g: GRAVITY,
            damping: Matrix2::identity() * 0.1,
            K: None,
        }
    }
}

/// Two-link planar manipulator with the manipulator-equation terms written
/// out in closed form:
///     H(q) qddot + C(q, qdot) qdot + G(q) + D qdot = B u + tau_contact
///
/// Only q1 (the elbow angle) enters H and C; G depends on the absolute
/// angles q0 and q0 + q1.
///
/// Ref: https://underactuated.csail.mit.edu/multibody.html#manipulator
#[derive(Debug)]
pub struct Manipulator {
    pub params: ArmParams,
    /// Actuator selection matrix, 2 x k. Maps actuator torques into
    /// generalized-force space; k = 1 with only the elbow actuated.
    pub B: DMatrix<Float>,

    // Parameter-only coefficients of H, C and G, fixed at construction
    a1: Float,
    a2: Float,
    a3: Float,
    a4: Float,
    a5: Float,
}

impl Manipulator {
    pub fn new(params: ArmParams, B: DMatrix<Float>) -> Result<Self, NmpcError> {
        if B.nrows() != 2 {
            return Err(NmpcError::DimensionMismatch {
                what: "actuator selection matrix rows",
                expected: 2,
                actual: B.nrows(),
            });
        }

        let m = &params.m;
        let d = &params.d;
        let l = &params.l;
        let I = &params.I;
        let a1 = I[0] + m[0] * d[0] * d[0] + I[1] + m[1] * d[1] * d[1] + m[1] * l[0] * l[0];
        let a2 = m[1] * l[0] * d[1];
        let a3 = I[1] + m[1] * d[1] * d[1];
        let a4 = params.g * (m[0] * d[0] + m[1] * l[0]);
        let a5 = params.g * m[1] * d[1];

        Ok(Manipulator {
            params,
            B,
            a1,
            a2,
            a3,
            a4,
            a5,
        })
    }

    /// Arm with only the second (elbow) joint actuated, i.e. B = [0, 1]'
    pub fn elbow_actuated(params: ArmParams) -> Self {
        let B = DMatrix::from_column_slice(2, 1, &[0.0, 1.0]);
        Manipulator::new(params, B).unwrap() // B shape is valid by construction
    }

    /// Number of actuated degrees of freedom k
    pub fn control_dim(&self) -> usize {
        self.B.ncols()
    }

    /// Mass matrix H(q), symmetric positive definite for positive
    /// masses/inertias. Independent of q0.
    pub fn mass_matrix(&self, q: &Vector2<Float>) -> Matrix2<Float> {
        let c1 = q[1].cos();
        let H00 = self.a1 + 2.0 * self.a2 * c1;
        let H01 = self.a2 * c1 + self.a3;
        Matrix2::new(H00, H01, H01, self.a3)
    }

    /// Coriolis/centrifugal matrix C(q, qdot) in the standard skew-structured
    /// manipulator form.
    pub fn coriolis_matrix(&self, q: &Vector2<Float>, dq: &Vector2<Float>) -> Matrix2<Float> {
        let s1 = q[1].sin();
        Matrix2::new(
            -2.0 * self.a2 * s1 * dq[1],
            -self.a2 * s1 * dq[1],
            self.a2 * s1 * dq[0],
            0.0,
        )
    }

    /// Gravity-load vector G(q)
    pub fn gravity_vector(&self, q: &Vector2<Float>) -> Vector2<Float> {
        let c0 = q[0].cos();
        let c01 = (q[0] + q[1]).cos();
        Vector2::new(self.a4 * c0 + self.a5 * c01, self.a5 * c01)
    }

    /// Forward kinematics: 2D positions of the elbow joint and the
    /// end-effector. Exposed for the visualization collaborator.
    pub fn forward_kinematics(&self, q: &Vector2<Float>) -> (Vector2<Float>, Vector2<Float>) {
        let d = &self.params.d;
        let elbow = Vector2::new(d[0] * q[0].cos(), d[0] * q[0].sin());
        let ee = Vector2::new(
            elbow[0] + d[1] * (q[0] + q[1]).cos(),
            elbow[1] + d[1] * (q[0] + q[1]).sin(),
        );
        (elbow, ee)
    }

    /// Row of the end-effector Jacobian for its height: d(y_ee)/dq
    fn ee_height_jacobian(&self, q: &Vector2<Float>) -> Vector2<Float> {
        let d = &self.params.d;
        let c0 = q[0].cos();
        let c01 = (q[0] + q[1]).cos();
        Vector2::new(d[0] * c0 + d[1] * c01, d[1] * c01)
    }

    /// Generalized torque of the end-effector ground spring: a vertical force
    /// -K * y_ee whenever the end-effector is below y = 0, mapped through the
    /// height row of the end-effector Jacobian. Zero when contact is disabled
    /// or the end-effector is above ground.
    pub fn contact_torque(&self, q: &Vector2<Float>) -> Vector2<Float> {
        let Some(K) = self.params.K else {
            return Vector2::zeros();
        };
        let (_, ee) = self.forward_kinematics(q);
        if ee[1] >= 0.0 {
            return Vector2::zeros();
        }
        let Jy = self.ee_height_jacobian(q);
        Jy * (-K * ee[1])
    }

    /// d(tau_contact)/dq, zero outside the active contact region
    fn contact_torque_jacobian(&self, q: &Vector2<Float>) -> Matrix2<Float> {
        let Some(K) = self.params.K else {
            return Matrix2::zeros();
        };
        let (_, ee) = self.forward_kinematics(q);
        if ee[1] >= 0.0 {
            return Matrix2::zeros();
        }
        let d = &self.params.d;
        let s0 = q[0].sin();
        let s01 = (q[0] + q[1]).sin();
        let Jy = self.ee_height_jacobian(q);
        // dJy/dq
        let dJy = Matrix2::new(
            -d[0] * s0 - d[1] * s01,
            -d[1] * s01,
            -d[1] * s01,
            -d[1] * s01,
        );
        let fy = -K * ee[1];
        dJy * fy - (Jy * Jy.transpose()) * K
    }

    /// Total generalized force: B u - C qdot - G - D qdot + tau_contact
    fn generalized_force(
        &self,
        q: &Vector2<Float>,
        dq: &Vector2<Float>,
        u: &DVector<Float>,
    ) -> Vector2<Float> {
        let Bu = &self.B * u;
        let C = self.coriolis_matrix(q, dq);
        let G = self.gravity_vector(q);
        Vector2::new(Bu[0], Bu[1]) - C * dq - G - self.params.damping * dq
            + self.contact_torque(q)
    }

    /// Forward dynamics: xdot = [qdot, H(q)^-1 (B u - C qdot - G - D qdot)]
    /// for state x = [q, qdot].
    pub fn forward_dynamics(
        &self,
        x: &Vector4<Float>,
        u: &DVector<Float>,
    ) -> Result<Vector4<Float>, NmpcError> {
        self.check_control_dim(u)?;
        let q = x.fixed_rows::<2>(0).into_owned();
        let dq = x.fixed_rows::<2>(2).into_owned();

        let H = self.mass_matrix(&q);
        let tau = self.generalized_force(&q, &dq, u);
        let vdot = H.lu().solve(&tau).ok_or(NmpcError::ModelSingularity)?;

        Ok(Vector4::new(dq[0], dq[1], vdot[0], vdot[1]))
    }

    /// Exact closed-form Jacobians of the forward dynamics: (df/dx, df/du)
    /// with df/dx 4x4 and df/du 4xk. Derived by hand from the a1..a5
    /// coefficient form of H, C and G; no symbolic engine needed for the
    /// fixed 2-link structure.
    pub fn dynamics_jacobians(
        &self,
        x: &Vector4<Float>,
        u: &DVector<Float>,
    ) -> Result<(Matrix4<Float>, DMatrix<Float>), NmpcError> {
        self.check_control_dim(u)?;
        let q = x.fixed_rows::<2>(0).into_owned();
        let dq = x.fixed_rows::<2>(2).into_owned();
        let (s1, c1) = q[1].sin_cos();
        let s0 = q[0].sin();
        let s01 = (q[0] + q[1]).sin();
        let a2 = self.a2;

        let H = self.mass_matrix(&q);
        let Hinv = H.try_inverse().ok_or(NmpcError::ModelSingularity)?;
        let tau = self.generalized_force(&q, &dq, u);
        let vdot = Hinv * tau;

        // dH/dq1 (dH/dq0 = 0)
        let dH1 = Matrix2::new(-2.0 * a2 * s1, -a2 * s1, -a2 * s1, 0.0);

        // dG/dq
        let dG0 = Vector2::new(-self.a4 * s0 - self.a5 * s01, -self.a5 * s01);
        let dG1 = Vector2::new(-self.a5 * s01, -self.a5 * s01);

        // d(C qdot)/dq1; the product is independent of q0
        let dCdq1 = Vector2::new(
            -2.0 * a2 * c1 * dq[0] * dq[1] - a2 * c1 * dq[1] * dq[1],
            a2 * c1 * dq[0] * dq[0],
        );

        let dTc = self.contact_torque_jacobian(&q);

        let dtau0 = -dG0 + dTc.column(0).into_owned();
        let dtau1 = -dCdq1 - dG1 + dTc.column(1).into_owned();

        let dvdot_dq0 = Hinv * dtau0;
        let dvdot_dq1 = Hinv * (dtau1 - dH1 * vdot);

        // d(C qdot)/dqdot, written out from the quadratic velocity products
        let dCv = Matrix2::new(
            -2.0 * a2 * s1 * dq[1],
            -2.0 * a2 * s1 * (dq[0] + dq[1]),
            2.0 * a2 * s1 * dq[0],
            0.0,
        );
        let dvdot_ddq = Hinv * (-dCv - self.params.damping);

        let mut A = Matrix4::zeros();
        A[(0, 2)] = 1.0;
        A[(1, 3)] = 1.0;
        A[(2, 0)] = dvdot_dq0[0];
        A[(3, 0)] = dvdot_dq0[1];
        A[(2, 1)] = dvdot_dq1[0];
        A[(3, 1)] = dvdot_dq1[1];
        for r in 0..2 {
            for c in 0..2 {
                A[(2 + r, 2 + c)] = dvdot_ddq[(r, c)];
            }
        }

        let HinvB = Hinv * &self.B;
        let k = self.control_dim();
        let mut Bjac = DMatrix::zeros(4, k);
        for r in 0..2 {
            for c in 0..k {
                Bjac[(2 + r, c)] = HinvB[(r, c)];
            }
        }

        Ok((A, Bjac))
    }

    fn check_control_dim(&self, u: &DVector<Float>) -> Result<(), NmpcError> {
        if u.len() != self.control_dim() {
            return Err(NmpcError::DimensionMismatch {
                what: "control vector",
                expected: self.control_dim(),
                actual: u.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod manipulator_tests {
    use na::{dvector, vector};

    use super::*;

    fn fully_actuated() -> Manipulator {
        Manipulator::new(ArmParams::default(), DMatrix::identity(2, 2)).unwrap()
    }

    #[test]
    fn mass_matrix_symmetric_positive_definite() {
        let manip = fully_actuated();

        for i in 0..20 {
            let q1 = -3.0 + 0.3 * i as Float;
            let q = vector![0.7, q1];
            let H = manip.mass_matrix(&q);

            assert_eq!(H[(0, 1)], H[(1, 0)]);
            let eigs = H.symmetric_eigenvalues();
            assert!(eigs[0] > 0.0 && eigs[1] > 0.0, "H not PD at q1 = {}", q1);
        }
    }

    #[test]
    fn mass_matrix_ignores_base_angle() {
        let manip = fully_actuated();

        let q = vector![0.3, -1.2];
        let shifted = vector![0.3 + 2.2, -1.2];
        assert_eq!(manip.mass_matrix(&q), manip.mass_matrix(&shifted));
    }

    /// From horizontal rest with no input, the arm must accelerate as a pure
    /// gravity collapse: qdot = 0 and qddot = -H^-1 G, with the base joint
    /// swinging downward.
    #[test]
    fn gravity_collapse_from_horizontal() {
        let manip = fully_actuated();

        let x = Vector4::zeros();
        let xdot = manip.forward_dynamics(&x, &dvector![0.0, 0.0]).unwrap();

        assert_eq!(xdot[0], 0.0);
        assert_eq!(xdot[1], 0.0);

        let q = vector![0.0, 0.0];
        let expected = manip
            .mass_matrix(&q)
            .lu()
            .solve(&(-manip.gravity_vector(&q)))
            .unwrap();
        crate::assert_close!(xdot[2], expected[0], 1e-12);
        crate::assert_close!(xdot[3], expected[1], 1e-12);
        assert!(xdot[2] < 0.0, "arm should fall under gravity, got {}", xdot[2]);
    }

    #[test]
    fn wrong_control_size_is_rejected() {
        let manip = Manipulator::elbow_actuated(ArmParams::default());

        let err = manip
            .forward_dynamics(&Vector4::zeros(), &dvector![1.0, 2.0])
            .unwrap_err();
        assert_eq!(
            err,
            NmpcError::DimensionMismatch {
                what: "control vector",
                expected: 1,
                actual: 2,
            }
        );
    }

    #[test]
    fn contact_spring_pushes_penetrating_end_effector_up() {
        let mut params = ArmParams::default();
        params.K = Some(4900.0);
        let manip = Manipulator::elbow_actuated(params);

        // End-effector above ground: no contact torque
        assert_eq!(manip.contact_torque(&vector![0.5, 0.2]), Vector2::zeros());

        // Penetrating configuration: the spring torque lifts the base joint
        let q = vector![-0.6, 0.2];
        let (_, ee) = manip.forward_kinematics(&q);
        assert!(ee[1] < 0.0);
        let tau = manip.contact_torque(&q);
        assert!(tau[0] > 0.0, "contact torque {} should push the arm up", tau[0]);
    }

    /// Central-difference check of the closed-form dynamics Jacobians, both
    /// away from contact and inside the active contact region.
    #[test]
    fn jacobians_match_finite_differences() {
        let mut params = ArmParams::default();
        params.K = Some(4900.0);
        let manip = Manipulator::elbow_actuated(params);

        let states = [
            Vector4::new(0.3, -0.4, 0.5, -0.2),  // no contact
            Vector4::new(-0.6, 0.2, 0.4, -0.7),  // end-effector below ground
        ];
        let u = dvector![0.7];
        let eps = 1e-6;

        for x in states.iter() {
            let (A, Bjac) = manip.dynamics_jacobians(x, &u).unwrap();

            for j in 0..4 {
                let mut xp = *x;
                let mut xm = *x;
                xp[j] += eps;
                xm[j] -= eps;
                let fp = manip.forward_dynamics(&xp, &u).unwrap();
                let fm = manip.forward_dynamics(&xm, &u).unwrap();
                for i in 0..4 {
                    let fd = (fp[i] - fm[i]) / (2.0 * eps);
                    crate::assert_close!(A[(i, j)], fd, 1e-5);
                }
            }

            let up = dvector![0.7 + eps];
            let um = dvector![0.7 - eps];
            let fp = manip.forward_dynamics(x, &up).unwrap();
            let fm = manip.forward_dynamics(x, &um).unwrap();
            for i in 0..4 {
                let fd = (fp[i] - fm[i]) / (2.0 * eps);
                crate::assert_close!(Bjac[(i, 0)], fd, 1e-5);
            }
        }
    }
}
