use na::{Vector2, Vector4};

use crate::manipulator::Manipulator;
use crate::types::Float;

/// Kinetic energy of the arm: 1/2 qdot' H(q) qdot
pub fn kinetic_energy(manip: &Manipulator, x: &Vector4<Float>) -> Float {
    let q = x.fixed_rows::<2>(0).into_owned();
    let dq = x.fixed_rows::<2>(2).into_owned();
    let H = manip.mass_matrix(&q);
    0.5 * dq.dot(&(H * dq))
}

/// Gravitational potential energy, the exact antiderivative of G(q):
///     PE = g (m0 d0 + m1 l0) sin(q0) + g m1 d1 sin(q0 + q1)
pub fn potential_energy(manip: &Manipulator, q: &Vector2<Float>) -> Float {
    let p = &manip.params;
    let a4 = p.g * (p.m[0] * p.d[0] + p.m[1] * p.l[0]);
    let a5 = p.g * p.m[1] * p.d[1];
    a4 * q[0].sin() + a5 * (q[0] + q[1]).sin()
}

/// Total mechanical energy of the arm
pub fn total_energy(manip: &Manipulator, x: &Vector4<Float>) -> Float {
    let q = x.fixed_rows::<2>(0).into_owned();
    kinetic_energy(manip, x) + potential_energy(manip, &q)
}
