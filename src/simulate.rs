use na::{DVector, Vector4};

use crate::error::NmpcError;
use crate::integrators::RadauIIA2;
use crate::types::Float;

/// Open-loop rollout: advance one integrator n_steps times under the given
/// control law. Returns the state history (n_steps + 1 entries, the first
/// being x0) and the control history.
pub fn rollout(
    integrator: &RadauIIA2,
    x0: &Vector4<Float>,
    n_steps: usize,
    h: Float,
    control_fn: impl Fn(&Vector4<Float>) -> DVector<Float>,
) -> Result<(Vec<Vector4<Float>>, Vec<DVector<Float>>), NmpcError> {
    let mut xs = Vec::with_capacity(n_steps + 1);
    let mut us = Vec::with_capacity(n_steps);
    let mut x = *x0;
    xs.push(x);
    for _ in 0..n_steps {
        let u = control_fn(&x);
        x = integrator.step(&x, &u, h)?;
        xs.push(x);
        us.push(u);
    }
    Ok((xs, us))
}
