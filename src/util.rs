use na::DVector;

use crate::types::Float;

pub fn assert_close(a: Float, b: Float, tol: Float) {
    assert!((a - b).abs() < tol, "{} != {}", a, b);
}

pub fn assert_dvec_close(a: &DVector<Float>, b: &DVector<Float>, tol: Float) {
    for (a, b) in a.iter().zip(b.iter()) {
        assert!((a - b).abs() < tol, "{} != {}", a, b);
    }
}

#[macro_export]
macro_rules! assert_close {
    ($left:expr, $right:expr, $tolerance:expr) => {
        let left = $left;
        let right = $right;
        let tol = $tolerance;
        let diff = (left - right).abs();
        if diff > tol {
            panic!(
                "assertion failed: {} ~= {} \
                (tolerance: {}, difference: {})",
                left, right, tol, diff
            );
        }
    };
}

#[macro_export]
macro_rules! assert_vec_close {
    ($left:expr, $right:expr, $tolerance:expr) => {
        let left = $left;
        let right = $right;
        let tol = $tolerance;
        for (a, b) in left.iter().zip(right.iter()) {
            crate::assert_close!(a, b, tol);
        }
    };
}
