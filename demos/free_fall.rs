use arm_nmpc::integrators::RadauIIA2;
use arm_nmpc::manipulator::{ArmParams, Manipulator};
use arm_nmpc::na::{DMatrix, DVector, Vector4};
use arm_nmpc::plot::plot;
use arm_nmpc::simulate::rollout;
use arm_nmpc::types::Float;

/// Open-loop simulation of the arm released from horizontal rest with no
/// input, both joints nominally actuated.
pub fn main() {
    env_logger::init();

    let manip = Manipulator::new(ArmParams::default(), DMatrix::identity(2, 2)).unwrap();
    let integrator = RadauIIA2::new(manip);

    let n = 1000;
    let h = 0.01;
    let x0 = Vector4::zeros();
    let (xs, _us) = rollout(&integrator, &x0, n, h, |_x| DVector::zeros(2)).unwrap();

    let q0s: Vec<Float> = xs.iter().map(|x| x[0]).collect();
    let q1s: Vec<Float> = xs.iter().map(|x| x[1]).collect();
    plot(&q0s, n as Float * h, h, "free_fall_q0");
    plot(&q1s, n as Float * h, h, "free_fall_q1");
}
