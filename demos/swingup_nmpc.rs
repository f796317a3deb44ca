use std::time::Instant;

use log::info;

use arm_nmpc::manipulator::{ArmParams, Manipulator};
use arm_nmpc::nmpc::{NmpcConfig, NmpcController, RunOutcome};
use arm_nmpc::plot::plot;
use arm_nmpc::types::Float;

/// Closed-loop NMPC swing-up of the arm with only the elbow actuated. The
/// plant is simulated with a softer contact spring than the nominal model
/// to emulate plant/model mismatch.
pub fn main() {
    env_logger::init();

    let nominal = Manipulator::elbow_actuated(ArmParams {
        K: Some(10000.0),
        ..Default::default()
    });
    let plant = Manipulator::elbow_actuated(ArmParams {
        K: Some(4900.0),
        ..Default::default()
    });

    let config = NmpcConfig::default();
    let h = config.step_size();

    let mut controller = NmpcController::new(nominal, plant, config).unwrap();

    let tic = Instant::now();
    controller.prepare(30).unwrap();
    info!("warm-start preparation took {:?}", tic.elapsed());

    let tic = Instant::now();
    let run = controller.run().unwrap();
    info!("{} control steps took {:?}", run.applied_controls.len(), tic.elapsed());

    match &run.outcome {
        RunOutcome::Completed => {
            let x = run.plant_trajectory.last().unwrap();
            info!("final plant state: q = [{:.4}, {:.4}], dq = [{:.4}, {:.4}]", x[0], x[1], x[2], x[3]);
        }
        RunOutcome::Stopped { step, reason } => {
            info!("run stopped at step {}: {}", step, reason);
        }
    }

    let final_time = run.applied_controls.len() as Float * h;
    let q0s: Vec<Float> = run.plant_trajectory.iter().map(|x| x[0]).collect();
    let q1s: Vec<Float> = run.plant_trajectory.iter().map(|x| x[1]).collect();
    let us: Vec<Float> = run.applied_controls.iter().map(|u| u[0]).collect();
    plot(&q0s, final_time, h, "swingup_q0");
    plot(&q1s, final_time, h, "swingup_q1");
    plot(&us, final_time, h, "swingup_u");
}
