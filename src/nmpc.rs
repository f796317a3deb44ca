use log::{debug, warn};
use na::{DVector, Vector2, Vector4};

use crate::error::NmpcError;
use crate::integrators::RadauIIA2;
use crate::manipulator::Manipulator;
use crate::ocp::{HorizonLayout, OcpBuilder, TargetPenalty};
use crate::qp::{self, QpSolution, QpSubproblem};
use crate::types::Float;
use crate::PI;

/// Configuration of one receding-horizon run. `Default` carries the
/// reference swing-up configuration.
#[derive(Clone, Debug)]
pub struct NmpcConfig {
    /// Number of control steps N; also the number of horizon stages.
    pub n_steps: usize,
    /// Horizon length T [s]; the discretization interval is h = T / N.
    pub horizon_time: Float,
    /// Symmetric control bound
    pub u_max: Float,
    /// Weight on the position-target deviation term
    pub position_weight: Float,
    /// Upright target position [rad]
    pub q_target: Vector2<Float>,
    pub penalty: TargetPenalty,
    /// Initial plant state
    pub x0: Vector4<Float>,
}

impl Default for NmpcConfig {
    fn default() -> Self {
        NmpcConfig {
            n_steps: 200,
            horizon_time: 2.0,
            u_max: 20.0,
            position_weight: 1000.0,
            q_target: Vector2::new(PI / 2.0, 0.0),
            penalty: TargetPenalty::TerminalStage,
            x0: Vector4::zeros(),
        }
    }
}

impl NmpcConfig {
    pub fn step_size(&self) -> Float {
        self.horizon_time / self.n_steps as Float
    }
}

/// How a receding-horizon run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// All N control steps were executed.
    Completed,
    /// A per-step numerical failure stopped the run early; the last valid
    /// plant state and the controls applied so far are still reported.
    Stopped { step: usize, reason: NmpcError },
}

/// Result of a receding-horizon run.
pub struct NmpcRun {
    /// Controls applied to the plant, one per executed step
    pub applied_controls: Vec<DVector<Float>>,
    /// Plant trajectory, starting at x0
    pub plant_trajectory: Vec<Vector4<Float>>,
    pub outcome: RunOutcome,
}

/// Receding-horizon controller running the real-time iteration: one QP per
/// control step, warm-started from the shifted previous solution. Owns the
/// warm-start iterate and the plant state exclusively; both are mutated
/// only at the end of MEASURE and SHIFT_WARMSTART.
///
/// The nominal model drives the OCP and its linearization; the perturbed
/// model only ever advances the simulated plant. Ref: Diehl et al.,
/// "A Real-Time Iteration Scheme for Nonlinear Optimization in Optimal
/// Feedback Control", 2005
#[derive(Debug)]
pub struct NmpcController {
    ocp: OcpBuilder,
    plant_integrator: RadauIIA2,
    config: NmpcConfig,
    /// Constant cost Hessian, shared by every QP subproblem
    hessian: na::DMatrix<Float>,
    /// Warm-start iterate over the whole horizon
    w: DVector<Float>,
    x_plant: Vector4<Float>,
    applied_controls: Vec<DVector<Float>>,
    plant_trajectory: Vec<Vector4<Float>>,
}

impl NmpcController {
    /// Build a controller from the nominal model (used inside the
    /// optimization) and the plant model (used only for simulation). The
    /// warm start is seeded by linear interpolation from x0 to the target.
    pub fn new(
        nominal: Manipulator,
        plant: Manipulator,
        config: NmpcConfig,
    ) -> Result<Self, NmpcError> {
        if plant.control_dim() != nominal.control_dim() {
            return Err(NmpcError::DimensionMismatch {
                what: "plant control dimension",
                expected: nominal.control_dim(),
                actual: plant.control_dim(),
            });
        }

        let layout = HorizonLayout::new(config.n_steps, nominal.control_dim());
        let ocp = OcpBuilder {
            integrator: RadauIIA2::new(nominal),
            layout,
            h: config.step_size(),
            q_target: config.q_target,
            position_weight: config.position_weight,
            penalty: config.penalty,
            u_max: config.u_max,
        };
        let hessian = ocp.cost_hessian();

        let target = ocp.target_state();
        let mut w = DVector::zeros(layout.n_vars());
        for k in 0..=layout.n {
            let alpha = k as Float / layout.n as Float;
            let x = config.x0 + (target - config.x0) * alpha;
            let o = layout.x_offset(k);
            for r in 0..layout.nx {
                w[o + r] = x[r];
            }
        }

        let x_plant = config.x0;
        Ok(NmpcController {
            ocp,
            plant_integrator: RadauIIA2::new(plant),
            config,
            hessian,
            w,
            x_plant,
            applied_controls: vec![],
            plant_trajectory: vec![x_plant],
        })
    }

    pub fn plant_state(&self) -> &Vector4<Float> {
        &self.x_plant
    }

    pub fn warm_start(&self) -> &DVector<Float> {
        &self.w
    }

    /// BUILD_QP + SOLVE_QP: linearize the continuity constraints at the
    /// warm-start iterate, form the subproblem around it and take one QP
    /// step. The cost Hessian is constant; only the constraint data and the
    /// iterate-relative bounds are refreshed.
    fn solve_subproblem(&self) -> Result<QpSolution, NmpcError> {
        let (g, jac) = self.ocp.linearize(&self.w)?;
        let (lb, ub) = self.ocp.bounds(&self.x_plant);
        let qp = QpSubproblem {
            P: self.hessian.clone(),
            q: self.ocp.cost_gradient(&self.w),
            A_eq: jac,
            b_eq: -g,
            lb: lb - &self.w,
            ub: ub - &self.w,
        };
        qp::solve(&qp)
    }

    /// Repeated full SQP iterations at the initial state, used to converge
    /// the warm start before the closed loop begins. Stands in for the
    /// reference script's previously computed nominal solution.
    pub fn prepare(&mut self, iters: usize) -> Result<(), NmpcError> {
        for i in 0..iters {
            let sol = self.solve_subproblem()?;
            let step_norm = sol.dw.norm();
            self.w += sol.dw;
            debug!("warm-start iteration {i}: step norm {step_norm:.3e}");
        }
        Ok(())
    }

    /// One control cycle:
    /// MEASURE -> BUILD_QP -> SOLVE_QP -> APPLY_CONTROL -> SIMULATE_PLANT ->
    /// SHIFT_WARMSTART. Exactly one QP is solved.
    pub fn step(&mut self) -> Result<DVector<Float>, NmpcError> {
        // MEASURE happens inside bounds(): the first stage is pinned to the
        // current plant state.
        let sol = self.solve_subproblem()?;
        let iterate = &self.w + sol.dw;

        // APPLY_CONTROL: first-stage control of the updated iterate
        let u0 = self.ocp.layout.control_of(&iterate, 0);

        // SIMULATE_PLANT with the perturbed model
        let x_next = self
            .plant_integrator
            .step(&self.x_plant, &u0, self.ocp.h)?;

        self.x_plant = x_next;
        self.plant_trajectory.push(x_next);
        self.applied_controls.push(u0.clone());

        // SHIFT_WARMSTART
        self.w = shift_warm_start(&self.ocp.layout, &iterate);

        Ok(u0)
    }

    /// Run N control steps. Model/programming errors abort the whole run;
    /// per-step numerical failures stop it gracefully with the last valid
    /// plant state and control sequence.
    pub fn run(mut self) -> Result<NmpcRun, NmpcError> {
        for i in 0..self.config.n_steps {
            match self.step() {
                Ok(u) => {
                    debug!(
                        "step {i}: u = {:.4}, plant q = [{:.4}, {:.4}]",
                        u[0], self.x_plant[0], self.x_plant[1]
                    );
                }
                Err(
                    e @ (NmpcError::ModelSingularity | NmpcError::DimensionMismatch { .. }),
                ) => return Err(e),
                Err(e) => {
                    warn!("stopping receding-horizon run at step {i}: {e}");
                    return Ok(NmpcRun {
                        applied_controls: self.applied_controls,
                        plant_trajectory: self.plant_trajectory,
                        outcome: RunOutcome::Stopped { step: i, reason: e },
                    });
                }
            }
        }
        Ok(NmpcRun {
            applied_controls: self.applied_controls,
            plant_trajectory: self.plant_trajectory,
            outcome: RunOutcome::Completed,
        })
    }
}

/// Standard real-time-iteration shift: drop the oldest stage, move every
/// later stage one slot earlier and duplicate the final stage into the
/// freed slot.
pub fn shift_warm_start(layout: &HorizonLayout, w: &DVector<Float>) -> DVector<Float> {
    let mut out = w.clone();
    for k in 0..layout.n {
        let src = layout.x_offset(k + 1);
        let dst = layout.x_offset(k);
        for r in 0..layout.nx {
            out[dst + r] = w[src + r];
        }
    }
    // X_N keeps its value: the duplicated final stage
    for k in 0..layout.n.saturating_sub(1) {
        let src = layout.u_offset(k + 1);
        let dst = layout.u_offset(k);
        for r in 0..layout.nu {
            out[dst + r] = w[src + r];
        }
    }
    out
}
