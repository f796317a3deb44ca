use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{NonnegativeConeT, ZeroConeT},
};
use na::{DMatrix, DVector};

use crate::error::NmpcError;
use crate::types::Float;

/// One QP subproblem of the real-time iteration, in iterate-relative form:
///
///     min  1/2 dw' P dw + q' dw
///     s.t. A_eq dw = b_eq
///          lb <= dw <= ub
///
/// Rebuilt fresh every control step from the current warm-start iterate and
/// consumed exactly once.
pub struct QpSubproblem {
    pub P: DMatrix<Float>,
    pub q: DVector<Float>,
    pub A_eq: DMatrix<Float>,
    pub b_eq: DVector<Float>,
    pub lb: DVector<Float>,
    pub ub: DVector<Float>,
}

/// Primal step and multipliers returned by the solver.
#[derive(Debug)]
pub struct QpSolution {
    pub dw: DVector<Float>,
    pub eq_multipliers: DVector<Float>,
    pub bound_multipliers: DVector<Float>,
}

/// Solve one QP subproblem with Clarabel. Equalities and pinned variables
/// (lb == ub) go into a zero cone; the remaining box bounds are stacked as
/// [I; -I] rows in a nonnegative cone, keeping only rows with finite
/// bounds.
pub fn solve(qp: &QpSubproblem) -> Result<QpSolution, NmpcError> {
    let nz = qp.P.nrows();
    let n_eq = qp.A_eq.nrows();

    let pinned: Vec<usize> = (0..nz)
        .filter(|&j| qp.lb[j].is_finite() && qp.lb[j] == qp.ub[j])
        .collect();
    let ub_rows: Vec<usize> = (0..nz)
        .filter(|&j| qp.ub[j].is_finite() && qp.lb[j] != qp.ub[j])
        .collect();
    let lb_rows: Vec<usize> = (0..nz)
        .filter(|&j| qp.lb[j].is_finite() && qp.lb[j] != qp.ub[j])
        .collect();
    let n_zero = n_eq + pinned.len();
    let n_ineq = ub_rows.len() + lb_rows.len();

    let mut a_all = DMatrix::zeros(n_zero + n_ineq, nz);
    let mut b_all = DVector::zeros(n_zero + n_ineq);
    for i in 0..n_eq {
        for j in 0..nz {
            a_all[(i, j)] = qp.A_eq[(i, j)];
        }
        b_all[i] = qp.b_eq[i];
    }
    for (r, &j) in pinned.iter().enumerate() {
        a_all[(n_eq + r, j)] = 1.0;
        b_all[n_eq + r] = qp.ub[j];
    }
    for (r, &j) in ub_rows.iter().enumerate() {
        a_all[(n_zero + r, j)] = 1.0;
        b_all[n_zero + r] = qp.ub[j];
    }
    for (r, &j) in lb_rows.iter().enumerate() {
        a_all[(n_zero + ub_rows.len() + r, j)] = -1.0;
        b_all[n_zero + ub_rows.len() + r] = -qp.lb[j];
    }

    let p_csc = dmatrix_to_csc_upper_tri(&qp.P);
    let a_csc = dmatrix_to_csc(&a_all);
    let cones = vec![ZeroConeT(n_zero), NonnegativeConeT(n_ineq)];

    let settings = DefaultSettingsBuilder::default()
        .verbose(false)
        .build()
        .expect("valid solver settings");

    let q_slice: Vec<Float> = qp.q.iter().copied().collect();
    let b_slice: Vec<Float> = b_all.iter().copied().collect();

    let mut solver = DefaultSolver::new(&p_csc, &q_slice, &a_csc, &b_slice, &cones, settings)
        .map_err(|e| NmpcError::QpInfeasible {
            status: format!("{e:?}"),
        })?;
    solver.solve();

    let sol = &solver.solution;
    match sol.status {
        SolverStatus::Solved | SolverStatus::AlmostSolved => Ok(QpSolution {
            dw: DVector::from_column_slice(&sol.x),
            eq_multipliers: DVector::from_column_slice(&sol.z[..n_eq]),
            bound_multipliers: DVector::from_column_slice(&sol.z[n_eq..]),
        }),
        status => Err(NmpcError::QpInfeasible {
            status: format!("{status:?}"),
        }),
    }
}

/// Convert a nalgebra matrix to Clarabel CSC form.
fn dmatrix_to_csc(m: &DMatrix<Float>) -> CscMatrix<Float> {
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

/// Convert a symmetric cost matrix to the upper-triangular CSC form Clarabel
/// expects for P.
fn dmatrix_to_csc_upper_tri(m: &DMatrix<Float>) -> CscMatrix<Float> {
    let (nrows, ncols) = m.shape();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..=j.min(nrows - 1) {
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
mod qp_tests {
    use na::{dmatrix, dvector};

    use super::*;

    #[test]
    fn solves_small_equality_constrained_qp() {
        // min 1/2 |dw|^2  s.t.  dw_0 + dw_1 = 2  ->  dw = [1, 1]
        let qp = QpSubproblem {
            P: DMatrix::identity(2, 2),
            q: dvector![0.0, 0.0],
            A_eq: dmatrix![1.0, 1.0],
            b_eq: dvector![2.0],
            lb: dvector![-10.0, -10.0],
            ub: dvector![10.0, 10.0],
        };

        let sol = solve(&qp).unwrap();
        crate::assert_close!(sol.dw[0], 1.0, 1e-6);
        crate::assert_close!(sol.dw[1], 1.0, 1e-6);
        assert_eq!(sol.eq_multipliers.len(), 1);
        assert_eq!(sol.bound_multipliers.len(), 4);
    }

    #[test]
    fn active_bound_clips_the_solution() {
        // min 1/2 (dw - 3)^2 with dw <= 1
        let qp = QpSubproblem {
            P: DMatrix::identity(1, 1),
            q: dvector![-3.0],
            A_eq: DMatrix::zeros(0, 1),
            b_eq: dvector![],
            lb: dvector![Float::NEG_INFINITY],
            ub: dvector![1.0],
        };

        let sol = solve(&qp).unwrap();
        crate::assert_close!(sol.dw[0], 1.0, 1e-6);
    }

    #[test]
    fn contradictory_constraints_report_infeasibility() {
        // dw_0 = 0 from the equality, but the box demands dw_0 >= 5
        let qp = QpSubproblem {
            P: DMatrix::identity(2, 2),
            q: dvector![0.0, 0.0],
            A_eq: dmatrix![1.0, 0.0],
            b_eq: dvector![0.0],
            lb: dvector![5.0, 5.0],
            ub: dvector![10.0, 10.0],
        };

        let err = solve(&qp).unwrap_err();
        assert!(matches!(err, NmpcError::QpInfeasible { .. }));
    }
}
