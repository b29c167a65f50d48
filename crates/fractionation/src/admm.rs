//! Dense ADMM reference oracle
//!
//! Lowers a [`Problem`] to the quadratic program
//!
//! ```text
//! min ½ xᵀPx + qᵀx   s.t.   l <= Ax <= u
//! ```
//!
//! and runs the operator-splitting iteration with over-relaxation,
//! adaptive step size and infeasibility detection. Positive-part terms
//! become auxiliary epigraph variables; square terms feed `P`; variable
//! lower bounds become identity rows.
//!
//! Everything is dense, so this backend is meant for small problems and
//! tests; production planning plugs in its own [`OptimizationOracle`].

use crate::oracle::{OptimizationOracle, Solution, SolveOptions, SolveStatus};
use crate::problem::{ObjectiveTerm, Problem};
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

const RHO_MIN: f64 = 1e-6;
const RHO_MAX: f64 = 1e6;
/// Step-size multiplier on equality rows
const RHO_EQUALITY_SCALE: f64 = 1e3;
/// Relative change of ρ that triggers a refactorization
const RHO_REFACTOR_RATIO: f64 = 5.0;
const INFEASIBILITY_CHECK_INTERVAL: usize = 25;
/// Tolerance widening accepted for `OptimalInaccurate`
const INACCURATE_FACTOR: f64 = 1e3;
const DIVISION_TOL: f64 = 1e-20;
const CONSTANT_ROW_TOL: f64 = 1e-9;

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmmSettings {
    /// Initial step size
    pub rho: f64,
    /// Proximal regularization of the x-update
    pub sigma: f64,
    /// Over-relaxation parameter in (0, 2)
    pub alpha: f64,
    pub eps_abs: f64,
    pub eps_rel: f64,
    /// Tolerance of the infeasibility certificates
    pub eps_infeasible: f64,
    pub max_iter: usize,
    /// Iterations between step-size updates, 0 disables adaptation
    pub adaptive_rho_interval: usize,
}

impl Default for AdmmSettings {
    fn default() -> Self {
        Self {
            rho: 0.1,
            sigma: 1e-6,
            alpha: 1.6,
            eps_abs: 1e-7,
            eps_rel: 1e-7,
            eps_infeasible: 1e-5,
            max_iter: 100_000,
            adaptive_rho_interval: 25,
        }
    }
}

impl AdmmSettings {
    pub fn rho(mut self, rho: f64) -> Self {
        self.rho = rho.clamp(RHO_MIN, RHO_MAX);
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn tolerance(mut self, eps_abs: f64, eps_rel: f64) -> Self {
        self.eps_abs = eps_abs;
        self.eps_rel = eps_rel;
        self
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn adaptive_rho_interval(mut self, interval: usize) -> Self {
        self.adaptive_rho_interval = interval;
        self
    }
}

// ============================================================================
// Lowering
// ============================================================================

/// Dense QP data; columns past `n_original` are epigraph variables
struct QpData {
    n_original: usize,
    p: DMatrix<f64>,
    q: DVector<f64>,
    a: DMatrix<f64>,
    l: DVector<f64>,
    u: DVector<f64>,
}

struct Row {
    coefs: Vec<(usize, f64)>,
    lower: f64,
    upper: f64,
}

impl QpData {
    /// Build the QP, or the status of a problem that fails without iterating
    fn lower(problem: &Problem) -> Result<Self, SolveStatus> {
        let n_original = problem.num_variables();
        let hinges = problem
            .objective()
            .iter()
            .filter(|t| matches!(t, ObjectiveTerm::PosPart { weight, .. } if *weight != 0.0))
            .count();
        let dim = n_original + hinges;

        let mut p = DMatrix::<f64>::zeros(dim, dim);
        let mut q = DVector::<f64>::zeros(dim);
        let mut rows = Vec::new();
        let mut next_aux = n_original;

        for term in problem.objective() {
            match term {
                ObjectiveTerm::Linear(expr) => {
                    for &(i, coef) in expr.terms() {
                        q[i] += coef;
                    }
                }
                ObjectiveTerm::PosPart { weight, expr } => {
                    if *weight == 0.0 {
                        continue;
                    }
                    // w · s with s >= expr, s >= 0
                    let s = next_aux;
                    next_aux += 1;
                    q[s] += *weight;
                    let mut coefs = expr.terms().to_vec();
                    coefs.push((s, -1.0));
                    rows.push(Row {
                        coefs,
                        lower: f64::NEG_INFINITY,
                        upper: -expr.constant_term(),
                    });
                    rows.push(Row {
                        coefs: vec![(s, 1.0)],
                        lower: 0.0,
                        upper: f64::INFINITY,
                    });
                }
                ObjectiveTerm::Square { weight, expr } => {
                    let c = expr.constant_term();
                    for &(i, ai) in expr.terms() {
                        q[i] += 2.0 * weight * c * ai;
                        for &(j, aj) in expr.terms() {
                            p[(i, j)] += 2.0 * weight * ai * aj;
                        }
                    }
                }
            }
        }

        for constraint in problem.constraints() {
            let c = constraint.expr.constant_term();
            let lower = constraint.lower - c;
            let upper = constraint.upper - c;
            if lower.is_nan() || upper.is_nan() {
                return Err(SolveStatus::SolverError);
            }
            if lower > upper {
                return Err(SolveStatus::Infeasible);
            }
            if constraint.expr.is_constant() {
                if lower > CONSTANT_ROW_TOL || upper < -CONSTANT_ROW_TOL {
                    return Err(SolveStatus::Infeasible);
                }
                continue;
            }
            if lower == f64::NEG_INFINITY && upper == f64::INFINITY {
                continue;
            }
            rows.push(Row {
                coefs: constraint.expr.terms().to_vec(),
                lower,
                upper,
            });
        }

        for (i, &lb) in problem.variable_lower_bounds().iter().enumerate() {
            if lb == f64::INFINITY || lb.is_nan() {
                return Err(SolveStatus::Infeasible);
            }
            if lb.is_finite() {
                rows.push(Row {
                    coefs: vec![(i, 1.0)],
                    lower: lb,
                    upper: f64::INFINITY,
                });
            }
        }

        let m = rows.len();
        let mut a = DMatrix::<f64>::zeros(m, dim);
        for (r, row) in rows.iter().enumerate() {
            for &(i, coef) in &row.coefs {
                a[(r, i)] += coef;
            }
        }
        let l = DVector::from_iterator(m, rows.iter().map(|r| r.lower));
        let u = DVector::from_iterator(m, rows.iter().map(|r| r.upper));

        Ok(Self {
            n_original,
            p,
            q,
            a,
            l,
            u,
        })
    }

    fn dim(&self) -> usize {
        self.q.len()
    }

    fn rows(&self) -> usize {
        self.l.len()
    }

    fn rho_vector(&self, rho: f64) -> DVector<f64> {
        DVector::from_fn(self.rows(), |i, _| {
            if self.l[i] == self.u[i] {
                (rho * RHO_EQUALITY_SCALE).min(RHO_MAX)
            } else {
                rho
            }
        })
    }

    /// Factor `P + σI + Aᵀ diag(ρ) A`
    fn factor(&self, rho: &DVector<f64>, sigma: f64) -> Option<Cholesky<f64, Dyn>> {
        let scaled = DMatrix::from_fn(self.rows(), self.dim(), |r, c| self.a[(r, c)] * rho[r]);
        let k = &self.p + DMatrix::identity(self.dim(), self.dim()) * sigma + self.a.tr_mul(&scaled);
        k.cholesky()
    }

    fn residuals(&self, x: &DVector<f64>, z: &DVector<f64>, y: &DVector<f64>) -> Residuals {
        let ax = &self.a * x;
        let px = &self.p * x;
        let aty = self.a.tr_mul(y);
        Residuals {
            primal: inf_norm(&(&ax - z)),
            dual: inf_norm(&(&px + &self.q + &aty)),
            primal_scale: inf_norm(&ax).max(inf_norm(z)),
            dual_scale: inf_norm(&px).max(inf_norm(&aty)).max(inf_norm(&self.q)),
        }
    }

    /// `δy` with `Aᵀδy ≈ 0` and negative support over `[l, u]`
    fn is_primal_infeasible(&self, delta_y: &DVector<f64>, eps: f64) -> bool {
        let projected = DVector::from_fn(self.rows(), |i, _| {
            let mut v = delta_y[i];
            if self.u[i] == f64::INFINITY {
                v = v.min(0.0);
            }
            if self.l[i] == f64::NEG_INFINITY {
                v = v.max(0.0);
            }
            v
        });
        let norm = inf_norm(&projected);
        if norm <= DIVISION_TOL {
            return false;
        }
        let v = projected / norm;
        if inf_norm(&self.a.tr_mul(&v)) > eps {
            return false;
        }
        let support: f64 = v
            .iter()
            .enumerate()
            .map(|(i, &vi)| {
                if vi > 0.0 {
                    self.u[i] * vi
                } else if vi < 0.0 {
                    self.l[i] * vi
                } else {
                    0.0
                }
            })
            .sum();
        support < -eps
    }

    /// `δx` along which the objective decreases without leaving the feasible set
    fn is_dual_infeasible(&self, delta_x: &DVector<f64>, eps: f64) -> bool {
        let norm = inf_norm(delta_x);
        if norm <= DIVISION_TOL {
            return false;
        }
        let d = delta_x / norm;
        if inf_norm(&(&self.p * &d)) > eps || self.q.dot(&d) > -eps {
            return false;
        }
        let ad = &self.a * &d;
        ad.iter().enumerate().all(|(i, &v)| {
            (self.u[i] == f64::INFINITY || v <= eps) && (self.l[i] == f64::NEG_INFINITY || v >= -eps)
        })
    }
}

struct Residuals {
    primal: f64,
    dual: f64,
    primal_scale: f64,
    dual_scale: f64,
}

impl Residuals {
    fn converged(&self, eps_abs: f64, eps_rel: f64) -> bool {
        self.primal <= eps_abs + eps_rel * self.primal_scale
            && self.dual <= eps_abs + eps_rel * self.dual_scale
    }

    /// Multiplier balancing the normalized primal and dual residuals
    fn rho_ratio(&self) -> f64 {
        let primal = self.primal / (self.primal_scale + DIVISION_TOL);
        let dual = self.dual / (self.dual_scale + DIVISION_TOL);
        (primal / (dual + DIVISION_TOL)).sqrt()
    }
}

fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

// ============================================================================
// Oracle
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct AdmmOracle {
    settings: AdmmSettings,
}

impl AdmmOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: AdmmSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AdmmSettings {
        &self.settings
    }

    fn iterate(
        &self,
        qp: &QpData,
        options: &SolveOptions,
        started: Instant,
    ) -> (SolveStatus, DVector<f64>, usize) {
        let s = &self.settings;
        let dim = qp.dim();
        let m = qp.rows();

        let mut rho_scale = s.rho;
        let mut rho = qp.rho_vector(rho_scale);
        let mut factor = match qp.factor(&rho, s.sigma) {
            Some(f) => f,
            None => return (SolveStatus::SolverError, DVector::zeros(dim), 0),
        };

        let mut x = DVector::<f64>::zeros(dim);
        let mut z = DVector::<f64>::zeros(m);
        let mut y = DVector::<f64>::zeros(m);
        let mut residuals = qp.residuals(&x, &z, &y);

        for iter in 1..=s.max_iter {
            if options.should_stop(started) {
                debug!(iterations = iter - 1, "ADMM interrupted");
                return (SolveStatus::Interrupted, x, iter - 1);
            }

            let rhs = &x * s.sigma - &qp.q + qp.a.tr_mul(&(rho.component_mul(&z) - &y));
            let x_tilde = factor.solve(&rhs);
            let z_tilde = &qp.a * &x_tilde;

            let x_next = &x_tilde * s.alpha + &x * (1.0 - s.alpha);
            let z_relaxed = &z_tilde * s.alpha + &z * (1.0 - s.alpha);
            let z_next = DVector::from_fn(m, |i, _| {
                (z_relaxed[i] + y[i] / rho[i]).max(qp.l[i]).min(qp.u[i])
            });
            let y_next = &y + rho.component_mul(&(&z_relaxed - &z_next));

            let delta_x = &x_next - &x;
            let delta_y = &y_next - &y;
            x = x_next;
            z = z_next;
            y = y_next;

            residuals = qp.residuals(&x, &z, &y);
            if residuals.converged(s.eps_abs, s.eps_rel) {
                debug!(
                    iterations = iter,
                    primal = residuals.primal,
                    dual = residuals.dual,
                    "ADMM converged"
                );
                return (SolveStatus::Optimal, x, iter);
            }

            if iter % INFEASIBILITY_CHECK_INTERVAL == 0 {
                if qp.is_primal_infeasible(&delta_y, s.eps_infeasible) {
                    debug!(iterations = iter, "ADMM primal infeasibility certificate");
                    return (SolveStatus::Infeasible, x, iter);
                }
                if qp.is_dual_infeasible(&delta_x, s.eps_infeasible) {
                    debug!(iterations = iter, "ADMM dual infeasibility certificate");
                    return (SolveStatus::Unbounded, x, iter);
                }
            }

            if s.adaptive_rho_interval > 0 && iter % s.adaptive_rho_interval == 0 {
                let proposed = (rho_scale * residuals.rho_ratio()).clamp(RHO_MIN, RHO_MAX);
                if proposed > rho_scale * RHO_REFACTOR_RATIO || proposed < rho_scale / RHO_REFACTOR_RATIO {
                    rho_scale = proposed;
                    rho = qp.rho_vector(rho_scale);
                    factor = match qp.factor(&rho, s.sigma) {
                        Some(f) => f,
                        None => return (SolveStatus::SolverError, x, iter),
                    };
                    debug!(iterations = iter, rho = rho_scale, "ADMM step size updated");
                }
            }
        }

        if residuals.converged(s.eps_abs * INACCURATE_FACTOR, s.eps_rel * INACCURATE_FACTOR) {
            warn!(
                primal = residuals.primal,
                dual = residuals.dual,
                "ADMM hit the iteration limit with loosely converged residuals"
            );
            (SolveStatus::OptimalInaccurate, x, s.max_iter)
        } else {
            warn!(
                primal = residuals.primal,
                dual = residuals.dual,
                "ADMM did not converge"
            );
            (SolveStatus::SolverError, x, s.max_iter)
        }
    }
}

impl OptimizationOracle for AdmmOracle {
    fn solve(&self, problem: &Problem, options: &SolveOptions) -> Solution {
        let started = Instant::now();
        let qp = match QpData::lower(problem) {
            Ok(qp) => qp,
            Err(status) => {
                debug!(%status, "problem rejected before iterating");
                return Solution::failed(status, started.elapsed(), 0);
            }
        };
        debug!(
            variables = qp.n_original,
            lifted = qp.dim(),
            rows = qp.rows(),
            "ADMM solve"
        );

        let (status, x, iterations) = if qp.dim() == 0 {
            (SolveStatus::Optimal, DVector::zeros(0), 0)
        } else {
            self.iterate(&qp, options, started)
        };

        if !status.is_optimal() {
            return Solution::failed(status, started.elapsed(), iterations);
        }

        let values: Vec<f64> = x
            .iter()
            .take(qp.n_original)
            .zip(problem.variable_lower_bounds())
            .map(|(v, lb)| v.max(*lb))
            .collect();
        let objective = problem.objective_value(&values);
        Solution {
            status,
            values,
            objective,
            solve_time: started.elapsed(),
            iterations,
        }
    }
}
