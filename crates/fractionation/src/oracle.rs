//! Optimization oracle boundary
//!
//! Planners describe a convex program as a [`Problem`] and hand it to an
//! [`OptimizationOracle`]. Solves block; a time limit and a
//! [`CancelToken`] let callers bound or abort them.

use crate::problem::Problem;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Optimal,
    /// Stopped at the iteration limit with only loosely converged residuals
    OptimalInaccurate,
    Infeasible,
    Unbounded,
    /// Time limit reached or cancelled
    Interrupted,
    SolverError,
}

impl SolveStatus {
    /// Whether the returned values are usable as a plan
    pub fn is_optimal(&self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::OptimalInaccurate)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SolveStatus::Optimal => "optimal",
            SolveStatus::OptimalInaccurate => "optimal_inaccurate",
            SolveStatus::Infeasible => "infeasible",
            SolveStatus::Unbounded => "unbounded",
            SolveStatus::Interrupted => "interrupted",
            SolveStatus::SolverError => "solver_error",
        };
        f.write_str(label)
    }
}

/// Shared flag for aborting an in-flight solve from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SolveOptions {
    pub time_limit: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl SolveOptions {
    /// True once the time limit has passed or the token was cancelled
    pub fn should_stop(&self, started: Instant) -> bool {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return true;
        }
        self.time_limit
            .is_some_and(|limit| started.elapsed() >= limit)
    }
}

/// Result of one oracle call
#[derive(Debug, Clone)]
pub struct Solution {
    pub status: SolveStatus,
    /// One value per problem variable, empty unless the status is optimal
    pub values: Vec<f64>,
    pub objective: f64,
    pub solve_time: Duration,
    pub iterations: usize,
}

impl Solution {
    /// A solution that carries no values
    pub fn failed(status: SolveStatus, solve_time: Duration, iterations: usize) -> Self {
        Self {
            status,
            values: Vec::new(),
            objective: f64::NAN,
            solve_time,
            iterations,
        }
    }
}

/// Solver for the convex programs built by the planners.
///
/// Implementations must honour variable lower bounds, interval
/// constraints, and the linear, positive-part and square objective terms
/// of [`Problem`], minimizing their sum.
pub trait OptimizationOracle {
    fn solve(&self, problem: &Problem, options: &SolveOptions) -> Solution;
}

impl<O: OptimizationOracle + ?Sized> OptimizationOracle for &O {
    fn solve(&self, problem: &Problem, options: &SolveOptions) -> Solution {
        (**self).solve(problem, options)
    }
}

impl<O: OptimizationOracle + ?Sized> OptimizationOracle for Box<O> {
    fn solve(&self, problem: &Problem, options: &SolveOptions) -> Solution {
        (**self).solve(problem, options)
    }
}
