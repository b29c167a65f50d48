//! Convex program description handed to the oracle
//!
//! Variables live in one flat vector; planners allocate them in matrix
//! shaped [`VarBlock`]s and combine them into [`AffineExpr`]s. The
//! objective is a sum of linear, weighted positive-part and weighted
//! square terms; constraints are intervals `lower <= expr <= upper`.

use nalgebra::DMatrix;
use std::ops::{Add, Mul, Neg, Sub};

// ============================================================================
// Affine expressions
// ============================================================================

/// `Σ coef · x[index] + constant`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AffineExpr {
    terms: Vec<(usize, f64)>,
    constant: f64,
}

impl AffineExpr {
    pub fn constant(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: value,
        }
    }

    pub fn variable(index: usize) -> Self {
        Self {
            terms: vec![(index, 1.0)],
            constant: 0.0,
        }
    }

    pub fn terms(&self) -> &[(usize, f64)] {
        &self.terms
    }

    pub fn constant_term(&self) -> f64 {
        self.constant
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    /// Append `coef · x[index]`; zero coefficients are dropped
    pub fn add_term(&mut self, index: usize, coef: f64) {
        if coef != 0.0 {
            self.terms.push((index, coef));
        }
    }

    pub fn evaluate(&self, values: &[f64]) -> f64 {
        self.terms
            .iter()
            .map(|(i, coef)| coef * values[*i])
            .sum::<f64>()
            + self.constant
    }
}

impl Add for AffineExpr {
    type Output = AffineExpr;

    fn add(mut self, rhs: AffineExpr) -> AffineExpr {
        self.terms.extend(rhs.terms);
        self.constant += rhs.constant;
        self
    }
}

impl Add<f64> for AffineExpr {
    type Output = AffineExpr;

    fn add(mut self, rhs: f64) -> AffineExpr {
        self.constant += rhs;
        self
    }
}

impl Sub for AffineExpr {
    type Output = AffineExpr;

    fn sub(self, rhs: AffineExpr) -> AffineExpr {
        self + (-rhs)
    }
}

impl Neg for AffineExpr {
    type Output = AffineExpr;

    fn neg(self) -> AffineExpr {
        self * -1.0
    }
}

impl Mul<f64> for AffineExpr {
    type Output = AffineExpr;

    fn mul(mut self, rhs: f64) -> AffineExpr {
        if rhs == 0.0 {
            return AffineExpr::constant(0.0);
        }
        for (_, coef) in self.terms.iter_mut() {
            *coef *= rhs;
        }
        self.constant *= rhs;
        self
    }
}

impl std::iter::Sum for AffineExpr {
    fn sum<I: Iterator<Item = AffineExpr>>(iter: I) -> Self {
        iter.fold(AffineExpr::default(), |acc, e| acc + e)
    }
}

/// Row-major matrix of affine expressions
#[derive(Debug, Clone, PartialEq)]
pub struct ExprMatrix {
    rows: usize,
    cols: usize,
    data: Vec<AffineExpr>,
}

impl ExprMatrix {
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> AffineExpr) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self { rows, cols, data }
    }

    /// Constant expressions holding the entries of `values`
    pub fn constant(values: &DMatrix<f64>) -> Self {
        Self::from_fn(values.nrows(), values.ncols(), |r, c| {
            AffineExpr::constant(values[(r, c)])
        })
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> &AffineExpr {
        &self.data[row * self.cols + col]
    }

    /// Rows `start..start + count`
    pub fn rows_range(&self, start: usize, count: usize) -> ExprMatrix {
        let begin = start * self.cols;
        let end = (start + count) * self.cols;
        Self {
            rows: count,
            cols: self.cols,
            data: self.data[begin..end].to_vec(),
        }
    }

    pub fn evaluate(&self, values: &[f64]) -> DMatrix<f64> {
        DMatrix::from_fn(self.rows, self.cols, |r, c| self.get(r, c).evaluate(values))
    }
}

// ============================================================================
// Variables
// ============================================================================

/// A rows × cols block of consecutive problem variables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarBlock {
    start: usize,
    rows: usize,
    cols: usize,
}

impl VarBlock {
    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    pub fn index(&self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.rows && col < self.cols);
        self.start + row * self.cols + col
    }

    pub fn expr(&self, row: usize, col: usize) -> AffineExpr {
        AffineExpr::variable(self.index(row, col))
    }

    pub fn exprs(&self) -> ExprMatrix {
        ExprMatrix::from_fn(self.rows, self.cols, |r, c| self.expr(r, c))
    }

    /// Extract this block from a solution vector
    pub fn values(&self, solution: &[f64]) -> DMatrix<f64> {
        DMatrix::from_fn(self.rows, self.cols, |r, c| solution[self.index(r, c)])
    }
}

// ============================================================================
// Objective & constraints
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectiveTerm {
    Linear(AffineExpr),
    /// `weight · max(expr, 0)`
    PosPart { weight: f64, expr: AffineExpr },
    /// `weight · expr²`
    Square { weight: f64, expr: AffineExpr },
}

impl ObjectiveTerm {
    /// `weight · max(-expr, 0)`
    pub fn neg_part(weight: f64, expr: AffineExpr) -> Self {
        ObjectiveTerm::PosPart {
            weight,
            expr: -expr,
        }
    }

    pub fn evaluate(&self, values: &[f64]) -> f64 {
        match self {
            ObjectiveTerm::Linear(expr) => expr.evaluate(values),
            ObjectiveTerm::PosPart { weight, expr } => weight * expr.evaluate(values).max(0.0),
            ObjectiveTerm::Square { weight, expr } => weight * expr.evaluate(values).powi(2),
        }
    }
}

/// `lower <= expr <= upper`, either side may be infinite
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    pub expr: AffineExpr,
    pub lower: f64,
    pub upper: f64,
}

impl LinearConstraint {
    pub fn eq(expr: AffineExpr, value: f64) -> Self {
        Self {
            expr,
            lower: value,
            upper: value,
        }
    }

    pub fn ge(expr: AffineExpr, lower: f64) -> Self {
        Self {
            expr,
            lower,
            upper: f64::INFINITY,
        }
    }

    pub fn le(expr: AffineExpr, upper: f64) -> Self {
        Self {
            expr,
            lower: f64::NEG_INFINITY,
            upper,
        }
    }

    pub fn is_equality(&self) -> bool {
        self.lower == self.upper
    }

    /// Distance of `expr` from the interval at `values`
    pub fn violation(&self, values: &[f64]) -> f64 {
        let v = self.expr.evaluate(values);
        (self.lower - v).max(v - self.upper).max(0.0)
    }
}

/// A convex minimization problem
#[derive(Debug, Clone, Default)]
pub struct Problem {
    var_lower: Vec<f64>,
    objective: Vec<ObjectiveTerm>,
    constraints: Vec<LinearConstraint>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a block of variables sharing one lower bound
    /// (`0.0` for nonnegative, `f64::NEG_INFINITY` for free)
    pub fn add_variables(&mut self, rows: usize, cols: usize, lower: f64) -> VarBlock {
        let block = VarBlock {
            start: self.var_lower.len(),
            rows,
            cols,
        };
        self.var_lower.extend(std::iter::repeat(lower).take(rows * cols));
        block
    }

    pub fn num_variables(&self) -> usize {
        self.var_lower.len()
    }

    pub fn variable_lower_bounds(&self) -> &[f64] {
        &self.var_lower
    }

    pub fn add_objective(&mut self, term: ObjectiveTerm) {
        self.objective.push(term);
    }

    pub fn extend_objective(&mut self, terms: impl IntoIterator<Item = ObjectiveTerm>) {
        self.objective.extend(terms);
    }

    pub fn add_constraint(&mut self, constraint: LinearConstraint) {
        self.constraints.push(constraint);
    }

    pub fn extend_constraints(&mut self, constraints: impl IntoIterator<Item = LinearConstraint>) {
        self.constraints.extend(constraints);
    }

    pub fn objective(&self) -> &[ObjectiveTerm] {
        &self.objective
    }

    pub fn constraints(&self) -> &[LinearConstraint] {
        &self.constraints
    }

    pub fn objective_value(&self, values: &[f64]) -> f64 {
        self.objective.iter().map(|t| t.evaluate(values)).sum()
    }

    /// Largest bound or constraint violation at `values`
    pub fn max_violation(&self, values: &[f64]) -> f64 {
        let bounds = self
            .var_lower
            .iter()
            .zip(values)
            .map(|(lb, v)| (lb - v).max(0.0));
        let rows = self.constraints.iter().map(|c| c.violation(values));
        bounds.chain(rows).fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_arithmetic() {
        let x = AffineExpr::variable(0);
        let y = AffineExpr::variable(1);
        let e = (x * 2.0 - y) + 3.0;
        assert_eq!(e.evaluate(&[1.0, 4.0]), 1.0);
        assert_eq!((-e).evaluate(&[1.0, 4.0]), -1.0);
    }

    #[test]
    fn test_var_block_layout() {
        let mut problem = Problem::new();
        let a = problem.add_variables(2, 3, 0.0);
        let b = problem.add_variables(1, 2, f64::NEG_INFINITY);
        assert_eq!(problem.num_variables(), 8);
        assert_eq!(a.index(1, 2), 5);
        assert_eq!(b.index(0, 1), 7);

        let values: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let m = a.values(&values);
        assert_eq!(m[(1, 0)], 3.0);
    }

    #[test]
    fn test_objective_terms() {
        let x = AffineExpr::variable(0);
        assert_eq!(ObjectiveTerm::PosPart { weight: 2.0, expr: x.clone() }.evaluate(&[-1.0]), 0.0);
        assert_eq!(ObjectiveTerm::neg_part(2.0, x.clone()).evaluate(&[-1.5]), 3.0);
        assert_eq!(ObjectiveTerm::Square { weight: 0.5, expr: x }.evaluate(&[4.0]), 8.0);
    }

    #[test]
    fn test_violation() {
        let mut problem = Problem::new();
        let x = problem.add_variables(1, 1, 0.0);
        problem.add_constraint(LinearConstraint::le(x.expr(0, 0), 1.0));
        assert_eq!(problem.max_violation(&[0.5]), 0.0);
        assert_eq!(problem.max_violation(&[1.5]), 0.5);
        assert_eq!(problem.max_violation(&[-2.0]), 2.0);
    }

    #[test]
    fn test_rows_range() {
        let m = ExprMatrix::constant(&DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
        let tail = m.rows_range(1, 2);
        assert_eq!(tail.shape(), (2, 2));
        assert_eq!(tail.get(0, 1).constant_term(), 4.0);
    }
}
