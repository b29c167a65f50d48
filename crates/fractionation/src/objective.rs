//! Penalty functions and bound translation
//!
//! The same term generator serves the solver (expressions over problem
//! variables) and reporting (constant expressions built from realized
//! trajectories), so the optimized and the re-evaluated objective cannot
//! drift apart.

use crate::prescription::{Bound, BoundSpec, Prescription};
use crate::problem::{AffineExpr, ExprMatrix, LinearConstraint, ObjectiveTerm};
use crate::{PlanError, Result};
use nalgebra::DMatrix;

/// `w_under · max(prescribed - total, 0) + w_over · max(total - prescribed, 0)`
pub fn dose_penalty(total: f64, prescribed: f64, w_under: f64, w_over: f64) -> f64 {
    w_under * (prescribed - total).max(0.0) + w_over * (total - prescribed).max(0.0)
}

/// `w · h²`
pub fn health_penalty(health: f64, weight: f64) -> f64 {
    weight * health * health
}

/// Objective terms of [`dose_penalty`] over expressions
pub fn dose_penalty_terms(
    total: &AffineExpr,
    prescribed: &AffineExpr,
    w_under: f64,
    w_over: f64,
) -> Vec<ObjectiveTerm> {
    let excess = total.clone() - prescribed.clone();
    let mut terms = Vec::with_capacity(2);
    if w_under != 0.0 {
        terms.push(ObjectiveTerm::neg_part(w_under, excess.clone()));
    }
    if w_over != 0.0 {
        terms.push(ObjectiveTerm::PosPart {
            weight: w_over,
            expr: excess,
        });
    }
    terms
}

/// Objective term of [`health_penalty`] over an expression
pub fn health_penalty_term(health: &AffineExpr, weight: f64) -> Option<ObjectiveTerm> {
    (weight != 0.0).then(|| ObjectiveTerm::Square {
        weight,
        expr: health.clone(),
    })
}

/// Treatment objective terms for a T-stage dose trajectory.
///
/// `health` must hold T + 1 rows, row 0 being the initial state, which
/// carries no penalty. Each stage penalizes the summed dose of the stage
/// against every structure's prescribed fraction, plus the weighted
/// squared health of the following state.
pub fn dyn_objective_terms(
    doses: &ExprMatrix,
    health: &ExprMatrix,
    fracs: &ExprMatrix,
    rx: &Prescription,
) -> Result<Vec<ObjectiveTerm>> {
    let (stages, structures) = doses.shape();
    if health.nrows() != stages + 1 {
        return Err(PlanError::Validation(format!(
            "health trajectory must have exactly {} rows, got {}",
            stages + 1,
            health.nrows()
        )));
    }
    if health.ncols() != structures || fracs.shape() != (stages, structures) {
        return Err(PlanError::Validation(format!(
            "health ({} columns) and prescribed fractions {:?} must match doses ({},{})",
            health.ncols(),
            fracs.shape(),
            stages,
            structures
        )));
    }
    rx.validate_weights(structures)?;

    let mut terms = Vec::new();
    for t in 0..stages {
        let total: AffineExpr = (0..structures).map(|j| doses.get(t, j).clone()).sum();
        for k in 0..structures {
            terms.extend(dose_penalty_terms(
                &total,
                fracs.get(t, k),
                rx.dose_weights.under.get(k),
                rx.dose_weights.over.get(k),
            ));
            terms.extend(health_penalty_term(
                health.get(t + 1, k),
                rx.health_weights.get(k),
            ));
        }
    }
    Ok(terms)
}

/// Treatment objective evaluated on realized trajectories
pub fn dyn_objective(
    doses: &DMatrix<f64>,
    health: &DMatrix<f64>,
    fracs: &DMatrix<f64>,
    rx: &Prescription,
) -> Result<f64> {
    let terms = dyn_objective_terms(
        &ExprMatrix::constant(doses),
        &ExprMatrix::constant(health),
        &ExprMatrix::constant(fracs),
        rx,
    )?;
    Ok(terms.iter().map(|t| t.evaluate(&[])).sum())
}

#[derive(Clone, Copy)]
enum Side {
    Lower,
    Upper,
}

/// Translate a `{lower, upper}` block into constraints on `expr`.
///
/// Infinite entries mean "no bound" and are skipped, but a lower bound of
/// `+inf` or an upper bound of `-inf` can never be met and is rejected.
/// Array bounds must match the shape of `expr`.
pub fn rx_to_constraints(expr: &ExprMatrix, bounds: &BoundSpec) -> Result<Vec<LinearConstraint>> {
    let mut constraints = Vec::new();
    if let Some(lower) = &bounds.lower {
        append_bound(&mut constraints, expr, lower, Side::Lower)?;
    }
    if let Some(upper) = &bounds.upper {
        append_bound(&mut constraints, expr, upper, Side::Upper)?;
    }
    Ok(constraints)
}

fn append_bound(
    out: &mut Vec<LinearConstraint>,
    expr: &ExprMatrix,
    bound: &Bound,
    side: Side,
) -> Result<()> {
    let (name, forbidden) = match side {
        Side::Lower => ("lower", f64::INFINITY),
        Side::Upper => ("upper", f64::NEG_INFINITY),
    };
    let values: Vec<f64> = match bound {
        Bound::Scalar(v) => vec![*v],
        Bound::Array(m) => m.iter().copied().collect(),
    };
    if values.iter().any(|v| *v == forbidden) {
        return Err(PlanError::Domain(match side {
            Side::Lower => "lower bound cannot be infinity".to_string(),
            Side::Upper => "upper bound cannot be negative infinity".to_string(),
        }));
    }
    if values.iter().any(|v| v.is_nan()) {
        return Err(PlanError::Domain(format!("{} bound contains NaN", name)));
    }

    let make = |e: &AffineExpr, v: f64| match side {
        Side::Lower => LinearConstraint::ge(e.clone(), v),
        Side::Upper => LinearConstraint::le(e.clone(), v),
    };
    let (rows, cols) = expr.shape();

    match bound {
        Bound::Scalar(v) => {
            if v.is_finite() {
                for r in 0..rows {
                    for c in 0..cols {
                        out.push(make(expr.get(r, c), *v));
                    }
                }
            }
        }
        Bound::Array(m) => {
            if m.shape() != (rows, cols) {
                return Err(PlanError::Validation(format!(
                    "{} bound must have dimensions ({},{}), got {:?}",
                    name,
                    rows,
                    cols,
                    m.shape()
                )));
            }
            for r in 0..rows {
                for c in 0..cols {
                    let v = m[(r, c)];
                    if v.is_finite() {
                        out.push(make(expr.get(r, c), v));
                    }
                }
            }
        }
    }
    Ok(())
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn dose_penalty_vanishes_only_on_target(
            total in -50.0f64..50.0,
            prescribed in 0.0f64..50.0,
            w_under in 0.01f64..10.0,
            w_over in 0.01f64..10.0,
        ) {
            let penalty = dose_penalty(total, prescribed, w_under, w_over);
            prop_assert!(penalty >= 0.0);
            prop_assert_eq!(dose_penalty(prescribed, prescribed, w_under, w_over), 0.0);
            if (total - prescribed).abs() > 1e-9 {
                prop_assert!(penalty > 0.0);
            }
        }

        #[test]
        fn expression_terms_agree_with_scalar_penalty(
            total in -20.0f64..20.0,
            prescribed in 0.0f64..20.0,
            w_under in 0.0f64..5.0,
            w_over in 0.0f64..5.0,
        ) {
            let terms = dose_penalty_terms(
                &AffineExpr::variable(0),
                &AffineExpr::constant(prescribed),
                w_under,
                w_over,
            );
            let via_terms: f64 = terms.iter().map(|t| t.evaluate(&[total])).sum();
            let direct = dose_penalty(total, prescribed, w_under, w_over);
            prop_assert!((via_terms - direct).abs() < 1e-9);
        }

        #[test]
        fn dyn_objective_nonnegative(
            doses in proptest::collection::vec(0.0f64..10.0, 4),
            health in proptest::collection::vec(-5.0f64..5.0, 6),
            weight in 0.0f64..3.0,
        ) {
            let rx = Prescription::new(DMatrix::from_element(2, 2, 1.0)).health_weights(weight);
            let value = dyn_objective(
                &DMatrix::from_row_slice(2, 2, &doses),
                &DMatrix::from_row_slice(3, 2, &health),
                &rx.dose.clone(),
                &rx,
            )
            .unwrap();
            prop_assert!(value >= 0.0);
        }
    }
}
