//! Pairwise-distance compilation strategies.
//!
//! Two strategies compute the same mathematical quantity. The default builds
//! the distance from elementary operations only (row-wise squared-norm
//! expansion plus a matrix-multiply cross term), portable to any evaluator.
//! The fused strategy emits a single `custom_call("cdist")` node for
//! evaluators that provide a native pairwise-distance kernel.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::spec::{CustomCallAttr, ReduceKind, Shape, TensorSpec};

use super::emit::{EmitCtx, ValueRef};
use super::{CompileError, DistanceOptim};

/// Distance metric between rows of two point sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    Euclidean,
    SqEuclidean,
}

impl DistanceMetric {
    pub fn as_str(self) -> &'static str {
        match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::SqEuclidean => "sqeuclidean",
        }
    }
}

/// Compiles the pairwise distance between rows of `x` and rows of `y` under
/// the selected strategy.
pub(crate) fn pairwise(
    ctx: &mut EmitCtx<'_>,
    x: &ValueRef,
    y: &ValueRef,
    metric: DistanceMetric,
    optim: Option<DistanceOptim>,
) -> Result<ValueRef, CompileError> {
    match optim {
        None => expansion(ctx, x, y, metric),
        Some(DistanceOptim::Fused) => fused(ctx, x, y, metric),
    }
}

/// Self-distance of one point set: the full `n x n` matrix, zero diagonal.
pub(crate) fn self_pairwise(
    ctx: &mut EmitCtx<'_>,
    x: &ValueRef,
    metric: DistanceMetric,
) -> Result<ValueRef, CompileError> {
    expansion(ctx, x, x, metric)
}

/// `d²(i, j) = ‖x_i‖² − 2·x_i·y_j + ‖y_j‖²`, clamped at zero before the
/// square root. The clamp matters on the self-distance diagonal, where the
/// three terms cancel only up to rounding.
fn expansion(
    ctx: &mut EmitCtx<'_>,
    x: &ValueRef,
    y: &ValueRef,
    metric: DistanceMetric,
) -> Result<ValueRef, CompileError> {
    let sq_norm_x = ctx.reduce(ReduceKind::SumSquare, x, &[1], true)?;
    let sq_norm_y = ctx.reduce(ReduceKind::SumSquare, y, &[1], true)?;
    let sq_norm_y_t = ctx.transpose2(&sq_norm_y)?;

    let y_t = ctx.transpose2(y)?;
    let cross = ctx.matmul(x, &y_t)?;
    let minus_two = ctx.scalar(-2.0)?;
    let cross_term = ctx.mul(&cross, &minus_two)?;

    let partial = ctx.add(&cross_term, &sq_norm_x)?;
    let squared = ctx.add(&partial, &sq_norm_y_t)?;

    let zero = ctx.scalar(0.0)?;
    let clamped = ctx.maximum(&squared, &zero)?;
    match metric {
        DistanceMetric::SqEuclidean => Ok(clamped),
        DistanceMetric::Euclidean => Ok(ctx.sqrt(&clamped)),
    }
}

fn fused(
    ctx: &mut EmitCtx<'_>,
    x: &ValueRef,
    y: &ValueRef,
    metric: DistanceMetric,
) -> Result<ValueRef, CompileError> {
    if x.spec.dtype != y.spec.dtype {
        return Err(CompileError::DTypeMismatch {
            context: "cdist",
            lhs: x.spec.dtype,
            rhs: y.spec.dtype,
        });
    }
    let (rows_x, rows_y) = match (x.spec.shape.dims(), y.spec.shape.dims()) {
        ([n, _], [m, _]) => (n.clone(), m.clone()),
        _ => {
            return Err(CompileError::ShapeMismatch {
                context: "cdist",
                detail: "pairwise distance requires rank-2 operands".to_string(),
            })
        }
    };
    let mut attrs = BTreeMap::new();
    attrs.insert(
        "metric".to_string(),
        CustomCallAttr::String(metric.as_str().to_string()),
    );
    let output = TensorSpec::new(x.spec.dtype, Shape::new(vec![rows_x, rows_y]));
    Ok(ctx.custom_call("cdist", attrs, vec![x.id, y.id], output))
}
