//! Shape-adaptive zero construction.
//!
//! Kernels whose output depends only on how many points arrive (Constant,
//! White) still need outputs sized by the runtime point count. The builder
//! here queries the input's shape at evaluation time instead of assuming a
//! static count: `shape_of -> gather(axis) -> [concat with 1] ->
//! constant_of_shape(0)`.

use crate::graph::spec::Dimension;

use super::constants;
use super::emit::{EmitCtx, ValueRef};
use super::CompileError;

/// Which extent of the source tensor sizes the zero tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CountAxis {
    Rows,
    /// Column-count zeros; no kernel formula currently consumes this axis.
    #[allow(dead_code)]
    Cols,
}

/// Whether the produced zeros keep a singleton second dimension.
///
/// There is no sane default for keeping or dropping the extra dimension, so
/// the choice is a mandatory enum rather than a flag with a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroShape {
    /// Flat vector of zeros, shape `[count]`.
    Flat,
    /// Zeros with a singleton dimension alongside the count: `[count, 1]`
    /// when sized by rows, `[1, count]` when sized by columns.
    KeepSecondDim,
}

/// Emits a zero tensor sized by one runtime extent of `source`.
pub(crate) fn zero_vector_of_size(
    ctx: &mut EmitCtx<'_>,
    source: &ValueRef,
    axis: CountAxis,
    shape: ZeroShape,
) -> Result<ValueRef, CompileError> {
    let axis_index = match axis {
        CountAxis::Rows => 0,
        CountAxis::Cols => 1,
    };
    let count_dim = source
        .spec
        .shape
        .dims()
        .get(axis_index)
        .cloned()
        .ok_or_else(|| CompileError::ShapeMismatch {
            context: "zero vector",
            detail: format!(
                "source rank {} has no axis {axis_index}",
                source.spec.shape.rank()
            ),
        })?;

    let shape_vec = ctx.shape_of(source);
    let count = ctx.gather_index(&shape_vec, axis_index as i64)?;
    let (extents, out_dims) = match shape {
        ZeroShape::Flat => (count, vec![count_dim]),
        ZeroShape::KeepSecondDim => {
            let one = ctx.constant(constants::index_literal(&[1]));
            match axis {
                CountAxis::Rows => (
                    ctx.concat1d(&[count, one])?,
                    vec![count_dim, Dimension::Static(1)],
                ),
                CountAxis::Cols => (
                    ctx.concat1d(&[one, count])?,
                    vec![Dimension::Static(1), count_dim],
                ),
            }
        }
    };

    let fill = constants::float_literal(ctx.dtype(), &[1], &[0.0])?;
    Ok(ctx.constant_of_shape(&extents, fill, out_dims))
}
