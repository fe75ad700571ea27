//! Constant materialization.
//!
//! All host-language numbers enter the graph through these helpers so every
//! constant in one compilation shares the configured floating precision.
//! Index tensors (`Si64`) are the one exception, used only for shape
//! plumbing.

use crate::graph::spec::{DType, TensorLiteral};

use super::CompileError;

/// Encodes host floats as a dense literal in the requested precision.
///
/// Only the two floating precisions are accepted; anything else is a
/// configuration error, never a silent cast.
pub(crate) fn float_literal(
    dtype: DType,
    dims: &[usize],
    values: &[f64],
) -> Result<TensorLiteral, CompileError> {
    match dtype {
        DType::F32 => {
            let narrowed: Vec<f32> = values.iter().map(|value| *value as f32).collect();
            Ok(TensorLiteral::from_f32s(dims, &narrowed))
        }
        DType::F64 => Ok(TensorLiteral::from_f64s(dims, values)),
        other => Err(CompileError::UnsupportedDType(other)),
    }
}

/// Encodes a vector of indices as an `Si64` literal.
pub(crate) fn index_literal(values: &[i64]) -> TensorLiteral {
    TensorLiteral::from_i64s(&[values.len()], values)
}
