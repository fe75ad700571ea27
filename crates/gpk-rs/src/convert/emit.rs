//! Typed emission helpers shared by the formula compilers.
//!
//! [`EmitCtx`] wraps the caller's [`ProgramBuilder`] together with the
//! compilation's precision and operation-set version, so every staged
//! instruction is stamped consistently. [`ValueRef`] pairs a value id with
//! its inferred spec; shape inference here tolerates dynamic dimensions
//! because point counts are usually unknown until evaluation.

use std::collections::BTreeMap;

use crate::graph::spec::{
    ConcatSpec, ConstantOfShapeSpec, CustomCallAttr, CustomCallSpec, DType, Dimension,
    ElementwiseBinaryOp, ElementwiseUnaryOp, GatherSpec, Operation, OpsetVersion, ProgramBuilder,
    ReduceKind, ReduceSpec, Shape, TensorLiteral, TensorSpec, TransposeSpec, ValueId,
};

use super::constants;
use super::CompileError;

/// Handle to a staged value plus the spec inferred for it.
#[derive(Debug, Clone)]
pub(crate) struct ValueRef {
    pub id: ValueId,
    pub spec: TensorSpec,
}

/// Emission context for one compilation.
pub(crate) struct EmitCtx<'a> {
    builder: &'a mut ProgramBuilder,
    dtype: DType,
    op_version: OpsetVersion,
}

impl<'a> EmitCtx<'a> {
    pub fn new(builder: &'a mut ProgramBuilder, dtype: DType, op_version: OpsetVersion) -> Self {
        Self {
            builder,
            dtype,
            op_version,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn builder(&mut self) -> &mut ProgramBuilder {
        self.builder
    }

    /// Looks up the spec recorded for an externally supplied value.
    pub fn lookup(&self, id: ValueId) -> Result<ValueRef, CompileError> {
        let spec = self
            .builder
            .value_type(id)
            .ok_or(CompileError::UnknownValue(id))?
            .clone();
        Ok(ValueRef { id, spec })
    }

    fn emit(&mut self, op: Operation, operands: Vec<ValueId>, output: TensorSpec) -> ValueRef {
        let id = self.builder.emit(op, operands, output.clone(), self.op_version);
        ValueRef { id, spec: output }
    }

    /// Materializes a dense literal as a constant node.
    pub fn constant(&mut self, literal: TensorLiteral) -> ValueRef {
        let spec = literal.spec.clone();
        self.emit(Operation::Constant(literal), Vec::new(), spec)
    }

    /// Materializes a host scalar in the configured precision.
    pub fn scalar(&mut self, value: f64) -> Result<ValueRef, CompileError> {
        let literal = constants::float_literal(self.dtype, &[1], &[value])?;
        Ok(self.constant(literal))
    }

    pub fn unary(&mut self, op: ElementwiseUnaryOp, value: &ValueRef) -> ValueRef {
        let output = value.spec.clone();
        self.emit(Operation::ElementwiseUnary(op), vec![value.id], output)
    }

    pub fn neg(&mut self, value: &ValueRef) -> ValueRef {
        self.unary(ElementwiseUnaryOp::Neg, value)
    }

    pub fn exp(&mut self, value: &ValueRef) -> ValueRef {
        self.unary(ElementwiseUnaryOp::Exp, value)
    }

    pub fn sin(&mut self, value: &ValueRef) -> ValueRef {
        self.unary(ElementwiseUnaryOp::Sin, value)
    }

    pub fn sqrt(&mut self, value: &ValueRef) -> ValueRef {
        self.unary(ElementwiseUnaryOp::Sqrt, value)
    }

    pub fn binary(
        &mut self,
        op: ElementwiseBinaryOp,
        lhs: &ValueRef,
        rhs: &ValueRef,
    ) -> Result<ValueRef, CompileError> {
        if lhs.spec.dtype != rhs.spec.dtype {
            return Err(CompileError::DTypeMismatch {
                context: "elementwise binary",
                lhs: lhs.spec.dtype,
                rhs: rhs.spec.dtype,
            });
        }
        let dims = broadcast_dims("elementwise binary", &lhs.spec.shape, &rhs.spec.shape)?;
        let output = TensorSpec::new(lhs.spec.dtype, Shape::new(dims));
        Ok(self.emit(
            Operation::ElementwiseBinary(op),
            vec![lhs.id, rhs.id],
            output,
        ))
    }

    pub fn add(&mut self, lhs: &ValueRef, rhs: &ValueRef) -> Result<ValueRef, CompileError> {
        self.binary(ElementwiseBinaryOp::Add, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: &ValueRef, rhs: &ValueRef) -> Result<ValueRef, CompileError> {
        self.binary(ElementwiseBinaryOp::Mul, lhs, rhs)
    }

    pub fn maximum(&mut self, lhs: &ValueRef, rhs: &ValueRef) -> Result<ValueRef, CompileError> {
        self.binary(ElementwiseBinaryOp::Maximum, lhs, rhs)
    }

    pub fn div(&mut self, lhs: &ValueRef, rhs: &ValueRef) -> Result<ValueRef, CompileError> {
        self.binary(ElementwiseBinaryOp::Div, lhs, rhs)
    }

    pub fn pow(&mut self, lhs: &ValueRef, rhs: &ValueRef) -> Result<ValueRef, CompileError> {
        self.binary(ElementwiseBinaryOp::Pow, lhs, rhs)
    }

    /// Rank-2 matrix product.
    pub fn matmul(&mut self, lhs: &ValueRef, rhs: &ValueRef) -> Result<ValueRef, CompileError> {
        if lhs.spec.dtype != rhs.spec.dtype {
            return Err(CompileError::DTypeMismatch {
                context: "matmul",
                lhs: lhs.spec.dtype,
                rhs: rhs.spec.dtype,
            });
        }
        let lhs_dims = require_rank("matmul lhs", &lhs.spec, 2)?;
        let rhs_dims = require_rank("matmul rhs", &rhs.spec, 2)?;
        if let (Dimension::Static(k_lhs), Dimension::Static(k_rhs)) = (&lhs_dims[1], &rhs_dims[0]) {
            if k_lhs != k_rhs {
                return Err(CompileError::ShapeMismatch {
                    context: "matmul",
                    detail: format!("contract dimension mismatch: {k_lhs} vs {k_rhs}"),
                });
            }
        }
        let output = TensorSpec::new(
            lhs.spec.dtype,
            Shape::new(vec![lhs_dims[0].clone(), rhs_dims[1].clone()]),
        );
        Ok(self.emit(Operation::MatMul, vec![lhs.id, rhs.id], output))
    }

    /// Rank-2 transpose (`perm = [1, 0]`).
    pub fn transpose2(&mut self, value: &ValueRef) -> Result<ValueRef, CompileError> {
        let dims = require_rank("transpose", &value.spec, 2)?;
        let output = TensorSpec::new(
            value.spec.dtype,
            Shape::new(vec![dims[1].clone(), dims[0].clone()]),
        );
        Ok(self.emit(
            Operation::Transpose(TransposeSpec { perm: vec![1, 0] }),
            vec![value.id],
            output,
        ))
    }

    pub fn reduce(
        &mut self,
        kind: ReduceKind,
        value: &ValueRef,
        axes: &[usize],
        keepdims: bool,
    ) -> Result<ValueRef, CompileError> {
        let rank = value.spec.shape.rank();
        for &axis in axes {
            if axis >= rank {
                return Err(CompileError::ShapeMismatch {
                    context: "reduce",
                    detail: format!("axis {axis} out of range for rank {rank}"),
                });
            }
        }
        let mut dims = Vec::new();
        for (index, dim) in value.spec.shape.dims().iter().enumerate() {
            if axes.contains(&index) {
                if keepdims {
                    dims.push(Dimension::Static(1));
                }
            } else {
                dims.push(dim.clone());
            }
        }
        let output = TensorSpec::new(value.spec.dtype, Shape::new(dims));
        Ok(self.emit(
            Operation::Reduce(ReduceSpec {
                kind,
                axes: axes.to_vec(),
                keepdims,
            }),
            vec![value.id],
            output,
        ))
    }

    /// Runtime shape query: `Si64` vector of the operand's dimensions.
    pub fn shape_of(&mut self, value: &ValueRef) -> ValueRef {
        let rank = value.spec.shape.rank();
        let output = TensorSpec::from_static(DType::Si64, &[rank]);
        self.emit(Operation::ShapeOf, vec![value.id], output)
    }

    /// Extracts one entry of a shape vector as a one-element `Si64` tensor.
    pub fn gather_index(
        &mut self,
        shape_vec: &ValueRef,
        index: i64,
    ) -> Result<ValueRef, CompileError> {
        require_rank("gather", &shape_vec.spec, 1)?;
        let indices = self.constant(constants::index_literal(&[index]));
        let output = TensorSpec::from_static(DType::Si64, &[1]);
        Ok(self.emit(
            Operation::Gather(GatherSpec { axis: 0 }),
            vec![shape_vec.id, indices.id],
            output,
        ))
    }

    /// Concatenates one-dimensional tensors along axis 0.
    pub fn concat1d(&mut self, parts: &[ValueRef]) -> Result<ValueRef, CompileError> {
        let mut total = Some(0usize);
        let mut operands = Vec::with_capacity(parts.len());
        for part in parts {
            let dims = require_rank("concat", &part.spec, 1)?;
            total = match (total, &dims[0]) {
                (Some(acc), Dimension::Static(v)) => Some(acc + v),
                _ => None,
            };
            operands.push(part.id);
        }
        let dtype = parts
            .first()
            .map(|part| part.spec.dtype)
            .unwrap_or(DType::Si64);
        let dim = match total {
            Some(value) => Dimension::Static(value),
            None => Dimension::symbolic("concat"),
        };
        let output = TensorSpec::new(dtype, Shape::new(vec![dim]));
        Ok(self.emit(Operation::Concat(ConcatSpec { axis: 0 }), operands, output))
    }

    /// Emits a filled tensor whose extents are the runtime *values* of
    /// `shape`. The caller states the dimensions it knows symbolically so the
    /// spec stays useful downstream.
    pub fn constant_of_shape(
        &mut self,
        shape: &ValueRef,
        fill: TensorLiteral,
        out_dims: Vec<Dimension>,
    ) -> ValueRef {
        let dtype = fill.spec.dtype;
        let output = TensorSpec::new(dtype, Shape::new(out_dims));
        self.emit(
            Operation::ConstantOfShape(ConstantOfShapeSpec { value: fill }),
            vec![shape.id],
            output,
        )
    }

    /// Identity matrix with the operand's shape and dtype.
    pub fn eye_like(&mut self, value: &ValueRef) -> Result<ValueRef, CompileError> {
        require_rank("eye_like", &value.spec, 2)?;
        let output = value.spec.clone();
        Ok(self.emit(Operation::EyeLike, vec![value.id], output))
    }

    pub fn custom_call(
        &mut self,
        target: impl Into<String>,
        attrs: BTreeMap<String, CustomCallAttr>,
        operands: Vec<ValueId>,
        output: TensorSpec,
    ) -> ValueRef {
        self.emit(
            Operation::CustomCall(CustomCallSpec {
                target: target.into(),
                attrs,
            }),
            operands,
            output,
        )
    }
}

fn require_rank<'s>(
    context: &'static str,
    spec: &'s TensorSpec,
    rank: usize,
) -> Result<&'s [Dimension], CompileError> {
    if spec.shape.rank() != rank {
        return Err(CompileError::ShapeMismatch {
            context,
            detail: format!("expected rank {rank}, got rank {}", spec.shape.rank()),
        });
    }
    Ok(spec.shape.dims())
}

/// Numpy-style broadcast of two shapes, trailing axes aligned.
///
/// Dynamic extents are assumed broadcast-compatible; evaluation revalidates
/// against the concrete sizes.
fn broadcast_dims(
    context: &'static str,
    lhs: &Shape,
    rhs: &Shape,
) -> Result<Vec<Dimension>, CompileError> {
    let rank = lhs.rank().max(rhs.rank());
    let mut dims = Vec::with_capacity(rank);
    for offset in (1..=rank).rev() {
        let a = lhs
            .dims()
            .get(lhs.rank().wrapping_sub(offset))
            .cloned()
            .unwrap_or(Dimension::Static(1));
        let b = rhs
            .dims()
            .get(rhs.rank().wrapping_sub(offset))
            .cloned()
            .unwrap_or(Dimension::Static(1));
        let merged = match (a, b) {
            (Dimension::Static(1), other) => other,
            (other, Dimension::Static(1)) => other,
            (Dimension::Static(x), Dimension::Static(y)) => {
                if x != y {
                    return Err(CompileError::ShapeMismatch {
                        context,
                        detail: format!("cannot broadcast extents {x} and {y}"),
                    });
                }
                Dimension::Static(x)
            }
            (Dimension::Dynamic(sym), Dimension::Dynamic(_)) => Dimension::Dynamic(sym),
            (Dimension::Dynamic(_), Dimension::Static(v))
            | (Dimension::Static(v), Dimension::Dynamic(_)) => Dimension::Static(v),
        };
        dims.push(merged);
    }
    Ok(dims)
}
