//! Kernel-expression-to-graph compilation.
//!
//! Entry points here validate the caller's configuration once, then hand the
//! kernel tree to the recursive compiler. A compilation is atomic with
//! respect to the caller's [`ProgramBuilder`]: on any failure the builder is
//! rolled back to its pre-call state, so partial subgraphs never leak.

mod compiler;
mod constants;
mod distance;
mod emit;
mod zeros;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::spec::{
    Checkpoint, DType, Dimension, GraphError, OpsetVersion, ProgramBuilder, TensorSpec, ValueId,
    LATEST_OPSET,
};
use crate::kernel::Kernel;

pub use distance::DistanceMetric;
pub use zeros::ZeroShape;

use emit::EmitCtx;

/// Compile-time-known 2-D point array, row major.
///
/// Host arrays unlock the constant-folded formula branches: operations such
/// as transposing a known training set happen here instead of in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostArray {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}

impl HostArray {
    pub fn new(rows: usize, cols: usize, values: Vec<f64>) -> Result<Self, CompileError> {
        if values.len() != rows * cols {
            return Err(CompileError::ShapeMismatch {
                context: "host array",
                detail: format!(
                    "{rows}x{cols} array needs {} values, got {}",
                    rows * cols,
                    values.len()
                ),
            });
        }
        Ok(Self { rows, cols, values })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Column-major copy of the values, i.e. the transposed array.
    pub(crate) fn transposed_values(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.values.len());
        for col in 0..self.cols {
            for row in 0..self.rows {
                out.push(self.values[row * self.cols + col]);
            }
        }
        out
    }

    /// Divides every row by its L2 norm.
    pub(crate) fn l2_normalized_rows(&self) -> HostArray {
        let mut values = self.values.clone();
        for row in 0..self.rows {
            let slice = &mut values[row * self.cols..(row + 1) * self.cols];
            let norm = slice.iter().map(|v| v * v).sum::<f64>().sqrt();
            for value in slice.iter_mut() {
                *value /= norm;
            }
        }
        HostArray {
            rows: self.rows,
            cols: self.cols,
            values,
        }
    }
}

/// One input point set of shape `[n_points, n_features]`.
#[derive(Debug, Clone, PartialEq)]
pub enum PointSet {
    /// A symbolic tensor already registered with the builder; its row count
    /// may be dynamic.
    Graph(ValueId),
    /// A compile-time-known array, materialized as a constant when used.
    Host(HostArray),
}

/// Strategy override for pairwise-distance subgraphs.
///
/// The default (no override) composes the distance from elementary
/// operations; `Fused` emits the single specialized distance node instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceOptim {
    Fused,
}

impl FromStr for DistanceOptim {
    type Err = CompileError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode {
            "fused" => Ok(DistanceOptim::Fused),
            other => Err(CompileError::UnknownOptimization(other.to_string())),
        }
    }
}

/// Configuration threaded through one compilation.
///
/// The precision and operation-set version are fixed at the entry point and
/// stamped onto everything emitted; nothing is inferred bottom-up.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub dtype: DType,
    pub op_version: Option<OpsetVersion>,
    pub optim: Option<DistanceOptim>,
}

impl CompileOptions {
    pub fn new(dtype: DType, op_version: OpsetVersion) -> Self {
        Self {
            dtype,
            op_version: Some(op_version),
            optim: None,
        }
    }

    pub fn with_optim(mut self, optim: DistanceOptim) -> Self {
        self.optim = Some(optim);
        self
    }
}

/// Failure taxonomy for kernel compilation.
///
/// Configuration problems, unsupported constructs, and shape mismatches are
/// all fatal to the surrounding compilation; there is no internal recovery
/// because a numeric formula cannot be approximated.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("op_version must be provided and non-zero; refusing to guess the operation-set revision")]
    MissingOpVersion,
    #[error("op_version {requested} is unknown; latest revision is {latest}")]
    UnsupportedOpVersion {
        requested: OpsetVersion,
        latest: OpsetVersion,
    },
    #[error("kernel graphs require a floating precision, got {0:?}")]
    UnsupportedDType(DType),
    #[error("unknown distance optimization `{0}`")]
    UnknownOptimization(String),
    #[error("unsupported {kernel} kernel construct: {detail}")]
    Unsupported { kernel: &'static str, detail: String },
    #[error("shape mismatch in {context}: {detail}")]
    ShapeMismatch { context: &'static str, detail: String },
    #[error("dtype mismatch in {context}: {lhs:?} vs {rhs:?}")]
    DTypeMismatch {
        context: &'static str,
        lhs: DType,
        rhs: DType,
    },
    #[error("value {0:?} is not registered in the builder")]
    UnknownValue(ValueId),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Compiles the full kernel matrix `k(X, X_train)` into the builder and
/// returns the root value of the emitted subgraph.
///
/// When `x_train` is `None` the kernel is evaluated against `X` paired with
/// itself. `output_name`, when given, is bound to the root value for the
/// hosting graph to pick up.
pub fn compile_kernel(
    builder: &mut ProgramBuilder,
    kernel: &Kernel,
    x: &PointSet,
    x_train: Option<&PointSet>,
    options: &CompileOptions,
    output_name: Option<&str>,
) -> Result<ValueId, CompileError> {
    let op_version = validate_options(options)?;
    let x_spec = validate_point_set(builder, options, x)?;
    if let Some(train) = x_train {
        let train_spec = validate_point_set(builder, options, train)?;
        ensure_matching_features(&x_spec, &train_spec)?;
    }

    let checkpoint = builder.checkpoint();
    let outcome = {
        let mut ctx = EmitCtx::new(builder, options.dtype, op_version);
        compiler::compile(&mut ctx, kernel, x, x_train, options.optim).and_then(|root| {
            if let Some(name) = output_name {
                ctx.builder().assign_output_name(name, root.id)?;
            }
            Ok(root.id)
        })
    };
    finish_or_rollback(builder, checkpoint, outcome)
}

/// Compiles only the diagonal of `k(X, X)`: a vector with one entry per row
/// of `X`, equal elementwise to the diagonal of the full kernel matrix.
pub fn compile_kernel_diag(
    builder: &mut ProgramBuilder,
    kernel: &Kernel,
    x: &PointSet,
    options: &CompileOptions,
    output_name: Option<&str>,
) -> Result<ValueId, CompileError> {
    let op_version = validate_options(options)?;
    validate_point_set(builder, options, x)?;

    let checkpoint = builder.checkpoint();
    let outcome = {
        let mut ctx = EmitCtx::new(builder, options.dtype, op_version);
        compiler::compile_diag(&mut ctx, kernel, x).and_then(|root| {
            if let Some(name) = output_name {
                ctx.builder().assign_output_name(name, root.id)?;
            }
            Ok(root.id)
        })
    };
    finish_or_rollback(builder, checkpoint, outcome)
}

/// Compiles the pairwise distance between two point sets under the selected
/// strategy. Both strategies produce the same mathematical quantity.
pub fn compile_pairwise_distance(
    builder: &mut ProgramBuilder,
    x: &PointSet,
    y: &PointSet,
    metric: DistanceMetric,
    options: &CompileOptions,
) -> Result<ValueId, CompileError> {
    let op_version = validate_options(options)?;
    let x_spec = validate_point_set(builder, options, x)?;
    let y_spec = validate_point_set(builder, options, y)?;
    ensure_matching_features(&x_spec, &y_spec)?;

    let checkpoint = builder.checkpoint();
    let outcome = {
        let mut ctx = EmitCtx::new(builder, options.dtype, op_version);
        pairwise_impl(&mut ctx, x, y, metric, options.optim)
    };
    finish_or_rollback(builder, checkpoint, outcome)
}

fn pairwise_impl(
    ctx: &mut EmitCtx<'_>,
    x: &PointSet,
    y: &PointSet,
    metric: DistanceMetric,
    optim: Option<DistanceOptim>,
) -> Result<ValueId, CompileError> {
    let x_ref = compiler::resolve(ctx, x)?;
    let y_ref = compiler::resolve(ctx, y)?;
    Ok(distance::pairwise(ctx, &x_ref, &y_ref, metric, optim)?.id)
}

fn finish_or_rollback(
    builder: &mut ProgramBuilder,
    checkpoint: Checkpoint,
    outcome: Result<ValueId, CompileError>,
) -> Result<ValueId, CompileError> {
    match outcome {
        Ok(id) => Ok(id),
        Err(err) => {
            builder.rollback(checkpoint);
            Err(err)
        }
    }
}

fn validate_options(options: &CompileOptions) -> Result<OpsetVersion, CompileError> {
    let op_version = options.op_version.ok_or(CompileError::MissingOpVersion)?;
    if op_version.0 == 0 {
        return Err(CompileError::MissingOpVersion);
    }
    if op_version > LATEST_OPSET {
        return Err(CompileError::UnsupportedOpVersion {
            requested: op_version,
            latest: LATEST_OPSET,
        });
    }
    if !options.dtype.is_float() {
        return Err(CompileError::UnsupportedDType(options.dtype));
    }
    Ok(op_version)
}

/// Point sets are `[n_points, n_features]` tensors in the compilation's
/// precision; anything else fails before emission starts.
fn validate_point_set(
    builder: &ProgramBuilder,
    options: &CompileOptions,
    points: &PointSet,
) -> Result<TensorSpec, CompileError> {
    let spec = match points {
        PointSet::Graph(id) => builder
            .value_type(*id)
            .cloned()
            .ok_or(CompileError::UnknownValue(*id))?,
        PointSet::Host(array) => {
            TensorSpec::from_static(options.dtype, &[array.rows(), array.cols()])
        }
    };
    if spec.shape.rank() != 2 {
        return Err(CompileError::ShapeMismatch {
            context: "input point set",
            detail: format!("expected rank 2, got rank {}", spec.shape.rank()),
        });
    }
    if spec.dtype != options.dtype {
        return Err(CompileError::DTypeMismatch {
            context: "input point set",
            lhs: spec.dtype,
            rhs: options.dtype,
        });
    }
    Ok(spec)
}

fn ensure_matching_features(x: &TensorSpec, y: &TensorSpec) -> Result<(), CompileError> {
    if let (Some(Dimension::Static(a)), Some(Dimension::Static(b))) =
        (x.shape.dims().get(1), y.shape.dims().get(1))
    {
        if a != b {
            return Err(CompileError::ShapeMismatch {
                context: "input point set",
                detail: format!("point sets disagree on feature count: {a} vs {b}"),
            });
        }
    }
    Ok(())
}
