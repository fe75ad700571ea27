//! Reference interpreter for the elementary operation set.
//!
//! Executes compiled kernel graphs instruction by instruction, deriving
//! output shapes from the concrete inputs rather than the (possibly
//! symbolic) specs recorded at compile time. Arithmetic runs in each
//! tensor's own precision so f32 compilations stay f32 end to end.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use gpk_rs::graph::spec::{
    ConcatSpec, CustomCallAttr, CustomCallSpec, DType, ElementwiseBinaryOp, ElementwiseUnaryOp,
    GatherSpec, Instruction, Operation, Program, ReduceKind, ReduceSpec, TensorLiteral,
    TransposeSpec, ValueId, LATEST_OPSET,
};

/// Dense host tensor with a fully static shape.
#[derive(Debug, Clone)]
pub struct CpuTensor {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub data: TensorData,
}

#[derive(Debug, Clone)]
pub enum TensorData {
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    Si64(Arc<[i64]>),
}

impl CpuTensor {
    pub fn from_f32s(dims: &[usize], values: &[f32]) -> Self {
        Self {
            dtype: DType::F32,
            dims: dims.to_vec(),
            data: TensorData::F32(Arc::from(values.to_vec())),
        }
    }

    pub fn from_f64s(dims: &[usize], values: &[f64]) -> Self {
        Self {
            dtype: DType::F64,
            dims: dims.to_vec(),
            data: TensorData::F64(Arc::from(values.to_vec())),
        }
    }

    pub fn from_i64s(dims: &[usize], values: &[i64]) -> Self {
        Self {
            dtype: DType::Si64,
            dims: dims.to_vec(),
            data: TensorData::Si64(Arc::from(values.to_vec())),
        }
    }

    pub fn from_literal(literal: &TensorLiteral) -> Result<Self, ExecError> {
        let dims = literal
            .spec
            .shape
            .static_dims()
            .ok_or_else(|| ExecError::Execution {
                op: "constant",
                detail: "literal shapes must be static".to_string(),
            })?;
        let tensor = match literal.spec.dtype {
            DType::F32 => Self::from_f32s(&dims, &decode(literal.to_f32s())?),
            DType::F64 => Self::from_f64s(&dims, &decode(literal.to_f64s())?),
            DType::Si64 => Self::from_i64s(&dims, &decode(literal.to_i64s())?),
        };
        Ok(tensor)
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Widens any floating payload to `f64`, mostly for assertions.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>, ExecError> {
        match &self.data {
            TensorData::F32(values) => Ok(values.iter().map(|v| *v as f64).collect()),
            TensorData::F64(values) => Ok(values.to_vec()),
            TensorData::Si64(_) => Err(ExecError::Execution {
                op: "to_f64_vec",
                detail: "tensor holds si64 data".to_string(),
            }),
        }
    }
}

fn decode<T>(result: Result<Vec<T>, gpk_rs::graph::spec::GraphError>) -> Result<Vec<T>, ExecError> {
    result.map_err(|err| ExecError::Execution {
        op: "constant",
        detail: err.to_string(),
    })
}

/// Failures raised while evaluating a program.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("entry function `{0}` not found")]
    MissingEntry(String),
    #[error("entry input arity mismatch: expected {expected}, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("instruction carries op_version {version}, supported range is 1..={latest}")]
    UnsupportedOpsetVersion { version: u32, latest: u32 },
    #[error("operand value {0:?} missing from the environment")]
    MissingValue(ValueId),
    #[error("{op}: {detail}")]
    Execution { op: &'static str, detail: String },
    #[error("in instruction #{index} ({op}): {source}")]
    Instruction {
        index: usize,
        op: String,
        #[source]
        source: Box<ExecError>,
    },
}

/// Stateless reference evaluator.
#[derive(Debug, Default, Clone)]
pub struct ReferenceCpuBackend;

impl ReferenceCpuBackend {
    pub fn new() -> Self {
        Self
    }

    /// Runs the entry function of `program` against the supplied inputs and
    /// returns its results in declaration order.
    pub fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[CpuTensor],
    ) -> Result<Vec<CpuTensor>, ExecError> {
        let function = program
            .entry_function()
            .ok_or_else(|| ExecError::MissingEntry(program.entry.clone()))?;

        if function.parameter_ids.len() != entry_inputs.len() {
            return Err(ExecError::ArityMismatch {
                expected: function.parameter_ids.len(),
                actual: entry_inputs.len(),
            });
        }

        let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
        for (param_id, tensor) in function.parameter_ids.iter().zip(entry_inputs.iter()) {
            values.insert(*param_id, tensor.clone());
        }

        for (index, instruction) in function.body.iter().enumerate() {
            let mut inputs = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                let tensor = values
                    .get(operand)
                    .cloned()
                    .ok_or(ExecError::MissingValue(*operand))?;
                inputs.push(tensor);
            }
            let output = self
                .execute_instruction(instruction, &inputs)
                .map_err(|err| ExecError::Instruction {
                    index,
                    op: instruction.op.name().to_string(),
                    source: Box::new(err),
                })?;
            values.insert(instruction.id, output);
        }

        let mut results = Vec::with_capacity(function.result_ids.len());
        for id in &function.result_ids {
            let value = values
                .get(id)
                .cloned()
                .ok_or(ExecError::MissingValue(*id))?;
            results.push(value);
        }
        Ok(results)
    }

    /// Evaluates one instruction against already materialized inputs.
    pub fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[CpuTensor],
    ) -> Result<CpuTensor, ExecError> {
        let version = instruction.op_version.0;
        if version == 0 || version > LATEST_OPSET.0 {
            return Err(ExecError::UnsupportedOpsetVersion {
                version,
                latest: LATEST_OPSET.0,
            });
        }

        match &instruction.op {
            Operation::Constant(literal) => CpuTensor::from_literal(literal),
            Operation::ElementwiseUnary(op) => unary(*op, one_input("elementwise_unary", inputs)?),
            Operation::ElementwiseBinary(op) => {
                let (lhs, rhs) = two_inputs("elementwise_binary", inputs)?;
                binary(*op, lhs, rhs)
            }
            Operation::MatMul => {
                let (lhs, rhs) = two_inputs("matmul", inputs)?;
                matmul(lhs, rhs)
            }
            Operation::Transpose(spec) => transpose(spec, one_input("transpose", inputs)?),
            Operation::Reduce(spec) => reduce(spec, one_input("reduce", inputs)?),
            Operation::ShapeOf => {
                let input = one_input("shape_of", inputs)?;
                let dims: Vec<i64> = input.dims.iter().map(|d| *d as i64).collect();
                Ok(CpuTensor::from_i64s(&[dims.len()], &dims))
            }
            Operation::Gather(spec) => {
                let (data, indices) = two_inputs("gather", inputs)?;
                gather(spec, data, indices)
            }
            Operation::Concat(spec) => concat(spec, inputs),
            Operation::ConstantOfShape(spec) => {
                constant_of_shape(&spec.value, one_input("constant_of_shape", inputs)?)
            }
            Operation::EyeLike => eye_like(one_input("eye_like", inputs)?),
            Operation::CustomCall(spec) => custom_call(spec, inputs),
        }
    }
}

fn one_input<'t>(op: &'static str, inputs: &'t [CpuTensor]) -> Result<&'t CpuTensor, ExecError> {
    match inputs {
        [input] => Ok(input),
        _ => Err(ExecError::Execution {
            op,
            detail: format!("expected 1 operand, got {}", inputs.len()),
        }),
    }
}

fn two_inputs<'t>(
    op: &'static str,
    inputs: &'t [CpuTensor],
) -> Result<(&'t CpuTensor, &'t CpuTensor), ExecError> {
    match inputs {
        [lhs, rhs] => Ok((lhs, rhs)),
        _ => Err(ExecError::Execution {
            op,
            detail: format!("expected 2 operands, got {}", inputs.len()),
        }),
    }
}

/// Minimal scalar abstraction so every op has one implementation per
/// floating precision without widening intermediates.
trait Scalar: Copy {
    fn from_f64(value: f64) -> Self;
    fn tensor(dims: Vec<usize>, values: Vec<Self>) -> CpuTensor;
    fn add(self, other: Self) -> Self;
    fn sub(self, other: Self) -> Self;
    fn mul(self, other: Self) -> Self;
    fn div(self, other: Self) -> Self;
    fn powf(self, other: Self) -> Self;
    fn max(self, other: Self) -> Self;
    fn neg(self) -> Self;
    fn exp(self) -> Self;
    fn sin(self) -> Self;
    fn sqrt(self) -> Self;
}

macro_rules! impl_scalar {
    ($ty:ty, $dtype:expr, $variant:ident) => {
        impl Scalar for $ty {
            fn from_f64(value: f64) -> Self {
                value as $ty
            }
            fn tensor(dims: Vec<usize>, values: Vec<Self>) -> CpuTensor {
                CpuTensor {
                    dtype: $dtype,
                    dims,
                    data: TensorData::$variant(Arc::from(values)),
                }
            }
            fn add(self, other: Self) -> Self {
                self + other
            }
            fn sub(self, other: Self) -> Self {
                self - other
            }
            fn mul(self, other: Self) -> Self {
                self * other
            }
            fn div(self, other: Self) -> Self {
                self / other
            }
            fn powf(self, other: Self) -> Self {
                self.powf(other)
            }
            fn max(self, other: Self) -> Self {
                self.max(other)
            }
            fn neg(self) -> Self {
                -self
            }
            fn exp(self) -> Self {
                self.exp()
            }
            fn sin(self) -> Self {
                self.sin()
            }
            fn sqrt(self) -> Self {
                self.sqrt()
            }
        }
    };
}

impl_scalar!(f32, DType::F32, F32);
impl_scalar!(f64, DType::F64, F64);

macro_rules! dispatch_float {
    ($op:expr, $tensor:expr, |$values:ident : $ty:ident| $body:expr) => {
        match &$tensor.data {
            TensorData::F32($values) => {
                type $ty = f32;
                $body
            }
            TensorData::F64($values) => {
                type $ty = f64;
                $body
            }
            TensorData::Si64(_) => Err(ExecError::Execution {
                op: $op,
                detail: "expected floating-point operand, got si64".to_string(),
            }),
        }
    };
}

macro_rules! dispatch_float_pair {
    ($op:expr, $lhs:expr, $rhs:expr, |$a:ident, $b:ident : $ty:ident| $body:expr) => {
        match (&$lhs.data, &$rhs.data) {
            (TensorData::F32($a), TensorData::F32($b)) => {
                type $ty = f32;
                $body
            }
            (TensorData::F64($a), TensorData::F64($b)) => {
                type $ty = f64;
                $body
            }
            _ => Err(ExecError::Execution {
                op: $op,
                detail: "operands must share a floating dtype".to_string(),
            }),
        }
    };
}

fn unary(op: ElementwiseUnaryOp, input: &CpuTensor) -> Result<CpuTensor, ExecError> {
    dispatch_float!("elementwise_unary", input, |values: T| {
        let mapped: Vec<T> = values
            .iter()
            .map(|v| match op {
                ElementwiseUnaryOp::Neg => v.neg(),
                ElementwiseUnaryOp::Exp => v.exp(),
                ElementwiseUnaryOp::Sin => v.sin(),
                ElementwiseUnaryOp::Sqrt => v.sqrt(),
            })
            .collect();
        Ok(T::tensor(input.dims.clone(), mapped))
    })
}

fn binary(
    op: ElementwiseBinaryOp,
    lhs: &CpuTensor,
    rhs: &CpuTensor,
) -> Result<CpuTensor, ExecError> {
    let out_dims = broadcast_dims(&lhs.dims, &rhs.dims)?;
    dispatch_float_pair!("elementwise_binary", lhs, rhs, |a, b: T| {
        let count: usize = out_dims.iter().product();
        let mut out = Vec::with_capacity(count);
        for linear in 0..count {
            let lhs_value = a[broadcast_index(linear, &out_dims, &lhs.dims)];
            let rhs_value = b[broadcast_index(linear, &out_dims, &rhs.dims)];
            out.push(match op {
                ElementwiseBinaryOp::Add => lhs_value.add(rhs_value),
                ElementwiseBinaryOp::Sub => lhs_value.sub(rhs_value),
                ElementwiseBinaryOp::Mul => lhs_value.mul(rhs_value),
                ElementwiseBinaryOp::Div => lhs_value.div(rhs_value),
                ElementwiseBinaryOp::Pow => lhs_value.powf(rhs_value),
                ElementwiseBinaryOp::Maximum => lhs_value.max(rhs_value),
            });
        }
        Ok(T::tensor(out_dims.clone(), out))
    })
}

/// Numpy broadcast of the concrete dims, trailing axes aligned.
fn broadcast_dims(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, ExecError> {
    let rank = lhs.len().max(rhs.len());
    let mut dims = Vec::with_capacity(rank);
    for offset in (1..=rank).rev() {
        let a = lhs
            .len()
            .checked_sub(offset)
            .map(|i| lhs[i])
            .unwrap_or(1);
        let b = rhs
            .len()
            .checked_sub(offset)
            .map(|i| rhs[i])
            .unwrap_or(1);
        let merged = if a == b {
            a
        } else if a == 1 {
            b
        } else if b == 1 {
            a
        } else {
            return Err(ExecError::Execution {
                op: "elementwise_binary",
                detail: format!("cannot broadcast {lhs:?} with {rhs:?}"),
            });
        };
        dims.push(merged);
    }
    Ok(dims)
}

/// Maps a linear index in the broadcast output back to the linear index of
/// an operand with `dims` (size-1 axes contribute nothing).
fn broadcast_index(linear: usize, out_dims: &[usize], dims: &[usize]) -> usize {
    let mut remaining = linear;
    let mut index = 0usize;
    let offset = out_dims.len() - dims.len();
    // Decompose right to left so trailing axes align.
    let mut coords = vec![0usize; out_dims.len()];
    for axis in (0..out_dims.len()).rev() {
        coords[axis] = remaining % out_dims[axis];
        remaining /= out_dims[axis];
    }
    for (axis, &dim) in dims.iter().enumerate() {
        let coord = if dim == 1 { 0 } else { coords[axis + offset] };
        index = index * dim + coord;
    }
    index
}

fn matmul(lhs: &CpuTensor, rhs: &CpuTensor) -> Result<CpuTensor, ExecError> {
    let (n, k) = expect_rank2("matmul", lhs)?;
    let (k2, m) = expect_rank2("matmul", rhs)?;
    if k != k2 {
        return Err(ExecError::Execution {
            op: "matmul",
            detail: format!("contract dimension mismatch: {k} vs {k2}"),
        });
    }
    dispatch_float_pair!("matmul", lhs, rhs, |a, b: T| {
        let mut out = vec![T::from_f64(0.0); n * m];
        for row in 0..n {
            for inner in 0..k {
                let lhs_value = a[row * k + inner];
                for col in 0..m {
                    out[row * m + col] =
                        out[row * m + col].add(lhs_value.mul(b[inner * m + col]));
                }
            }
        }
        Ok(T::tensor(vec![n, m], out))
    })
}

fn expect_rank2(op: &'static str, tensor: &CpuTensor) -> Result<(usize, usize), ExecError> {
    match tensor.dims[..] {
        [rows, cols] => Ok((rows, cols)),
        _ => Err(ExecError::Execution {
            op,
            detail: format!("expected rank-2 operand, got dims {:?}", tensor.dims),
        }),
    }
}

fn transpose(spec: &TransposeSpec, input: &CpuTensor) -> Result<CpuTensor, ExecError> {
    let rank = input.dims.len();
    if spec.perm.len() != rank {
        return Err(ExecError::Execution {
            op: "transpose",
            detail: format!("perm {:?} does not match rank {rank}", spec.perm),
        });
    }
    let out_dims: Vec<usize> = spec.perm.iter().map(|&axis| input.dims[axis]).collect();
    let count = input.element_count();

    let mut in_strides = vec![1usize; rank];
    for axis in (0..rank.saturating_sub(1)).rev() {
        in_strides[axis] = in_strides[axis + 1] * input.dims[axis + 1];
    }

    dispatch_float!("transpose", input, |values: T| {
        let mut out = Vec::with_capacity(count);
        let mut coords = vec![0usize; rank];
        for linear in 0..count {
            let mut remaining = linear;
            for axis in (0..rank).rev() {
                coords[axis] = remaining % out_dims[axis];
                remaining /= out_dims[axis];
            }
            let mut source = 0usize;
            for (out_axis, &in_axis) in spec.perm.iter().enumerate() {
                source += coords[out_axis] * in_strides[in_axis];
            }
            out.push(values[source]);
        }
        Ok(T::tensor(out_dims.clone(), out))
    })
}

fn reduce(spec: &ReduceSpec, input: &CpuTensor) -> Result<CpuTensor, ExecError> {
    let rank = input.dims.len();
    for &axis in &spec.axes {
        if axis >= rank {
            return Err(ExecError::Execution {
                op: "reduce",
                detail: format!("axis {axis} out of range for rank {rank}"),
            });
        }
    }
    let mut out_dims = Vec::new();
    for (axis, &dim) in input.dims.iter().enumerate() {
        if spec.axes.contains(&axis) {
            if spec.keepdims {
                out_dims.push(1);
            }
        } else {
            out_dims.push(dim);
        }
    }
    let out_count: usize = out_dims.iter().product::<usize>().max(1);

    dispatch_float!("reduce", input, |values: T| {
        let mut accum = vec![T::from_f64(0.0); out_count];
        let mut coords = vec![0usize; rank];
        for (linear, value) in values.iter().enumerate() {
            let mut remaining = linear;
            for axis in (0..rank).rev() {
                coords[axis] = remaining % input.dims[axis];
                remaining /= input.dims[axis];
            }
            let mut out_index = 0usize;
            for (axis, &coord) in coords.iter().enumerate() {
                let reduced = spec.axes.contains(&axis);
                if reduced && !spec.keepdims {
                    continue;
                }
                let (dim, coord) = if reduced { (1, 0) } else { (input.dims[axis], coord) };
                out_index = out_index * dim + coord;
            }
            accum[out_index] = accum[out_index].add(value.mul(*value));
        }
        if spec.kind == ReduceKind::L2 {
            for value in accum.iter_mut() {
                *value = value.sqrt();
            }
        }
        let dims = if out_dims.is_empty() {
            vec![1]
        } else {
            out_dims.clone()
        };
        Ok(T::tensor(dims, accum))
    })
}

fn gather(
    spec: &GatherSpec,
    data: &CpuTensor,
    indices: &CpuTensor,
) -> Result<CpuTensor, ExecError> {
    if spec.axis != 0 || data.dims.len() != 1 || indices.dims.len() != 1 {
        return Err(ExecError::Execution {
            op: "gather",
            detail: "only 1-D gather along axis 0 is implemented".to_string(),
        });
    }
    let index_values = match &indices.data {
        TensorData::Si64(values) => values.clone(),
        _ => {
            return Err(ExecError::Execution {
                op: "gather",
                detail: "indices must be si64".to_string(),
            })
        }
    };
    match &data.data {
        TensorData::Si64(values) => {
            let mut out = Vec::with_capacity(index_values.len());
            for &index in index_values.iter() {
                let index = usize::try_from(index).map_err(|_| ExecError::Execution {
                    op: "gather",
                    detail: format!("negative index {index}"),
                })?;
                let value = values.get(index).ok_or_else(|| ExecError::Execution {
                    op: "gather",
                    detail: format!("index {index} out of bounds for {}", values.len()),
                })?;
                out.push(*value);
            }
            Ok(CpuTensor::from_i64s(&[out.len()], &out))
        }
        _ => Err(ExecError::Execution {
            op: "gather",
            detail: "only si64 data is implemented".to_string(),
        }),
    }
}

fn concat(spec: &ConcatSpec, inputs: &[CpuTensor]) -> Result<CpuTensor, ExecError> {
    if spec.axis != 0 || inputs.iter().any(|input| input.dims.len() != 1) {
        return Err(ExecError::Execution {
            op: "concat",
            detail: "only 1-D concat along axis 0 is implemented".to_string(),
        });
    }
    let mut out = Vec::new();
    for input in inputs {
        match &input.data {
            TensorData::Si64(values) => out.extend_from_slice(values),
            _ => {
                return Err(ExecError::Execution {
                    op: "concat",
                    detail: "only si64 operands are implemented".to_string(),
                })
            }
        }
    }
    Ok(CpuTensor::from_i64s(&[out.len()], &out))
}

fn constant_of_shape(fill: &TensorLiteral, shape: &CpuTensor) -> Result<CpuTensor, ExecError> {
    let extents = match &shape.data {
        TensorData::Si64(values) => values.clone(),
        _ => {
            return Err(ExecError::Execution {
                op: "constant_of_shape",
                detail: "shape operand must be si64".to_string(),
            })
        }
    };
    let mut dims = Vec::with_capacity(extents.len());
    for &extent in extents.iter() {
        let extent = usize::try_from(extent).map_err(|_| ExecError::Execution {
            op: "constant_of_shape",
            detail: format!("negative extent {extent}"),
        })?;
        dims.push(extent);
    }
    let count: usize = dims.iter().product();
    match fill.spec.dtype {
        DType::F32 => {
            let value = *decode(fill.to_f32s())?
                .first()
                .ok_or_else(|| ExecError::Execution {
                    op: "constant_of_shape",
                    detail: "fill literal is empty".to_string(),
                })?;
            Ok(CpuTensor::from_f32s(&dims, &vec![value; count]))
        }
        DType::F64 => {
            let value = *decode(fill.to_f64s())?
                .first()
                .ok_or_else(|| ExecError::Execution {
                    op: "constant_of_shape",
                    detail: "fill literal is empty".to_string(),
                })?;
            Ok(CpuTensor::from_f64s(&dims, &vec![value; count]))
        }
        DType::Si64 => {
            let value = *decode(fill.to_i64s())?
                .first()
                .ok_or_else(|| ExecError::Execution {
                    op: "constant_of_shape",
                    detail: "fill literal is empty".to_string(),
                })?;
            Ok(CpuTensor::from_i64s(&dims, &vec![value; count]))
        }
    }
}

fn eye_like(input: &CpuTensor) -> Result<CpuTensor, ExecError> {
    let (rows, cols) = expect_rank2("eye_like", input)?;
    dispatch_float!("eye_like", input, |_values: T| {
        let mut out = vec![T::from_f64(0.0); rows * cols];
        for diag in 0..rows.min(cols) {
            out[diag * cols + diag] = T::from_f64(1.0);
        }
        Ok(T::tensor(vec![rows, cols], out))
    })
}

fn custom_call(spec: &CustomCallSpec, inputs: &[CpuTensor]) -> Result<CpuTensor, ExecError> {
    match spec.target.as_str() {
        "cdist" => {
            let (x, y) = two_inputs("custom_call", inputs)?;
            let metric = match spec.attrs.get("metric") {
                Some(CustomCallAttr::String(metric)) => metric.as_str(),
                _ => {
                    return Err(ExecError::Execution {
                        op: "custom_call",
                        detail: "cdist requires a string `metric` attribute".to_string(),
                    })
                }
            };
            cdist(x, y, metric)
        }
        other => Err(ExecError::Execution {
            op: "custom_call",
            detail: format!("unknown custom call target `{other}`"),
        }),
    }
}

/// Exact per-pair distance kernel backing the fused strategy.
fn cdist(x: &CpuTensor, y: &CpuTensor, metric: &str) -> Result<CpuTensor, ExecError> {
    let (n, features) = expect_rank2("custom_call", x)?;
    let (m, features_y) = expect_rank2("custom_call", y)?;
    if features != features_y {
        return Err(ExecError::Execution {
            op: "custom_call",
            detail: format!("cdist feature mismatch: {features} vs {features_y}"),
        });
    }
    let sqrt_result = match metric {
        "euclidean" => true,
        "sqeuclidean" => false,
        other => {
            return Err(ExecError::Execution {
                op: "custom_call",
                detail: format!("cdist metric `{other}` is not implemented"),
            })
        }
    };
    dispatch_float_pair!("custom_call", x, y, |a, b: T| {
        let mut out = Vec::with_capacity(n * m);
        for row in 0..n {
            for col in 0..m {
                let mut sum = T::from_f64(0.0);
                for feature in 0..features {
                    let diff = a[row * features + feature].sub(b[col * features + feature]);
                    sum = sum.add(diff.mul(diff));
                }
                out.push(if sqrt_result { sum.sqrt() } else { sum });
            }
        }
        Ok(T::tensor(vec![n, m], out))
    })
}
