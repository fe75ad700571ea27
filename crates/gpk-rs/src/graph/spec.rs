use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Latest revision of the elementary-operation vocabulary described by this module.
pub const LATEST_OPSET: OpsetVersion = OpsetVersion(1);

/// Integer tag selecting a revision of the elementary-operation vocabulary.
///
/// Every emitted [`Instruction`] carries one; evaluators reject versions they
/// do not implement. Zero is reserved as "never a valid version".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpsetVersion(pub u32);

impl fmt::Display for OpsetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "opset.v{}", self.0)
    }
}

/// Scalar element types supported by the graph contract.
///
/// `F32`/`F64` are the two floating precisions kernel compilations may request;
/// `Si64` exists only for shape plumbing (shape queries, gather indices).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    Si64,
}

impl DType {
    /// Returns `true` for the floating-point element types.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::Si64 => 8,
        }
    }
}

/// Names a symbolic dynamic dimension (e.g. `?n_x`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// Represents a single axis extent in a tensor shape.
///
/// Point counts are frequently unknown until a graph is evaluated, so shapes
/// must be able to carry symbolic extents end to end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

impl Dimension {
    /// Convenience constructor for static extents.
    pub fn from_usize(value: usize) -> Self {
        Self::Static(value)
    }

    /// Convenience constructor for named symbolic extents.
    pub fn symbolic(name: impl Into<String>) -> Self {
        Self::Dynamic(DimSymbol::new(name))
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Builds a fully static shape from extents.
    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dimension::Static).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Returns element count when all dims are static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    /// Builds a spec with fully static dimensions.
    pub fn from_static(dtype: DType, dims: &[usize]) -> Self {
        Self {
            dtype,
            shape: Shape::from_static(dims),
        }
    }

    /// Returns total element count when the shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }
}

/// Dense literal tensor payload, stored as little-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn from_f32s(dims: &[usize], values: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(TensorSpec::from_static(DType::F32, dims), Arc::from(bytes))
    }

    pub fn from_f64s(dims: &[usize], values: &[f64]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(TensorSpec::from_static(DType::F64, dims), Arc::from(bytes))
    }

    pub fn from_i64s(dims: &[usize], values: &[i64]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(TensorSpec::from_static(DType::Si64, dims), Arc::from(bytes))
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Decodes an `F32` payload.
    pub fn to_f32s(&self) -> Result<Vec<f32>, GraphError> {
        if self.spec.dtype != DType::F32 || self.bytes.len() % 4 != 0 {
            return Err(GraphError::MalformedLiteral(format!(
                "expected f32 payload, got {:?} with {} bytes",
                self.spec.dtype,
                self.bytes.len()
            )));
        }
        Ok(self
            .bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Decodes an `F64` payload.
    pub fn to_f64s(&self) -> Result<Vec<f64>, GraphError> {
        if self.spec.dtype != DType::F64 || self.bytes.len() % 8 != 0 {
            return Err(GraphError::MalformedLiteral(format!(
                "expected f64 payload, got {:?} with {} bytes",
                self.spec.dtype,
                self.bytes.len()
            )));
        }
        Ok(self
            .bytes
            .chunks_exact(8)
            .map(|chunk| {
                f64::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
                ])
            })
            .collect())
    }

    /// Decodes an `Si64` payload.
    pub fn to_i64s(&self) -> Result<Vec<i64>, GraphError> {
        if self.spec.dtype != DType::Si64 || self.bytes.len() % 8 != 0 {
            return Err(GraphError::MalformedLiteral(format!(
                "expected si64 payload, got {:?} with {} bytes",
                self.spec.dtype,
                self.bytes.len()
            )));
        }
        Ok(self
            .bytes
            .chunks_exact(8)
            .map(|chunk| {
                i64::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
                ])
            })
            .collect())
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Elementwise unary ops in the elementary vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Exp,
    Sin,
    Sqrt,
}

/// Elementwise binary ops in the elementary vocabulary.
///
/// Binary ops broadcast their operands numpy-style (trailing-axis aligned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Maximum,
}

/// Reduction families available along stated axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    /// Sum of squared elements.
    SumSquare,
    /// Euclidean (L2) norm.
    L2,
}

/// Configuration for axis reductions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

/// Attribute payload for `transpose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Attribute payload for `gather`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatherSpec {
    pub axis: usize,
}

/// Attribute payload for `concat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Attribute payload for `constant_of_shape`: the scalar fill value, which
/// also fixes the output dtype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantOfShapeSpec {
    pub value: TensorLiteral,
}

/// Custom-call attributes are limited to simple primitives so they stay easy
/// to serialize and validate across evaluators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum CustomCallAttr {
    I64(i64),
    F64(f64),
    String(String),
}

/// Attribute payload for `custom_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCallSpec {
    pub target: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, CustomCallAttr>,
}

/// Unique identifier for SSA values in a graph program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Declarative form of the elementary operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    MatMul,
    Transpose(TransposeSpec),
    Reduce(ReduceSpec),
    /// Runtime shape query: produces the operand's shape as an `Si64` vector.
    ShapeOf,
    Gather(GatherSpec),
    Concat(ConcatSpec),
    /// Materializes a filled tensor whose shape is the operand's value.
    ConstantOfShape(ConstantOfShapeSpec),
    /// Identity matrix matching the operand's (square or rectangular) shape.
    EyeLike,
    /// Escape hatch for fused primitives an evaluator may provide natively.
    CustomCall(CustomCallSpec),
}

impl Operation {
    /// Short mnemonic used in error messages and the text rendering.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::ElementwiseUnary(_) => "elementwise_unary",
            Operation::ElementwiseBinary(_) => "elementwise_binary",
            Operation::MatMul => "matmul",
            Operation::Transpose(_) => "transpose",
            Operation::Reduce(_) => "reduce",
            Operation::ShapeOf => "shape_of",
            Operation::Gather(_) => "gather",
            Operation::Concat(_) => "concat",
            Operation::ConstantOfShape(_) => "constant_of_shape",
            Operation::EyeLike => "eye_like",
            Operation::CustomCall(_) => "custom_call",
        }
    }
}

/// Single SSA instruction in a graph program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub output: TensorSpec,
    pub op_version: OpsetVersion,
}

/// Graph function describing one compiled computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<TensorSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<TensorSpec>,
    pub result_ids: Vec<ValueId>,
    pub body: Vec<Instruction>,
    /// Caller-assigned names for root values, used when splicing the function
    /// into a larger graph under construction.
    #[serde(default)]
    pub output_names: BTreeMap<String, ValueId>,
}

/// Complete graph module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub entry: String,
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    /// Returns the entry function, if present.
    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == self.entry)
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        serde_json::from_str(src).map_err(ProgramSerdeError::from)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_line(f, 0, &format!("program @{} {{", self.entry))?;
        for function in &self.functions {
            fmt_function(function, 1, f)?;
        }
        write_line(f, 0, "}")
    }
}

fn fmt_function(function: &Function, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_line(f, indent, &format!("func @{} {{", function.name))?;
    if !function.parameter_ids.is_empty() {
        write_line(f, indent + 1, "params:")?;
        for (value_id, spec) in function
            .parameter_ids
            .iter()
            .zip(function.parameters.iter())
        {
            write_line(
                f,
                indent + 2,
                &format!("%{} : {}", value_id.0, format_spec(spec)),
            )?;
        }
    }
    if !function.body.is_empty() {
        write_line(f, indent + 1, "body:")?;
        for instruction in &function.body {
            fmt_instruction(instruction, indent + 2, f)?;
        }
    }
    if !function.result_ids.is_empty() {
        write_line(f, indent + 1, "results:")?;
        for (value_id, spec) in function.result_ids.iter().zip(function.results.iter()) {
            write_line(
                f,
                indent + 2,
                &format!("%{} : {}", value_id.0, format_spec(spec)),
            )?;
        }
    }
    if !function.output_names.is_empty() {
        write_line(f, indent + 1, "outputs:")?;
        for (name, value_id) in &function.output_names {
            write_line(f, indent + 2, &format!("{name} = %{}", value_id.0))?;
        }
    }
    write_line(f, indent, "}")
}

fn fmt_instruction(
    instruction: &Instruction,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let operands = instruction
        .operands
        .iter()
        .map(|id| format!("%{}", id.0))
        .collect::<Vec<_>>()
        .join(", ");
    let line = if operands.is_empty() {
        format!(
            "%{} = {:?} -> {}",
            instruction.id.0,
            instruction.op,
            format_spec(&instruction.output)
        )
    } else {
        format!(
            "%{} = {:?}({}) -> {}",
            instruction.id.0,
            instruction.op,
            operands,
            format_spec(&instruction.output)
        )
    };
    write_line(f, indent, &line)
}

fn format_spec(spec: &TensorSpec) -> String {
    format!("tensor<{:?} x {}>", spec.dtype, format_shape(&spec.shape))
}

fn format_shape(shape: &Shape) -> String {
    let dims = shape
        .dims()
        .iter()
        .map(|dim| match dim {
            Dimension::Static(v) => v.to_string(),
            Dimension::Dynamic(sym) => format!("?{}", sym.as_str()),
        })
        .collect::<Vec<_>>();
    if dims.is_empty() {
        "[]".to_string()
    } else {
        dims.join("x")
    }
}

fn write_line(f: &mut fmt::Formatter<'_>, indent: usize, line: &str) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    writeln!(f, "{line}")
}

/// Failures raised while assembling a graph program.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate graph output name `{0}`")]
    DuplicateOutputName(String),
    #[error("value {0:?} is not registered in this graph")]
    UnknownValue(ValueId),
    #[error("malformed literal: {0}")]
    MalformedLiteral(String),
}

/// Marker capturing a builder's staging position, used to undo everything a
/// failed compilation emitted.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    next_value_id: u32,
    instructions: usize,
    parameters: usize,
}

/// Lightweight builder for constructing graph functions programmatically.
///
/// Compilations stage instructions here; a caller splices several compiled
/// subgraphs into one function before calling [`ProgramBuilder::finish`].
#[derive(Default)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, TensorSpec)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, TensorSpec>,
    output_names: BTreeMap<String, ValueId>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function parameter (an externally supplied tensor).
    pub fn add_parameter(&mut self, spec: TensorSpec) -> ValueId {
        let id = self.allocate_value();
        self.value_types.insert(id, spec.clone());
        self.parameters.push((id, spec));
        id
    }

    /// Stages a new instruction and returns its output value identifier.
    pub fn emit(
        &mut self,
        op: Operation,
        operands: Vec<ValueId>,
        output: TensorSpec,
        op_version: OpsetVersion,
    ) -> ValueId {
        let id = self.allocate_value();
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
            op_version,
        });
        id
    }

    /// Returns the recorded spec for a staged value.
    pub fn value_type(&self, id: ValueId) -> Option<&TensorSpec> {
        self.value_types.get(&id)
    }

    /// Binds a caller-supplied name to a root value.
    ///
    /// Names identify outputs when the function is spliced into a larger
    /// graph; reusing one would silently alias two roots, so collisions fail.
    pub fn assign_output_name(
        &mut self,
        name: impl Into<String>,
        id: ValueId,
    ) -> Result<(), GraphError> {
        let name = name.into();
        if !self.value_types.contains_key(&id) {
            return Err(GraphError::UnknownValue(id));
        }
        if self.output_names.contains_key(&name) {
            return Err(GraphError::DuplicateOutputName(name));
        }
        self.output_names.insert(name, id);
        Ok(())
    }

    /// Captures the current staging position.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            next_value_id: self.next_value_id,
            instructions: self.instructions.len(),
            parameters: self.parameters.len(),
        }
    }

    /// Discards everything staged after `checkpoint`.
    ///
    /// A compilation either completes or leaves the builder exactly as it
    /// found it; partial subgraphs are never observable.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.instructions.truncate(checkpoint.instructions);
        self.parameters.truncate(checkpoint.parameters);
        self.value_types
            .retain(|id, _| id.0 < checkpoint.next_value_id);
        self.output_names
            .retain(|_, id| id.0 < checkpoint.next_value_id);
        self.next_value_id = checkpoint.next_value_id;
    }

    pub fn finish(self, name: impl Into<String>, result_ids: Vec<ValueId>) -> Function {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let spec = self
                .value_types
                .get(id)
                .expect("result value id must have a recorded type")
                .clone();
            results.push(spec);
        }
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            result_ids,
            body: self.instructions,
            output_names: self.output_names,
        }
    }

    fn allocate_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }
}
