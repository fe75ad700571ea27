//! Portable graph representation targeted by the kernel compiler.

pub mod spec;

pub use spec::{
    DType, Dimension, Function, GraphError, Instruction, Operation, OpsetVersion, Program,
    ProgramBuilder, Shape, TensorLiteral, TensorSpec, ValueId,
};
