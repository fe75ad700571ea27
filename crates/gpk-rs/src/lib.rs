pub mod convert;
pub mod graph;
pub mod kernel;

pub use convert::{
    compile_kernel, compile_kernel_diag, compile_pairwise_distance, CompileError, CompileOptions,
    DistanceMetric, DistanceOptim, HostArray, PointSet, ZeroShape,
};
pub use graph::spec::{DType, OpsetVersion, Program, ProgramBuilder, ValueId, LATEST_OPSET};
pub use kernel::{Kernel, LengthScale};
