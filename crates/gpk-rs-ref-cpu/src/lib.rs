pub mod cpu;

pub use cpu::{CpuTensor, ExecError, ReferenceCpuBackend, TensorData};
