//! Reference interpreter for gradgraph functions on host tensors.

pub mod cpu;

pub use cpu::{
    run_function, run_module_function, BackendError, BackendResult, CpuInterpreter,
    CpuKernelInterceptor, CpuTensor, CpuValue, GenericCpuInterpreter, NoopInterceptor,
};
