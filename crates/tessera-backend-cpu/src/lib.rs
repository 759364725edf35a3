pub mod cpu;

pub use cpu::{backend_id, cpu_kernel_registry, CpuExecutionProvider};
