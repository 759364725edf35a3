pub mod simd;

pub use simd::{backend_id, simd_kernel_registry, SimdExecutionProvider};
