//! Core logic of the vkshim Vulkan ICD: the allocator bridge between the
//! caller's and the native library's calling conventions, the per-device
//! allocator registry, configuration and the shared error type.

pub mod allocator;
pub mod config;
pub mod error;
pub mod registry;
pub mod trampoline;

pub use allocator::{Allocator, Callbacks};
pub use error::{ConfigError, ShimError};
pub use registry::AllocatorRegistry;
