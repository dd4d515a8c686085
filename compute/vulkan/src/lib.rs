//! OctoFlow Vulkan bootstrap.
//!
//! [`VulkanCompute`] owns the instance, the chosen physical device, the
//! logical device and its compute queues, and knows how to allocate and map
//! buffer memory. Everything above that (pipelines, command buffers, fences)
//! lives in `octoflow-compute`.

pub mod device;
pub mod memory;

pub use ash;
pub use device::{GpuInfo, QueueInfo, VulkanCompute, VulkanError, VulkanOptions};
