//! OctoFlow compute: buffers, algorithms, operations and sequences over a
//! GPU device.
//!
//! A [`Manager`] picks a device (Vulkan through `octoflow-vulkan`, or the
//! in-process host device), creates [`Buffer`]s and [`Algorithm`]s, and
//! hands out [`Sequence`]s that record [`Operation`]s into a reusable
//! command buffer and run them on a queue.

pub mod algorithm;
pub mod buffer;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod manager;
pub mod operation;
pub mod registry;
pub mod sequence;

pub use algorithm::{Algorithm, AlgorithmSpec, Kernel, SpecConstant, Workgroup};
pub use buffer::{Authority, BarrierTarget, Buffer, Element, ElementType, MemoryKind};
pub use command::{Access, Command, CommandRecorder, PipelineStage};
pub use config::{BackendKind, ComputeConfig, LogConfig, LogSink};
pub use device::{BindingKind, Device, DeviceRef, HostDevice, KernelInvocation, MemoryLocation, QueueHandle, VulkanDevice};
pub use error::{ComputeError, Result};
pub use manager::Manager;
pub use octoflow_vulkan::GpuInfo;
pub use operation::Operation;
pub use registry::{Destroy, Registry, ResourceRegistry, Teardown};
pub use sequence::{Sequence, SequenceState};

/// Crate version, from Cargo.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests;
