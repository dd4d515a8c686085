//! The device seam.
//!
//! Everything above this module talks to hardware through [`Device`]. Handles
//! are plain `u64` bundles so the core never sees backend types; each backend
//! maps them to its own objects. Two backends ship: [`VulkanDevice`] and the
//! CPU [`HostDevice`].

use std::sync::Arc;

use octoflow_vulkan::GpuInfo;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64;

use crate::command::Command;
use crate::error::Result;

pub mod host;
pub mod vulkan;

pub use host::{HostDevice, KernelInvocation};
pub use vulkan::VulkanDevice;

/// How a buffer is bound to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingKind {
    /// Read-write storage buffer.
    Storage,
    /// Read-only uniform buffer.
    Uniform,
}

/// Where an allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Mappable and coherent with the host.
    HostVisible,
    /// Fast device memory, not mappable.
    DeviceLocal,
}

impl MemoryLocation {
    pub fn name(self) -> &'static str {
        match self {
            MemoryLocation::HostVisible => "host-visible memory",
            MemoryLocation::DeviceLocal => "device-local memory",
        }
    }
}

/// A specialization constant; its constant id is its position in the list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpecConstant {
    I32(i32),
    U32(u32),
    F32(f32),
}

impl SpecConstant {
    pub fn to_bytes(self) -> [u8; 4] {
        match self {
            SpecConstant::I32(v) => v.to_ne_bytes(),
            SpecConstant::U32(v) => v.to_ne_bytes(),
            SpecConstant::F32(v) => v.to_ne_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub raw: u64,
    pub memory: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    pub pipeline: u64,
    pub layout: u64,
    pub set_layout: u64,
    pub module: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingTableHandle {
    pub pool: u64,
    pub set: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle {
    pub pool: u64,
    pub raw: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryPoolHandle {
    pub raw: u64,
    pub count: u32,
    /// Meaningful low bits of each timestamp written on the pool's queue.
    pub valid_bits: u32,
}

/// A device queue. `slot` is its position in [`Device::queues`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    pub slot: usize,
    pub family: u32,
    pub index: u32,
    pub supports_timestamps: bool,
}

/// What a backend needs to build a compute pipeline.
#[derive(Debug, Clone)]
pub struct PipelineDesc<'a> {
    pub code: &'a [u8],
    pub entry_point: &'a str,
    pub layout: &'a [BindingKind],
    pub spec_constants: &'a [SpecConstant],
    pub push_constant_size: u32,
}

/// Everything the compute core asks of a device.
///
/// `destroy_*` calls take handles by value and never fail; releasing a
/// handle twice is the caller's bug, which is why every owner in the core
/// guards its own destroy with a flag.
pub trait Device: Send + Sync {
    fn name(&self) -> String;

    /// Type, API version and compute limits of the device.
    fn info(&self) -> GpuInfo;

    fn queues(&self) -> Vec<QueueHandle>;

    /// Index of a memory type allowed by `type_bits` that lives at `location`.
    fn find_memory_type(&self, type_bits: u32, location: MemoryLocation) -> Result<u32>;

    fn create_buffer(&self, size: u64, role: BindingKind, location: MemoryLocation) -> Result<BufferHandle>;
    fn destroy_buffer(&self, buffer: BufferHandle);
    /// Copy into a host-visible buffer.
    fn write_mapped(&self, buffer: &BufferHandle, data: &[u8]) -> Result<()>;
    /// Copy out of a host-visible buffer.
    fn read_mapped(&self, buffer: &BufferHandle, out: &mut [u8]) -> Result<()>;

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);
    fn create_binding_table(
        &self,
        pipeline: &PipelineHandle,
        bindings: &[(BufferHandle, BindingKind)],
    ) -> Result<BindingTableHandle>;
    fn destroy_binding_table(&self, table: BindingTableHandle);

    fn create_command_buffer(&self, queue: &QueueHandle) -> Result<CommandBufferHandle>;
    /// Replace the contents of a command buffer with `commands`.
    fn record(&self, cmd: &CommandBufferHandle, commands: &[Command]) -> Result<()>;
    fn destroy_command_buffer(&self, cmd: CommandBufferHandle);

    fn create_fence(&self) -> Result<FenceHandle>;
    fn reset_fence(&self, fence: &FenceHandle) -> Result<()>;
    fn destroy_fence(&self, fence: FenceHandle);
    fn submit(&self, queue: &QueueHandle, cmd: &CommandBufferHandle, fence: &FenceHandle) -> Result<()>;
    /// `Ok(false)` when the timeout elapsed first.
    fn wait_fence(&self, fence: &FenceHandle, timeout_ns: u64) -> Result<bool>;
    /// Non-blocking: has the fence signalled?
    fn fence_status(&self, fence: &FenceHandle) -> Result<bool>;

    /// Timestamp pool for command buffers submitted to `queue`.
    fn create_query_pool(&self, queue: &QueueHandle, count: u32) -> Result<QueryPoolHandle>;
    fn destroy_query_pool(&self, pool: QueryPoolHandle);
    /// Raw tick values of `count` queries starting at `first`.
    fn query_timestamps(&self, pool: &QueryPoolHandle, first: u32, count: u32) -> Result<Vec<u64>>;
    /// Nanoseconds per tick.
    fn timestamp_period(&self) -> f32;

    fn wait_idle(&self) -> Result<()>;
}

pub type DeviceRef = Arc<dyn Device>;

/// xxhash64 of kernel bytes; keys host kernels.
pub fn kernel_hash(code: &[u8]) -> u64 {
    xxh64::xxh64(code, 0)
}
