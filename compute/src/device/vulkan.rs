//! Vulkan implementation of the device seam, on top of `octoflow-vulkan`.
//!
//! Every command buffer gets its own pool so sequences can record from
//! different threads without sharing pool state. Command buffers are
//! reusable (no ONE_TIME_SUBMIT) so a sequence can be replayed.

use std::ffi::CString;
use std::io::Cursor;

use log::{debug, trace};
use octoflow_vulkan::ash::vk::{self, Handle};
use octoflow_vulkan::{GpuInfo, VulkanCompute, VulkanError, VulkanOptions};

use super::{
    BindingKind, BindingTableHandle, BufferHandle, CommandBufferHandle, Device, FenceHandle,
    MemoryLocation, PipelineDesc, PipelineHandle, QueryPoolHandle, QueueHandle,
};
use crate::command::Command;
use crate::error::{ComputeError, Result};

pub struct VulkanDevice {
    gpu: VulkanCompute,
}

fn memory_flags(location: MemoryLocation) -> vk::MemoryPropertyFlags {
    match location {
        MemoryLocation::HostVisible => {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        }
        MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
    }
}

/// Keep the low `valid_bits` of a raw timestamp; the rest is undefined.
fn mask_ticks(ticks: u64, valid_bits: u32) -> u64 {
    match valid_bits {
        0 => 0,
        bits if bits >= u64::BITS => ticks,
        bits => ticks & ((1u64 << bits) - 1),
    }
}

fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::Storage => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::Uniform => vk::DescriptorType::UNIFORM_BUFFER,
    }
}

impl VulkanDevice {
    pub fn new(options: &VulkanOptions) -> Result<Self> {
        Ok(Self { gpu: VulkanCompute::with_options(options)? })
    }

    pub fn from_compute(gpu: VulkanCompute) -> Self {
        Self { gpu }
    }

    pub fn compute(&self) -> &VulkanCompute {
        &self.gpu
    }

    fn raw(&self) -> &octoflow_vulkan::ash::Device {
        self.gpu.device()
    }

    fn record_command(&self, cmd: vk::CommandBuffer, command: &Command) {
        let device = self.raw();
        unsafe {
            match command {
                Command::CopyBuffer { src, dst, size } => {
                    let region = vk::BufferCopy::default().size(*size);
                    device.cmd_copy_buffer(
                        cmd,
                        vk::Buffer::from_raw(src.raw),
                        vk::Buffer::from_raw(dst.raw),
                        &[region],
                    );
                }
                Command::Dispatch { pipeline, table, push_constants, groups } => {
                    let layout = vk::PipelineLayout::from_raw(pipeline.layout);
                    device.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        vk::Pipeline::from_raw(pipeline.pipeline),
                    );
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        layout,
                        0,
                        &[vk::DescriptorSet::from_raw(table.set)],
                        &[],
                    );
                    if !push_constants.is_empty() {
                        device.cmd_push_constants(cmd, layout, vk::ShaderStageFlags::COMPUTE, 0, push_constants);
                    }
                    device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
                }
                Command::Barrier { buffers, src_access, dst_access, src_stage, dst_stage } => {
                    let barriers: Vec<vk::BufferMemoryBarrier> = buffers
                        .iter()
                        .map(|b| {
                            vk::BufferMemoryBarrier::default()
                                .src_access_mask(vk::AccessFlags::from_raw(src_access.bits()))
                                .dst_access_mask(vk::AccessFlags::from_raw(dst_access.bits()))
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .buffer(vk::Buffer::from_raw(b.raw))
                                .offset(0)
                                .size(vk::WHOLE_SIZE)
                        })
                        .collect();
                    device.cmd_pipeline_barrier(
                        cmd,
                        vk::PipelineStageFlags::from_raw(src_stage.bits()),
                        vk::PipelineStageFlags::from_raw(dst_stage.bits()),
                        vk::DependencyFlags::empty(),
                        &[],
                        &barriers,
                        &[],
                    );
                }
                Command::ResetQueries { pool, first, count } => {
                    device.cmd_reset_query_pool(cmd, vk::QueryPool::from_raw(pool.raw), *first, *count);
                }
                Command::WriteTimestamp { pool, stage, query } => {
                    device.cmd_write_timestamp(
                        cmd,
                        vk::PipelineStageFlags::from_raw(stage.bits()),
                        vk::QueryPool::from_raw(pool.raw),
                        *query,
                    );
                }
            }
        }
    }
}

impl Device for VulkanDevice {
    fn name(&self) -> String {
        self.gpu.device_name()
    }

    fn info(&self) -> GpuInfo {
        self.gpu.gpu_properties()
    }

    fn queues(&self) -> Vec<QueueHandle> {
        self.gpu
            .queues()
            .iter()
            .enumerate()
            .map(|(slot, q)| QueueHandle {
                slot,
                family: q.family,
                index: q.index,
                supports_timestamps: q.timestamp_valid_bits > 0,
            })
            .collect()
    }

    fn find_memory_type(&self, type_bits: u32, location: MemoryLocation) -> Result<u32> {
        self.gpu
            .find_memory_type_index(type_bits, memory_flags(location))
            .map_err(|_| ComputeError::NoSuitableMemoryType { type_bits, location: location.name() })
    }

    fn create_buffer(&self, size: u64, role: BindingKind, location: MemoryLocation) -> Result<BufferHandle> {
        if size == 0 {
            return Err(ComputeError::Allocation("zero-sized buffer".into()));
        }
        let usage = match role {
            BindingKind::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            BindingKind::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        } | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        let (buffer, memory) = self
            .gpu
            .create_buffer(size, usage, memory_flags(location))
            .map_err(|e| match e {
                VulkanError::NoMemoryType { type_bits } => {
                    ComputeError::NoSuitableMemoryType { type_bits, location: location.name() }
                }
                other => other.into(),
            })?;
        trace!("vk buffer {:#x} ({size} bytes, {location:?})", buffer.as_raw());
        Ok(BufferHandle { raw: buffer.as_raw(), memory: memory.as_raw(), size })
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.gpu
            .destroy_buffer(vk::Buffer::from_raw(buffer.raw), vk::DeviceMemory::from_raw(buffer.memory));
    }

    fn write_mapped(&self, buffer: &BufferHandle, data: &[u8]) -> Result<()> {
        if data.len() as u64 != buffer.size {
            return Err(ComputeError::SizeMismatch { expected: buffer.size as usize, actual: data.len() });
        }
        Ok(self.gpu.write_mapped(vk::DeviceMemory::from_raw(buffer.memory), 0, data)?)
    }

    fn read_mapped(&self, buffer: &BufferHandle, out: &mut [u8]) -> Result<()> {
        if out.len() as u64 != buffer.size {
            return Err(ComputeError::SizeMismatch { expected: buffer.size as usize, actual: out.len() });
        }
        Ok(self.gpu.read_mapped(vk::DeviceMemory::from_raw(buffer.memory), 0, out)?)
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle> {
        let device = self.raw();
        if desc.code.len() % 4 != 0 {
            return Err(ComputeError::Pipeline("SPIR-V binary must be 4-byte aligned".into()));
        }
        let words = octoflow_vulkan::ash::util::read_spv(&mut Cursor::new(desc.code))
            .map_err(|e| ComputeError::Pipeline(format!("bad SPIR-V: {e}")))?;
        let entry = CString::new(desc.entry_point)
            .map_err(|_| ComputeError::Pipeline(format!("bad entry point {:?}", desc.entry_point)))?;

        let module = unsafe {
            device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&words), None)
        }?;

        // One descriptor per buffer, in binding order.
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .layout
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i as u32)
                    .descriptor_type(descriptor_type(*kind))
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let set_layout = match unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                None,
            )
        } {
            Ok(l) => l,
            Err(e) => {
                unsafe { device.destroy_shader_module(module, None) };
                return Err(e.into());
            }
        };

        let set_layouts = [set_layout];
        let push_range = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(desc.push_constant_size)];
        let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if desc.push_constant_size > 0 {
            layout_info = layout_info.push_constant_ranges(&push_range);
        }
        let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(l) => l,
            Err(e) => {
                unsafe {
                    device.destroy_descriptor_set_layout(set_layout, None);
                    device.destroy_shader_module(module, None);
                }
                return Err(e.into());
            }
        };

        let spec_entries: Vec<vk::SpecializationMapEntry> = (0..desc.spec_constants.len())
            .map(|i| {
                vk::SpecializationMapEntry::default()
                    .constant_id(i as u32)
                    .offset((i * 4) as u32)
                    .size(4)
            })
            .collect();
        let spec_data: Vec<u8> = desc.spec_constants.iter().flat_map(|c| c.to_bytes()).collect();
        let spec_info = vk::SpecializationInfo::default().map_entries(&spec_entries).data(&spec_data);

        let mut stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry);
        if !desc.spec_constants.is_empty() {
            stage = stage.specialization_info(&spec_info);
        }
        let info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);

        let pipeline = match unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        } {
            Ok(p) => p[0],
            Err((_, e)) => {
                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                    device.destroy_shader_module(module, None);
                }
                return Err(ComputeError::Pipeline(VulkanError::Vk(e).to_string()));
            }
        };

        debug!(
            "vk pipeline {:#x}: {} bindings, {} spec constants, {} push bytes",
            pipeline.as_raw(),
            desc.layout.len(),
            desc.spec_constants.len(),
            desc.push_constant_size
        );
        Ok(PipelineHandle {
            pipeline: pipeline.as_raw(),
            layout: layout.as_raw(),
            set_layout: set_layout.as_raw(),
            module: module.as_raw(),
        })
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        let device = self.raw();
        unsafe {
            device.destroy_pipeline(vk::Pipeline::from_raw(pipeline.pipeline), None);
            device.destroy_pipeline_layout(vk::PipelineLayout::from_raw(pipeline.layout), None);
            device.destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(pipeline.set_layout), None);
            device.destroy_shader_module(vk::ShaderModule::from_raw(pipeline.module), None);
        }
    }

    fn create_binding_table(
        &self,
        pipeline: &PipelineHandle,
        bindings: &[(BufferHandle, BindingKind)],
    ) -> Result<BindingTableHandle> {
        let device = self.raw();
        let storage = bindings.iter().filter(|(_, k)| *k == BindingKind::Storage).count() as u32;
        let uniform = bindings.len() as u32 - storage;
        let mut sizes = Vec::new();
        if storage > 0 || uniform == 0 {
            sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: storage.max(1),
            });
        }
        if uniform > 0 {
            sizes.push(vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: uniform });
        }
        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default().max_sets(1).pool_sizes(&sizes),
                None,
            )
        }?;

        let layouts = [vk::DescriptorSetLayout::from_raw(pipeline.set_layout)];
        let set = match unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(&layouts),
            )
        } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                return Err(e.into());
            }
        };

        let infos: Vec<[vk::DescriptorBufferInfo; 1]> = bindings
            .iter()
            .map(|(b, _)| {
                [vk::DescriptorBufferInfo::default()
                    .buffer(vk::Buffer::from_raw(b.raw))
                    .offset(0)
                    .range(vk::WHOLE_SIZE)]
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = bindings
            .iter()
            .zip(&infos)
            .enumerate()
            .map(|(i, ((_, kind), info))| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(i as u32)
                    .descriptor_type(descriptor_type(*kind))
                    .buffer_info(info)
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        Ok(BindingTableHandle { pool: pool.as_raw(), set: set.as_raw() })
    }

    fn destroy_binding_table(&self, table: BindingTableHandle) {
        // Destroying the pool frees its set.
        unsafe { self.raw().destroy_descriptor_pool(vk::DescriptorPool::from_raw(table.pool), None) };
    }

    fn create_command_buffer(&self, queue: &QueueHandle) -> Result<CommandBufferHandle> {
        let device = self.raw();
        let pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(queue.family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )
        }?;
        let cmd = match unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        } {
            Ok(cmds) => cmds[0],
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };
        Ok(CommandBufferHandle { pool: pool.as_raw(), raw: cmd.as_raw() })
    }

    fn record(&self, cmd: &CommandBufferHandle, commands: &[Command]) -> Result<()> {
        let device = self.raw();
        let raw = vk::CommandBuffer::from_raw(cmd.raw);
        unsafe {
            device.reset_command_buffer(raw, vk::CommandBufferResetFlags::empty())?;
            // NOT one-time: the recording is replayed by later submits.
            device.begin_command_buffer(raw, &vk::CommandBufferBeginInfo::default())?;
        }
        for command in commands {
            self.record_command(raw, command);
        }
        unsafe { device.end_command_buffer(raw) }?;
        trace!("recorded {} commands into {:#x}", commands.len(), cmd.raw);
        Ok(())
    }

    fn destroy_command_buffer(&self, cmd: CommandBufferHandle) {
        let device = self.raw();
        let pool = vk::CommandPool::from_raw(cmd.pool);
        unsafe {
            device.free_command_buffers(pool, &[vk::CommandBuffer::from_raw(cmd.raw)]);
            device.destroy_command_pool(pool, None);
        }
    }

    fn create_fence(&self) -> Result<FenceHandle> {
        let fence = unsafe { self.raw().create_fence(&vk::FenceCreateInfo::default(), None) }?;
        Ok(FenceHandle(fence.as_raw()))
    }

    fn reset_fence(&self, fence: &FenceHandle) -> Result<()> {
        unsafe { self.raw().reset_fences(&[vk::Fence::from_raw(fence.0)]) }?;
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        unsafe { self.raw().destroy_fence(vk::Fence::from_raw(fence.0), None) };
    }

    fn submit(&self, queue: &QueueHandle, cmd: &CommandBufferHandle, fence: &FenceHandle) -> Result<()> {
        let cmds = [vk::CommandBuffer::from_raw(cmd.raw)];
        let info = vk::SubmitInfo::default().command_buffers(&cmds);
        Ok(self.gpu.queue_submit(queue.slot, &[info], vk::Fence::from_raw(fence.0))?)
    }

    fn wait_fence(&self, fence: &FenceHandle, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.raw().wait_for_fences(&[vk::Fence::from_raw(fence.0)], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn fence_status(&self, fence: &FenceHandle) -> Result<bool> {
        Ok(unsafe { self.raw().get_fence_status(vk::Fence::from_raw(fence.0)) }?)
    }

    fn create_query_pool(&self, queue: &QueueHandle, count: u32) -> Result<QueryPoolHandle> {
        let valid_bits = self
            .gpu
            .queues()
            .get(queue.slot)
            .map(|q| q.timestamp_valid_bits)
            .ok_or_else(|| ComputeError::InvalidResource(format!("no queue in slot {}", queue.slot)))?;
        let pool = unsafe {
            self.raw().create_query_pool(
                &vk::QueryPoolCreateInfo::default()
                    .query_type(vk::QueryType::TIMESTAMP)
                    .query_count(count),
                None,
            )
        }?;
        Ok(QueryPoolHandle { raw: pool.as_raw(), count, valid_bits })
    }

    fn destroy_query_pool(&self, pool: QueryPoolHandle) {
        unsafe { self.raw().destroy_query_pool(vk::QueryPool::from_raw(pool.raw), None) };
    }

    fn query_timestamps(&self, pool: &QueryPoolHandle, first: u32, count: u32) -> Result<Vec<u64>> {
        let mut ticks = vec![0u64; count as usize];
        unsafe {
            self.raw().get_query_pool_results(
                vk::QueryPool::from_raw(pool.raw),
                first,
                &mut ticks,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }?;
        Ok(ticks.into_iter().map(|t| mask_ticks(t, pool.valid_bits)).collect())
    }

    fn timestamp_period(&self) -> f32 {
        self.gpu.timestamp_period()
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.raw().device_wait_idle() }?;
        Ok(())
    }
}
