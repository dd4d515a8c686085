//! Buffer allocation, memory type selection, and host ↔ device transfers.

use ash::vk;

use crate::device::{VulkanCompute, VulkanError};

impl VulkanCompute {
    /// Find a memory type index satisfying the type filter and required property flags.
    pub fn find_memory_type_index(
        &self,
        type_filter: u32,
        required_flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, VulkanError> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|(i, ty)| {
                (type_filter & (1 << i)) != 0 && ty.property_flags.contains(required_flags)
            })
            .map(|(i, _)| i as u32)
            .ok_or(VulkanError::NoMemoryType { type_bits: type_filter })
    }

    /// Create a buffer with dedicated device memory.
    ///
    /// Returns `(buffer, device_memory)`. Anything created before a failure
    /// is released before the error returns.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, vk::DeviceMemory), VulkanError> {
        let device = self.device();
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_type_index =
            match self.find_memory_type_index(requirements.memory_type_bits, memory_flags) {
                Ok(index) => index,
                Err(e) => {
                    unsafe { device.destroy_buffer(buffer, None) };
                    return Err(e);
                }
            };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(e.into());
        }

        Ok((buffer, memory))
    }

    pub fn destroy_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) {
        unsafe {
            self.device().destroy_buffer(buffer, None);
            self.device().free_memory(memory, None);
        }
    }

    /// Copy bytes into a HOST_VISIBLE | HOST_COHERENT allocation.
    pub fn write_mapped(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), VulkanError> {
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            let ptr = self
                .device()
                .map_memory(memory, offset, data.len() as vk::DeviceSize, vk::MemoryMapFlags::empty())
                .map_err(|_| VulkanError::MapFailed)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
            self.device().unmap_memory(memory);
        }
        Ok(())
    }

    /// Copy bytes out of a HOST_VISIBLE | HOST_COHERENT allocation.
    pub fn read_mapped(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        out: &mut [u8],
    ) -> Result<(), VulkanError> {
        if out.is_empty() {
            return Ok(());
        }
        unsafe {
            let ptr = self
                .device()
                .map_memory(memory, offset, out.len() as vk::DeviceSize, vk::MemoryMapFlags::empty())
                .map_err(|_| VulkanError::MapFailed)?;
            std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), out.len());
            self.device().unmap_memory(memory);
        }
        Ok(())
    }
}
