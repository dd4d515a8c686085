//! Vulkan instance creation, physical device selection, and logical device setup.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::sync::Mutex;

use ash::vk;
use log::{debug, info, warn};

/// Error type for Vulkan operations.
#[derive(Debug, thiserror::Error)]
pub enum VulkanError {
    /// The Vulkan loader library could not be opened.
    #[error("Vulkan loader unavailable: {0}")]
    Loader(String),
    /// Vulkan API returned an error code.
    #[error("Vulkan error: {}", describe(*.0))]
    Vk(vk::Result),
    /// No Vulkan-capable GPU found.
    #[error("No Vulkan-capable GPU found")]
    NoGpu,
    /// The configured physical device index is out of range.
    #[error("GPU index {index} out of range ({count} devices)")]
    DeviceIndex { index: usize, count: usize },
    /// No compute queue family found.
    #[error("No compute queue family found")]
    NoComputeQueue,
    /// A requested queue family is missing, lacks compute support, or is oversubscribed.
    #[error("queue family {family}: {reason}")]
    QueueFamily { family: u32, reason: String },
    /// No suitable memory type found.
    #[error("No suitable memory type for filter {type_bits:#x}")]
    NoMemoryType { type_bits: u32 },
    /// Buffer mapping failed.
    #[error("Failed to map device memory")]
    MapFailed,
    /// General error with description.
    #[error("{0}")]
    Other(String),
}

fn describe(code: vk::Result) -> String {
    match code {
        vk::Result::ERROR_DEVICE_LOST => format!("{code} ({}), GPU device lost", code.as_raw()),
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            format!("{code} ({}), GPU out of memory", code.as_raw())
        }
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            format!("{code} ({}), host out of memory", code.as_raw())
        }
        _ => format!("{code} ({})", code.as_raw()),
    }
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        VulkanError::Vk(result)
    }
}

/// What to ask of the driver when bringing up a device.
#[derive(Debug, Clone, Default)]
pub struct VulkanOptions {
    /// Physical device index. `None` prefers the first discrete GPU.
    pub device_index: Option<usize>,
    /// One queue is created per entry. Repeating a family asks for the next
    /// queue within it. Empty means one queue on the first compute family.
    pub queue_families: Vec<u32>,
    /// Instance layers to enable when present (e.g. `VK_LAYER_KHRONOS_validation`).
    pub layers: Vec<String>,
    /// Device extensions to enable.
    pub extensions: Vec<String>,
}

/// A queue created on the logical device.
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    pub family: u32,
    pub index: u32,
    pub queue: vk::Queue,
    /// Zero means the family cannot write timestamps.
    pub timestamp_valid_bits: u32,
}

/// Manages a Vulkan instance, physical device, logical device, and compute queues.
pub struct VulkanCompute {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queues: Vec<QueueInfo>,
    queue_locks: Vec<Mutex<()>>,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: vk::PhysicalDeviceProperties,
    /// True if the GPU supports 64-bit integer arithmetic (shaderInt64).
    pub supports_int64: bool,
}

impl VulkanCompute {
    /// Initialize Vulkan with defaults: first discrete GPU, one compute queue.
    pub fn new() -> Result<Self, VulkanError> {
        Self::with_options(&VulkanOptions::default())
    }

    /// Initialize Vulkan: create instance, pick GPU, create device and queues.
    pub fn with_options(options: &VulkanOptions) -> Result<Self, VulkanError> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| VulkanError::Loader(e.to_string()))?;

        let layers = available_layers(&entry, &options.layers)?;
        let layer_ptrs: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"octoflow-compute")
            .application_version(vk::make_api_version(0, 0, 3, 0))
            .engine_name(c"octoflow")
            .engine_version(vk::make_api_version(0, 0, 3, 0))
            .api_version(vk::make_api_version(0, 1, 1, 0));

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|_| VulkanError::NoGpu)?;

        // Past this point every failure must tear the instance down.
        match unsafe { Self::create_device(&instance, options) } {
            Ok((physical_device, device, queues, supports_int64)) => {
                let memory_properties =
                    unsafe { instance.get_physical_device_memory_properties(physical_device) };
                let properties = unsafe { instance.get_physical_device_properties(physical_device) };
                let queue_locks = queues.iter().map(|_| Mutex::new(())).collect();
                let compute = Self {
                    _entry: entry,
                    instance,
                    physical_device,
                    device,
                    queues,
                    queue_locks,
                    memory_properties,
                    properties,
                    supports_int64,
                };
                info!(
                    "vulkan device ready: {} ({} queues)",
                    compute.device_name(),
                    compute.queues.len()
                );
                Ok(compute)
            }
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    unsafe fn create_device(
        instance: &ash::Instance,
        options: &VulkanOptions,
    ) -> Result<(vk::PhysicalDevice, ash::Device, Vec<QueueInfo>, bool), VulkanError> {
        let physical_devices = instance.enumerate_physical_devices()?;
        if physical_devices.is_empty() {
            return Err(VulkanError::NoGpu);
        }

        let physical_device = match options.device_index {
            Some(index) => *physical_devices.get(index).ok_or(VulkanError::DeviceIndex {
                index,
                count: physical_devices.len(),
            })?,
            // Prefer discrete GPU, fall back to first device
            None => physical_devices
                .iter()
                .copied()
                .find(|&pd| {
                    instance.get_physical_device_properties(pd).device_type
                        == vk::PhysicalDeviceType::DISCRETE_GPU
                })
                .unwrap_or(physical_devices[0]),
        };

        let families = instance.get_physical_device_queue_family_properties(physical_device);

        let requested: Vec<u32> = if options.queue_families.is_empty() {
            let family = families
                .iter()
                .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
                .ok_or(VulkanError::NoComputeQueue)?;
            vec![family as u32]
        } else {
            options.queue_families.clone()
        };

        // Repeated families take consecutive queue indices within that family.
        let mut per_family: BTreeMap<u32, u32> = BTreeMap::new();
        let mut slots = Vec::with_capacity(requested.len());
        for &family in &requested {
            let props = families.get(family as usize).ok_or_else(|| VulkanError::QueueFamily {
                family,
                reason: format!("device exposes {} families", families.len()),
            })?;
            if !props.queue_flags.contains(vk::QueueFlags::COMPUTE) {
                return Err(VulkanError::QueueFamily {
                    family,
                    reason: "no compute support".into(),
                });
            }
            let next = per_family.entry(family).or_insert(0);
            if *next >= props.queue_count {
                return Err(VulkanError::QueueFamily {
                    family,
                    reason: format!("only {} queues available", props.queue_count),
                });
            }
            slots.push((family, *next, props.timestamp_valid_bits));
            *next += 1;
        }

        let priorities: Vec<(u32, Vec<f32>)> = per_family
            .iter()
            .map(|(&family, &count)| (family, vec![1.0f32; count as usize]))
            .collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = priorities
            .iter()
            .map(|(family, prio)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(*family)
                    .queue_priorities(prio)
            })
            .collect();

        let extensions: Vec<CString> = options
            .extensions
            .iter()
            .map(|e| CString::new(e.as_str()).map_err(|_| VulkanError::Other(format!("bad extension name {e:?}"))))
            .collect::<Result<_, _>>()?;
        let extension_ptrs: Vec<*const std::ffi::c_char> = extensions.iter().map(|e| e.as_ptr()).collect();

        let supported = instance.get_physical_device_features(physical_device);
        let supports_int64 = supported.shader_int64 == vk::TRUE;
        let features = vk::PhysicalDeviceFeatures::default().shader_int64(supports_int64);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features);

        let device = instance.create_device(physical_device, &device_info, None)?;

        let queues = slots
            .into_iter()
            .map(|(family, index, timestamp_valid_bits)| QueueInfo {
                family,
                index,
                queue: device.get_device_queue(family, index),
                timestamp_valid_bits,
            })
            .collect();

        Ok((physical_device, device, queues, supports_int64))
    }

    /// Thread-safe queue submission. Holds the queue's lock during vkQueueSubmit.
    pub fn queue_submit(
        &self,
        slot: usize,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        let queue = self.queues.get(slot).ok_or_else(|| {
            VulkanError::Other(format!("queue slot {slot} out of range"))
        })?;
        let _lock = self.queue_locks[slot].lock().unwrap_or_else(|p| p.into_inner());
        unsafe { self.device.queue_submit(queue.queue, submits, fence) }.map_err(VulkanError::Vk)
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queues(&self) -> &[QueueInfo] {
        &self.queues
    }

    /// Nanoseconds per timestamp tick.
    pub fn timestamp_period(&self) -> f32 {
        self.properties.limits.timestamp_period
    }

    /// Return the GPU device name.
    pub fn device_name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into())
    }

    /// Return GPU device properties.
    pub fn gpu_properties(&self) -> GpuInfo {
        let props = &self.properties;
        let device_type = match props.device_type {
            vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
            vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
            vk::PhysicalDeviceType::CPU => "cpu",
            vk::PhysicalDeviceType::OTHER => "other",
            _ => "unknown",
        };
        GpuInfo {
            name: self.device_name(),
            device_type: device_type.to_string(),
            api_version_major: vk::api_version_major(props.api_version),
            api_version_minor: vk::api_version_minor(props.api_version),
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            max_compute_workgroup_size: props.limits.max_compute_work_group_size,
            max_compute_workgroup_invocations: props.limits.max_compute_work_group_invocations,
            max_storage_buffer_range: props.limits.max_storage_buffer_range,
            max_compute_shared_memory: props.limits.max_compute_shared_memory_size,
            timestamp_period: props.limits.timestamp_period,
            supports_int64: self.supports_int64,
        }
    }
}

/// Keep the requested layers the loader actually has; warn about the rest.
fn available_layers(entry: &ash::Entry, wanted: &[String]) -> Result<Vec<CString>, VulkanError> {
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let present = unsafe { entry.enumerate_instance_layer_properties() }?;
    let names: Vec<&CStr> = present
        .iter()
        .filter_map(|p| p.layer_name_as_c_str().ok())
        .collect();

    let mut enabled = Vec::new();
    for layer in wanted {
        let c = CString::new(layer.as_str())
            .map_err(|_| VulkanError::Other(format!("bad layer name {layer:?}")))?;
        if names.iter().any(|n| *n == c.as_c_str()) {
            debug!("enabling instance layer {layer}");
            enabled.push(c);
        } else {
            warn!("instance layer {layer} not available, skipping");
        }
    }
    Ok(enabled)
}

/// GPU device information.
#[derive(Debug, Clone)]
pub struct GpuInfo {
    pub name: String,
    pub device_type: String,
    pub api_version_major: u32,
    pub api_version_minor: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub max_compute_workgroup_size: [u32; 3],
    pub max_compute_workgroup_invocations: u32,
    pub max_storage_buffer_range: u32,
    pub max_compute_shared_memory: u32,
    pub timestamp_period: f32,
    pub supports_int64: bool,
}

impl Drop for VulkanCompute {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
