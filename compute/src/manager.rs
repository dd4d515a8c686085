//! The top-level context: picks a device, hands out resources and tears
//! them down in dependency order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use octoflow_vulkan::GpuInfo;

use crate::algorithm::{Algorithm, AlgorithmSpec};
use crate::buffer::{Buffer, Element, ElementType, MemoryKind};
use crate::config::{BackendKind, ComputeConfig};
use crate::device::{BindingKind, DeviceRef, HostDevice, QueueHandle, VulkanDevice};
use crate::error::{ComputeError, Result};
use crate::registry::{ResourceRegistry, Teardown};
use crate::sequence::Sequence;

pub struct Manager {
    device: DeviceRef,
    config: ComputeConfig,
    registry: Option<ResourceRegistry>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("device", &self.device.name())
            .field("manage_resources", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

fn host_device(config: &ComputeConfig) -> DeviceRef {
    let families = if config.queue_families.is_empty() {
        vec![0; config.host_queue_count()]
    } else {
        config.queue_families.clone()
    };
    Arc::new(HostDevice::with_queues(&families))
}

impl Manager {
    /// Defaults overlaid with the `OCTOFLOW_COMPUTE_*` environment.
    pub fn new() -> Result<Self> {
        Self::with_config(ComputeConfig::from_env()?)
    }

    pub fn with_config(config: ComputeConfig) -> Result<Self> {
        config.validate()?;
        let device: DeviceRef = match config.backend {
            BackendKind::Host => host_device(&config),
            BackendKind::Vulkan => Arc::new(VulkanDevice::new(&config.vulkan_options())?),
            BackendKind::Auto => match VulkanDevice::new(&config.vulkan_options()) {
                Ok(gpu) => Arc::new(gpu),
                Err(e) => {
                    warn!("no usable Vulkan device ({e}), falling back to the host device");
                    host_device(&config)
                }
            },
        };
        info!("compute manager on {}", device.name());
        Ok(Self::build(device, config))
    }

    /// Wrap an existing device. With `manage_resources` off the manager
    /// keeps no registry and `destroy` leaves resources to their owners.
    pub fn from_device(device: DeviceRef, manage_resources: bool) -> Self {
        let config = ComputeConfig { manage_resources, ..ComputeConfig::default() };
        Self::build(device, config)
    }

    fn build(device: DeviceRef, config: ComputeConfig) -> Self {
        let registry = config.manage_resources.then(ResourceRegistry::new);
        Self { device, config, registry, destroyed: AtomicBool::new(false) }
    }

    fn check_live(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ComputeError::InvalidResource("manager was destroyed".into()));
        }
        Ok(())
    }

    fn track_buffer(&self, buffer: Arc<Buffer>) -> Arc<Buffer> {
        if let Some(registry) = &self.registry {
            registry.buffers.register(&buffer);
        }
        buffer
    }

    /// Device-kind storage buffer seeded with `data`.
    pub fn buffer<T: Element>(&self, data: &[T]) -> Result<Arc<Buffer>> {
        self.buffer_with(data, MemoryKind::Device, BindingKind::Storage)
    }

    pub fn buffer_with<T: Element>(&self, data: &[T], kind: MemoryKind, role: BindingKind) -> Result<Arc<Buffer>> {
        self.check_live()?;
        Ok(self.track_buffer(Buffer::from_slice(self.device.clone(), data, kind, role)?))
    }

    pub fn buffer_bytes(
        &self,
        data: &[u8],
        element_type: ElementType,
        kind: MemoryKind,
        role: BindingKind,
    ) -> Result<Arc<Buffer>> {
        self.check_live()?;
        Ok(self.track_buffer(Buffer::new(self.device.clone(), data, element_type, kind, role)?))
    }

    pub fn buffer_zeroed(
        &self,
        len: usize,
        element_type: ElementType,
        kind: MemoryKind,
        role: BindingKind,
    ) -> Result<Arc<Buffer>> {
        self.check_live()?;
        Ok(self.track_buffer(Buffer::zeroed(self.device.clone(), len, element_type, kind, role)?))
    }

    pub fn algorithm(&self, spec: AlgorithmSpec) -> Result<Arc<Algorithm>> {
        self.check_live()?;
        let algorithm = spec.build(self.device.clone())?;
        if let Some(registry) = &self.registry {
            registry.algorithms.register(&algorithm);
        }
        Ok(algorithm)
    }

    /// A sequence on the first queue without timestamps.
    pub fn sequence(&self) -> Result<Arc<Sequence>> {
        self.sequence_on(0, 0)
    }

    /// A sequence on queue `queue_index` with room for `timestamps` queries.
    pub fn sequence_on(&self, queue_index: usize, timestamps: u32) -> Result<Arc<Sequence>> {
        self.check_live()?;
        let queues = self.device.queues();
        let queue = *queues.get(queue_index).ok_or_else(|| {
            ComputeError::InvalidResource(format!(
                "queue {queue_index} out of range ({} queues)",
                queues.len()
            ))
        })?;
        let sequence = Sequence::new(self.device.clone(), queue, timestamps)?;
        if let Some(registry) = &self.registry {
            registry.sequences.register(&sequence);
        }
        Ok(sequence)
    }

    /// Forget registry entries whose resources are already gone.
    pub fn clear(&self) -> usize {
        self.registry.as_ref().map_or(0, |r| r.sweep_expired())
    }

    /// Destroy every managed resource (sequences, then algorithms, then
    /// buffers) and wait for the device to go idle. Safe to call twice.
    pub fn destroy(&self) -> Teardown {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Teardown::default();
        }
        let teardown = self.registry.as_ref().map(|r| r.destroy_all()).unwrap_or_default();
        if let Err(e) = self.device.wait_idle() {
            warn!("wait idle during teardown failed: {e}");
        }
        debug!("manager destroyed: {teardown:?}");
        teardown
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn device_name(&self) -> String {
        self.device.name()
    }

    /// Device type, API version and compute limits.
    pub fn device_info(&self) -> GpuInfo {
        self.device.info()
    }

    pub fn queues(&self) -> Vec<QueueHandle> {
        self.device.queues()
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    pub fn registry(&self) -> Option<&ResourceRegistry> {
        self.registry.as_ref()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.destroy();
    }
}
