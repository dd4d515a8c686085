//! Buffers: a host-visible staging allocation and a device-local primary,
//! and the bookkeeping of which one holds the current data.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytemuck::Pod;
use log::{debug, trace};

use crate::command::{Access, Command, CommandRecorder, PipelineStage};
use crate::device::{BindingKind, BufferHandle, DeviceRef, MemoryLocation};
use crate::error::{ComputeError, Result};
use crate::registry::Destroy;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Element type tag carried by every buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Caller-defined element of `size` bytes.
    Opaque { size: usize },
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::Bool | ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
            ElementType::Opaque { size } => size,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::Opaque { size } => write!(f, "opaque({size})"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// Plain-old-data types that map to an [`ElementType`].
pub trait Element: Pod {
    const TYPE: ElementType;
}

macro_rules! element {
    ($($t:ty => $e:ident),* $(,)?) => {
        $(impl Element for $t {
            const TYPE: ElementType = ElementType::$e;
        })*
    };
}

element! {
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64,
}

/// Which allocations a buffer owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Device-local primary plus host-visible staging.
    Device,
    /// Host-visible primary only; no staging.
    Host,
    /// Device-local primary only; the host can never see the data.
    Storage,
}

/// Which side holds the current data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Authority {
    Host,
    Device,
}

/// The allocation a barrier applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BarrierTarget {
    #[default]
    Primary,
    Staging,
}

struct BufferState {
    primary: Option<BufferHandle>,
    staging: Option<BufferHandle>,
    authority: Authority,
    destroyed: bool,
}

pub struct Buffer {
    id: u64,
    device: DeviceRef,
    len: usize,
    element_type: ElementType,
    kind: MemoryKind,
    role: BindingKind,
    state: Mutex<BufferState>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("element_type", &self.element_type)
            .field("kind", &self.kind)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    /// Allocate a buffer holding `data` (raw bytes, a whole number of
    /// `element_type` elements). `Storage` buffers cannot be seeded from
    /// the host, so their data must be all zero.
    pub fn new(
        device: DeviceRef,
        data: &[u8],
        element_type: ElementType,
        kind: MemoryKind,
        role: BindingKind,
    ) -> Result<Arc<Self>> {
        let elem = element_type.size();
        if elem == 0 || data.len() % elem != 0 {
            return Err(ComputeError::SizeMismatch {
                expected: (data.len() / elem.max(1)) * elem.max(1),
                actual: data.len(),
            });
        }
        if kind == MemoryKind::Storage && data.iter().any(|b| *b != 0) {
            return Err(ComputeError::NotAllocated(
                "storage buffers have no host-visible memory to seed".into(),
            ));
        }
        let buffer = Self::allocate(device, data.len() / elem, element_type, kind, role)?;
        if kind != MemoryKind::Storage {
            buffer.write_host(data)?;
        }
        Ok(buffer)
    }

    /// Allocate `len` zeroed elements.
    pub fn zeroed(
        device: DeviceRef,
        len: usize,
        element_type: ElementType,
        kind: MemoryKind,
        role: BindingKind,
    ) -> Result<Arc<Self>> {
        Self::allocate(device, len, element_type, kind, role)
    }

    /// Typed constructor; the element type tag comes from `T`.
    pub fn from_slice<T: Element>(
        device: DeviceRef,
        data: &[T],
        kind: MemoryKind,
        role: BindingKind,
    ) -> Result<Arc<Self>> {
        Self::new(device, bytemuck::cast_slice(data), T::TYPE, kind, role)
    }

    fn allocate(
        device: DeviceRef,
        len: usize,
        element_type: ElementType,
        kind: MemoryKind,
        role: BindingKind,
    ) -> Result<Arc<Self>> {
        let size = (len * element_type.size()) as u64;
        let primary_location = match kind {
            MemoryKind::Host => MemoryLocation::HostVisible,
            MemoryKind::Device | MemoryKind::Storage => MemoryLocation::DeviceLocal,
        };
        let primary = device.create_buffer(size, role, primary_location)?;
        let staging = if kind == MemoryKind::Device {
            match device.create_buffer(size, role, MemoryLocation::HostVisible) {
                Ok(s) => Some(s),
                Err(e) => {
                    device.destroy_buffer(primary);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        debug!("buffer #{id}: {len} x {element_type} ({size} bytes), {kind:?}, {role:?}");
        Ok(Arc::new(Self {
            id,
            device,
            len,
            element_type,
            kind,
            role,
            state: Mutex::new(BufferState {
                primary: Some(primary),
                staging,
                authority: if kind == MemoryKind::Storage { Authority::Device } else { Authority::Host },
                destroyed: false,
            }),
        }))
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_state(&self) -> Result<MutexGuard<'_, BufferState>> {
        let state = self.state();
        if state.destroyed {
            return Err(ComputeError::InvalidResource(format!("buffer #{} was destroyed", self.id)));
        }
        Ok(state)
    }

    /// The host-visible allocation, if this buffer has one.
    fn host_side(&self, state: &BufferState) -> Option<BufferHandle> {
        match self.kind {
            MemoryKind::Device => state.staging,
            MemoryKind::Host => state.primary,
            MemoryKind::Storage => None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len * self.element_type.size()
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn role(&self) -> BindingKind {
        self.role
    }

    pub fn authority(&self) -> Authority {
        self.state().authority
    }

    pub fn is_allocated(&self) -> bool {
        let state = self.state();
        !state.destroyed && state.primary.is_some()
    }

    pub(crate) fn primary(&self) -> Result<BufferHandle> {
        self.live_state()?
            .primary
            .ok_or_else(|| ComputeError::NotAllocated(format!("buffer #{} has no primary", self.id)))
    }

    /// Overwrite the host-visible copy. The host becomes authoritative.
    pub fn write_host(&self, data: &[u8]) -> Result<()> {
        let mut state = self.live_state()?;
        let host = self.host_side(&state).ok_or_else(|| {
            ComputeError::NotAllocated(format!("buffer #{} has no host-visible memory", self.id))
        })?;
        if data.len() != self.byte_len() {
            return Err(ComputeError::SizeMismatch { expected: self.byte_len(), actual: data.len() });
        }
        self.device.write_mapped(&host, data)?;
        state.authority = Authority::Host;
        Ok(())
    }

    /// Read the host-visible copy.
    ///
    /// When the device holds newer data (a `SyncLocal` has not completed
    /// yet) this returns the older host copy.
    pub fn read_host(&self) -> Result<Vec<u8>> {
        let state = self.live_state()?;
        let host = self.host_side(&state).ok_or_else(|| {
            ComputeError::NotAllocated(format!("buffer #{} has no host-visible memory", self.id))
        })?;
        if state.authority == Authority::Device {
            debug!("buffer #{}: host read while device copy is authoritative; data may be stale", self.id);
        }
        let mut out = vec![0u8; self.byte_len()];
        self.device.read_mapped(&host, &mut out)?;
        Ok(out)
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::TYPE != self.element_type {
            return Err(ComputeError::TypeMismatch {
                stored: self.element_type.to_string(),
                requested: T::TYPE.to_string(),
            });
        }
        Ok(())
    }

    pub fn write<T: Element>(&self, data: &[T]) -> Result<()> {
        self.check_type::<T>()?;
        self.write_host(bytemuck::cast_slice(data))
    }

    pub fn read<T: Element>(&self) -> Result<Vec<T>> {
        self.check_type::<T>()?;
        let bytes = self.read_host()?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    fn both_sides(&self) -> Result<(BufferHandle, BufferHandle)> {
        let state = self.live_state()?;
        match (state.staging, state.primary) {
            (Some(staging), Some(primary)) => Ok((staging, primary)),
            _ => Err(ComputeError::NotAllocated(format!(
                "buffer #{} ({:?}) needs both staging and primary memory for a transfer",
                self.id, self.kind
            ))),
        }
    }

    /// Record staging → primary followed by a barrier that makes the copy
    /// visible to later shaders and later transfers.
    pub fn record_sync_to_device(&self, rec: &mut CommandRecorder) -> Result<()> {
        let (staging, primary) = self.both_sides()?;
        rec.push(Command::CopyBuffer { src: staging, dst: primary, size: primary.size });
        rec.push(Command::Barrier {
            buffers: vec![primary],
            src_access: Access::TRANSFER_WRITE,
            dst_access: Access::SHADER_READ | Access::SHADER_WRITE | Access::TRANSFER_READ,
            src_stage: PipelineStage::TRANSFER,
            dst_stage: PipelineStage::COMPUTE_SHADER | PipelineStage::TRANSFER,
        });
        trace!("buffer #{}: recorded sync to device", self.id);
        Ok(())
    }

    /// Record a barrier after any shader or transfer write, primary → staging,
    /// then the transfer → host barrier.
    pub fn record_sync_to_local(&self, rec: &mut CommandRecorder) -> Result<()> {
        let (staging, primary) = self.both_sides()?;
        rec.push(Command::Barrier {
            buffers: vec![primary],
            src_access: Access::SHADER_WRITE | Access::TRANSFER_WRITE,
            dst_access: Access::TRANSFER_READ,
            src_stage: PipelineStage::COMPUTE_SHADER | PipelineStage::TRANSFER,
            dst_stage: PipelineStage::TRANSFER,
        });
        rec.push(Command::CopyBuffer { src: primary, dst: staging, size: primary.size });
        rec.push(Command::Barrier {
            buffers: vec![staging],
            src_access: Access::TRANSFER_WRITE,
            dst_access: Access::HOST_READ,
            src_stage: PipelineStage::TRANSFER,
            dst_stage: PipelineStage::HOST,
        });
        trace!("buffer #{}: recorded sync to local", self.id);
        Ok(())
    }

    /// Record a primary → primary copy from `src` into this buffer, fenced on
    /// both sides: earlier writes to `src` finish before the copy reads it, and
    /// the copied bytes are visible to later shaders and transfers.
    pub fn record_copy_from(&self, src: &Buffer, rec: &mut CommandRecorder) -> Result<()> {
        if src.byte_len() != self.byte_len() {
            return Err(ComputeError::SizeMismatch { expected: self.byte_len(), actual: src.byte_len() });
        }
        // Take each lock on its own so two buffers are never held together.
        let from = src.primary()?;
        let to = self.primary()?;
        if from.raw == to.raw {
            debug!("buffer #{}: copy onto itself skipped", self.id);
            return Ok(());
        }
        rec.push(Command::Barrier {
            buffers: vec![from],
            src_access: Access::SHADER_WRITE | Access::TRANSFER_WRITE,
            dst_access: Access::TRANSFER_READ,
            src_stage: PipelineStage::COMPUTE_SHADER | PipelineStage::TRANSFER,
            dst_stage: PipelineStage::TRANSFER,
        });
        rec.push(Command::CopyBuffer { src: from, dst: to, size: to.size });
        rec.push(Command::Barrier {
            buffers: vec![to],
            src_access: Access::TRANSFER_WRITE,
            dst_access: Access::SHADER_READ | Access::SHADER_WRITE | Access::TRANSFER_READ,
            src_stage: PipelineStage::TRANSFER,
            dst_stage: PipelineStage::COMPUTE_SHADER | PipelineStage::TRANSFER,
        });
        Ok(())
    }

    pub fn record_barrier(
        &self,
        rec: &mut CommandRecorder,
        target: BarrierTarget,
        src_access: Access,
        dst_access: Access,
        src_stage: PipelineStage,
        dst_stage: PipelineStage,
    ) -> Result<()> {
        let state = self.live_state()?;
        let handle = match target {
            BarrierTarget::Primary => state.primary,
            BarrierTarget::Staging => state.staging,
        }
        .ok_or_else(|| ComputeError::NotAllocated(format!("buffer #{} has no {target:?} memory", self.id)))?;
        rec.push(Command::Barrier { buffers: vec![handle], src_access, dst_access, src_stage, dst_stage });
        Ok(())
    }

    /// After device work wrote the primary. Host buffers stay host-authoritative
    /// because their primary is host memory.
    pub(crate) fn mark_device_written(&self) {
        let mut state = self.state();
        state.authority = match self.kind {
            MemoryKind::Host => Authority::Host,
            MemoryKind::Device | MemoryKind::Storage => Authority::Device,
        };
    }

    pub(crate) fn mark_host_synced(&self) {
        self.state().authority = Authority::Host;
    }

    /// Release both allocations. Safe to call more than once.
    pub fn destroy(&self) {
        let mut state = self.state();
        if state.destroyed {
            return;
        }
        if let Some(primary) = state.primary.take() {
            self.device.destroy_buffer(primary);
        }
        if let Some(staging) = state.staging.take() {
            self.device.destroy_buffer(staging);
        }
        state.destroyed = true;
        debug!("buffer #{} destroyed", self.id);
    }
}

impl Destroy for Buffer {
    fn destroy(&self) {
        Buffer::destroy(self)
    }

    fn is_alive(&self) -> bool {
        self.is_allocated()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, HostDevice};

    fn host() -> (Arc<HostDevice>, DeviceRef) {
        let _ = env_logger::builder().is_test(true).try_init();
        let dev = Arc::new(HostDevice::new());
        let dyn_dev: DeviceRef = dev.clone();
        (dev, dyn_dev)
    }

    #[test]
    fn test_write_read_host() {
        let (_, dev) = host();
        let b = Buffer::from_slice(dev, &[1.0f32, 2.0, 3.0], MemoryKind::Device, BindingKind::Storage).unwrap();
        assert_eq!(b.len(), 3);
        assert_eq!(b.byte_len(), 12);
        assert_eq!(b.read::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
        b.write(&[4.0f32, 5.0, 6.0]).unwrap();
        assert_eq!(b.read::<f32>().unwrap(), vec![4.0, 5.0, 6.0]);
        assert_eq!(b.authority(), Authority::Host);
    }

    #[test]
    fn test_write_size_and_type_checked() {
        let (_, dev) = host();
        let b = Buffer::from_slice(dev, &[1u32, 2, 3], MemoryKind::Device, BindingKind::Storage).unwrap();
        assert!(matches!(
            b.write_host(&[0u8; 8]),
            Err(ComputeError::SizeMismatch { expected: 12, actual: 8 })
        ));
        assert!(matches!(b.read::<f32>(), Err(ComputeError::TypeMismatch { .. })));
        assert!(matches!(b.write(&[1i32, 2, 3]), Err(ComputeError::TypeMismatch { .. })));
    }

    #[test]
    fn test_ragged_data_rejected() {
        let (_, dev) = host();
        let err = Buffer::new(dev, &[0u8; 6], ElementType::U32, MemoryKind::Device, BindingKind::Storage)
            .unwrap_err();
        assert!(matches!(err, ComputeError::SizeMismatch { expected: 4, actual: 6 }));
    }

    #[test]
    fn test_destroy_idempotent() {
        let (host, dev) = host();
        let b = Buffer::from_slice(dev, &[1u32; 4], MemoryKind::Device, BindingKind::Storage).unwrap();
        assert_eq!(host.live_counts().buffers, 2);
        b.destroy();
        b.destroy();
        assert!(!b.is_allocated());
        assert_eq!(host.live_counts().buffers, 0);
        assert!(matches!(b.read_host(), Err(ComputeError::InvalidResource(_))));
        let mut rec = CommandRecorder::new();
        assert!(matches!(b.record_sync_to_device(&mut rec), Err(ComputeError::InvalidResource(_))));
        assert!(rec.is_empty());
    }

    #[test]
    fn test_drop_releases_memory() {
        let (host, dev) = host();
        let b = Buffer::from_slice(dev, &[1u32; 4], MemoryKind::Device, BindingKind::Storage).unwrap();
        drop(b);
        assert_eq!(host.live_counts().buffers, 0);
    }

    #[test]
    fn test_single_sided_buffers_cannot_sync() {
        let (_, dev) = host();
        let h = Buffer::from_slice(dev.clone(), &[1u32; 4], MemoryKind::Host, BindingKind::Storage).unwrap();
        let s = Buffer::zeroed(dev, 4, ElementType::U32, MemoryKind::Storage, BindingKind::Storage).unwrap();
        let mut rec = CommandRecorder::new();
        assert!(matches!(h.record_sync_to_device(&mut rec), Err(ComputeError::NotAllocated(_))));
        assert!(matches!(s.record_sync_to_local(&mut rec), Err(ComputeError::NotAllocated(_))));
        assert!(matches!(s.read_host(), Err(ComputeError::NotAllocated(_))));
        assert!(rec.is_empty());
        assert_eq!(h.read::<u32>().unwrap(), vec![1; 4]);
    }

    #[test]
    fn test_storage_cannot_be_seeded() {
        let (_, dev) = host();
        let err = Buffer::from_slice(dev, &[1u32], MemoryKind::Storage, BindingKind::Storage).unwrap_err();
        assert!(matches!(err, ComputeError::NotAllocated(_)));
    }

    #[test]
    fn test_failed_staging_releases_primary() {
        let host = Arc::new(HostDevice::with_memory_types(&[0], &[MemoryLocation::DeviceLocal]));
        let dev: DeviceRef = host.clone();
        let err = Buffer::from_slice(dev, &[1u32; 4], MemoryKind::Device, BindingKind::Storage).unwrap_err();
        assert!(matches!(err, ComputeError::NoSuitableMemoryType { .. }));
        assert_eq!(host.live_counts().buffers, 0);
    }

    #[test]
    fn test_sync_records_copy_and_barriers() {
        let (_, dev) = host();
        let b = Buffer::from_slice(dev, &[1u32; 4], MemoryKind::Device, BindingKind::Storage).unwrap();
        let mut rec = CommandRecorder::new();
        b.record_sync_to_device(&mut rec).unwrap();
        b.record_sync_to_local(&mut rec).unwrap();
        let kinds: Vec<&str> = rec
            .commands()
            .iter()
            .map(|c| match c {
                Command::CopyBuffer { .. } => "copy",
                Command::Barrier { .. } => "barrier",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, ["copy", "barrier", "barrier", "copy", "barrier"]);
        match &rec.commands()[4] {
            Command::Barrier { dst_access, dst_stage, .. } => {
                assert_eq!(*dst_access, Access::HOST_READ);
                assert_eq!(*dst_stage, PipelineStage::HOST);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_transfer_barriers_cover_transfer_stage() {
        let (_, dev) = host();
        let a = Buffer::from_slice(dev.clone(), &[1u32; 4], MemoryKind::Device, BindingKind::Storage).unwrap();
        let b = Buffer::zeroed(dev, 4, ElementType::U32, MemoryKind::Device, BindingKind::Storage).unwrap();
        let (a_primary, b_primary) = (a.primary().unwrap(), b.primary().unwrap());

        let mut rec = CommandRecorder::new();
        a.record_sync_to_device(&mut rec).unwrap();
        match &rec.commands()[1] {
            Command::Barrier { src_access, dst_access, src_stage, dst_stage, .. } => {
                assert_eq!(*src_access, Access::TRANSFER_WRITE);
                assert!(dst_access.contains(Access::SHADER_READ | Access::TRANSFER_READ));
                assert_eq!(*src_stage, PipelineStage::TRANSFER);
                assert!(dst_stage.contains(PipelineStage::COMPUTE_SHADER | PipelineStage::TRANSFER));
            }
            other => panic!("unexpected {other:?}"),
        }

        rec.clear();
        a.record_sync_to_local(&mut rec).unwrap();
        match &rec.commands()[0] {
            Command::Barrier { src_access, src_stage, .. } => {
                assert!(src_access.contains(Access::SHADER_WRITE | Access::TRANSFER_WRITE));
                assert!(src_stage.contains(PipelineStage::COMPUTE_SHADER | PipelineStage::TRANSFER));
            }
            other => panic!("unexpected {other:?}"),
        }

        rec.clear();
        b.record_copy_from(&a, &mut rec).unwrap();
        assert_eq!(rec.len(), 3);
        match &rec.commands()[0] {
            Command::Barrier { buffers, dst_access, dst_stage, .. } => {
                assert_eq!(buffers, &vec![a_primary]);
                assert_eq!(*dst_access, Access::TRANSFER_READ);
                assert_eq!(*dst_stage, PipelineStage::TRANSFER);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&rec.commands()[1], Command::CopyBuffer { src, dst, .. } if *src == a_primary && *dst == b_primary));
        match &rec.commands()[2] {
            Command::Barrier { buffers, src_access, dst_access, src_stage, dst_stage } => {
                assert_eq!(buffers, &vec![b_primary]);
                assert_eq!(*src_access, Access::TRANSFER_WRITE);
                assert!(dst_access.contains(Access::TRANSFER_READ | Access::SHADER_READ));
                assert_eq!(*src_stage, PipelineStage::TRANSFER);
                assert!(dst_stage.contains(PipelineStage::TRANSFER | PipelineStage::COMPUTE_SHADER));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_copy_size_mismatch_records_nothing() {
        let (_, dev) = host();
        let a = Buffer::from_slice(dev.clone(), &[1u32; 4], MemoryKind::Device, BindingKind::Storage).unwrap();
        let b = Buffer::from_slice(dev, &[1u32; 3], MemoryKind::Device, BindingKind::Storage).unwrap();
        let mut rec = CommandRecorder::new();
        assert!(matches!(
            b.record_copy_from(&a, &mut rec),
            Err(ComputeError::SizeMismatch { expected: 12, actual: 16 })
        ));
        assert!(rec.is_empty());
    }

    #[test]
    fn test_element_type_display() {
        assert_eq!(ElementType::F32.to_string(), "f32");
        assert_eq!(ElementType::Opaque { size: 12 }.to_string(), "opaque(12)");
        assert_eq!(ElementType::Opaque { size: 12 }.size(), 12);
    }

    #[test]
    fn test_memory_query_through_dyn_device() {
        let (_, dev) = host();
        assert!(dev.find_memory_type(0, MemoryLocation::HostVisible).is_err());
    }
}
