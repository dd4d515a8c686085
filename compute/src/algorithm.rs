//! Algorithms: a kernel bound to an ordered list of buffers.
//!
//! Buffer `i` is binding `i`. The pipeline depends only on the kernel, its
//! specialization constants and the parameter block size, so swapping
//! buffers rebuilds just the binding table. Anything that changes what a
//! recorded dispatch looks like bumps the generation counter, which tells
//! sequences holding an older recording to record again.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytemuck::Pod;
use log::{debug, trace};

use crate::buffer::Buffer;
use crate::command::{Command, CommandRecorder};
use crate::device::{BindingKind, BindingTableHandle, DeviceRef, PipelineDesc, PipelineHandle};
use crate::error::{ComputeError, Result};
use crate::registry::Destroy;

pub use crate::device::SpecConstant;

static NEXT_ALGORITHM_ID: AtomicU64 = AtomicU64::new(1);

/// Compiled kernel code plus the binding layout it declares.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    /// SPIR-V for Vulkan; any bytes naming a registered host kernel for the host device.
    pub code: Arc<[u8]>,
    pub entry_point: String,
    pub layout: Vec<BindingKind>,
}

impl Kernel {
    pub fn new(code: impl Into<Vec<u8>>, layout: Vec<BindingKind>) -> Self {
        let code: Vec<u8> = code.into();
        Self { code: code.into(), entry_point: "main".into(), layout }
    }

    pub fn from_spirv_words(words: &[u32], layout: Vec<BindingKind>) -> Self {
        Self::new(bytemuck::cast_slice::<u32, u8>(words).to_vec(), layout)
    }

    /// Load a pre-built `.spv` file.
    pub fn load(path: impl AsRef<Path>, layout: Vec<BindingKind>) -> Result<Self> {
        Ok(Self::new(std::fs::read(path.as_ref())?, layout))
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }
}

/// Workgroup counts per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Workgroup(pub [u32; 3]);

impl Workgroup {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self([x, y, z])
    }

    /// `ceil(problem / local)` per axis. A zero local size counts as 1.
    pub fn for_problem(problem: [u32; 3], local: [u32; 3]) -> Self {
        let mut groups = [0; 3];
        for axis in 0..3 {
            groups[axis] = problem[axis].div_ceil(local[axis].max(1));
        }
        Self(groups)
    }
}

/// Everything needed to build an [`Algorithm`].
#[derive(Debug, Clone)]
pub struct AlgorithmSpec {
    buffers: Vec<Arc<Buffer>>,
    kernel: Kernel,
    workgroup: Option<Workgroup>,
    spec_constants: Vec<SpecConstant>,
    param_size: usize,
    default_params: Vec<u8>,
}

impl AlgorithmSpec {
    pub fn new(buffers: Vec<Arc<Buffer>>, kernel: Kernel) -> Self {
        Self {
            buffers,
            kernel,
            workgroup: None,
            spec_constants: Vec::new(),
            param_size: 0,
            default_params: Vec::new(),
        }
    }

    /// Required: the number of workgroups each dispatch launches.
    pub fn with_workgroup(mut self, workgroup: Workgroup) -> Self {
        self.workgroup = Some(workgroup);
        self
    }

    pub fn with_spec_constants(mut self, constants: Vec<SpecConstant>) -> Self {
        self.spec_constants = constants;
        self
    }

    /// Declare the parameter block by its default contents.
    pub fn with_params<T: Pod>(mut self, defaults: &[T]) -> Self {
        self.default_params = bytemuck::cast_slice(defaults).to_vec();
        self.param_size = self.default_params.len();
        self
    }

    /// Declare a zero-filled parameter block of `bytes` bytes.
    pub fn with_param_size(mut self, bytes: usize) -> Self {
        self.param_size = bytes;
        self.default_params = vec![0; bytes];
        self
    }

    pub fn build(self, device: DeviceRef) -> Result<Arc<Algorithm>> {
        Algorithm::build(device, self)
    }
}

struct AlgorithmState {
    buffers: Vec<Arc<Buffer>>,
    pipeline: Option<PipelineHandle>,
    table: Option<BindingTableHandle>,
    workgroup: Workgroup,
    /// Submissions still executing a recorded dispatch of this algorithm.
    in_flight: usize,
    /// Binding tables replaced by `rebuild` while work was in flight.
    retired: Vec<BindingTableHandle>,
    params: Vec<u8>,
    destroyed: bool,
}

pub struct Algorithm {
    id: u64,
    device: DeviceRef,
    kernel: Kernel,
    spec_constants: Vec<SpecConstant>,
    param_size: usize,
    generation: AtomicU64,
    state: Mutex<AlgorithmState>,
}

impl std::fmt::Debug for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Algorithm")
            .field("id", &self.id)
            .field("layout", &self.kernel.layout)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// Binding handles for `buffers`, checked against the kernel's layout.
fn bindings_for(
    kernel: &Kernel,
    buffers: &[Arc<Buffer>],
) -> Result<Vec<(crate::device::BufferHandle, BindingKind)>> {
    if buffers.len() != kernel.layout.len() {
        return Err(ComputeError::BindingLayoutMismatch(format!(
            "kernel declares {} bindings, got {} buffers",
            kernel.layout.len(),
            buffers.len()
        )));
    }
    buffers
        .iter()
        .zip(&kernel.layout)
        .enumerate()
        .map(|(i, (buffer, kind))| {
            if buffer.role() != *kind {
                return Err(ComputeError::BindingLayoutMismatch(format!(
                    "binding {i}: kernel expects {kind:?}, buffer #{} is {:?}",
                    buffer.id(),
                    buffer.role()
                )));
            }
            Ok((buffer.primary()?, *kind))
        })
        .collect()
}

impl Algorithm {
    fn build(device: DeviceRef, spec: AlgorithmSpec) -> Result<Arc<Self>> {
        let workgroup = spec
            .workgroup
            .ok_or_else(|| ComputeError::Pipeline("no workgroup count set, see `with_workgroup`".into()))?;
        if spec.param_size % 4 != 0 {
            return Err(ComputeError::Pipeline(format!(
                "parameter block must be a multiple of 4 bytes, got {}",
                spec.param_size
            )));
        }
        let bindings = bindings_for(&spec.kernel, &spec.buffers)?;

        let pipeline = device.create_pipeline(&PipelineDesc {
            code: &spec.kernel.code,
            entry_point: &spec.kernel.entry_point,
            layout: &spec.kernel.layout,
            spec_constants: &spec.spec_constants,
            push_constant_size: spec.param_size as u32,
        })?;
        let table = match device.create_binding_table(&pipeline, &bindings) {
            Ok(t) => t,
            Err(e) => {
                device.destroy_pipeline(pipeline);
                return Err(e);
            }
        };

        let id = NEXT_ALGORITHM_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "algorithm #{id}: {} bindings, workgroup {:?}, {} spec constants, {} param bytes",
            bindings.len(),
            workgroup.0,
            spec.spec_constants.len(),
            spec.param_size
        );
        Ok(Arc::new(Self {
            id,
            device,
            kernel: spec.kernel,
            spec_constants: spec.spec_constants,
            param_size: spec.param_size,
            generation: AtomicU64::new(0),
            state: Mutex::new(AlgorithmState {
                buffers: spec.buffers,
                pipeline: Some(pipeline),
                table: Some(table),
                workgroup,
                in_flight: 0,
                retired: Vec::new(),
                params: spec.default_params,
                destroyed: false,
            }),
        }))
    }

    fn state(&self) -> MutexGuard<'_, AlgorithmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_state(&self) -> Result<MutexGuard<'_, AlgorithmState>> {
        let state = self.state();
        if state.destroyed {
            return Err(ComputeError::InvalidResource(format!("algorithm #{} was destroyed", self.id)));
        }
        Ok(state)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn spec_constants(&self) -> &[SpecConstant] {
        &self.spec_constants
    }

    pub fn buffers(&self) -> Vec<Arc<Buffer>> {
        self.state().buffers.clone()
    }

    pub fn workgroup(&self) -> Workgroup {
        self.state().workgroup
    }

    pub fn param_size(&self) -> usize {
        self.param_size
    }

    /// Bumped whenever a recorded dispatch of this algorithm goes stale.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_init(&self) -> bool {
        let state = self.state();
        !state.destroyed && state.pipeline.is_some() && state.table.is_some()
    }

    /// Bind a new buffer list. On failure the previous bindings stay in place.
    pub fn rebuild(&self, buffers: Vec<Arc<Buffer>>) -> Result<()> {
        let mut state = self.live_state()?;
        let bindings = bindings_for(&self.kernel, &buffers)?;
        let pipeline = state
            .pipeline
            .ok_or_else(|| ComputeError::InvalidResource(format!("algorithm #{} has no pipeline", self.id)))?;
        let table = self.device.create_binding_table(&pipeline, &bindings)?;
        if let Some(old) = state.table.replace(table) {
            if state.in_flight > 0 {
                trace!("algorithm #{}: table kept until {} submissions finish", self.id, state.in_flight);
                state.retired.push(old);
            } else {
                self.device.destroy_binding_table(old);
            }
        }
        state.buffers = buffers;
        self.bump();
        debug!("algorithm #{} rebuilt, generation {}", self.id, self.generation());
        Ok(())
    }

    pub(crate) fn hold_submission(&self) {
        self.state().in_flight += 1;
    }

    /// Frees tables retired by `rebuild` once the last submission finishes.
    pub(crate) fn release_submission(&self) {
        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            for table in state.retired.drain(..) {
                self.device.destroy_binding_table(table);
            }
        }
    }

    pub fn set_workgroup(&self, workgroup: Workgroup) -> Result<()> {
        let mut state = self.live_state()?;
        if state.workgroup != workgroup {
            state.workgroup = workgroup;
            self.bump();
        }
        Ok(())
    }

    /// Replace the default parameter block.
    pub fn set_params<T: Pod>(&self, params: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(params);
        if bytes.len() != self.param_size {
            return Err(ComputeError::SizeMismatch { expected: self.param_size, actual: bytes.len() });
        }
        let mut state = self.live_state()?;
        if state.params != bytes {
            state.params = bytes.to_vec();
            self.bump();
        }
        Ok(())
    }

    /// Record bind + push + dispatch. `params` overrides the default block.
    pub fn record_dispatch(&self, rec: &mut CommandRecorder, params: Option<&[u8]>) -> Result<()> {
        let state = self.live_state()?;
        if let Some(p) = params {
            if p.len() != self.param_size {
                return Err(ComputeError::SizeMismatch { expected: self.param_size, actual: p.len() });
            }
        }
        if let Some(dead) = state.buffers.iter().find(|b| !b.is_allocated()) {
            return Err(ComputeError::InvalidResource(format!(
                "algorithm #{} binds destroyed buffer #{}",
                self.id,
                dead.id()
            )));
        }
        let (pipeline, table) = match (state.pipeline, state.table) {
            (Some(p), Some(t)) => (p, t),
            _ => return Err(ComputeError::InvalidResource(format!("algorithm #{} is not built", self.id))),
        };
        rec.push(Command::Dispatch {
            pipeline,
            table,
            push_constants: params.map_or_else(|| state.params.clone(), <[u8]>::to_vec),
            groups: state.workgroup.0,
        });
        Ok(())
    }

    /// Release the binding table and pipeline. Buffers are left alone.
    pub fn destroy(&self) {
        let mut state = self.state();
        if state.destroyed {
            return;
        }
        if let Some(table) = state.table.take() {
            self.device.destroy_binding_table(table);
        }
        for table in state.retired.drain(..) {
            self.device.destroy_binding_table(table);
        }
        if let Some(pipeline) = state.pipeline.take() {
            self.device.destroy_pipeline(pipeline);
        }
        state.buffers.clear();
        state.destroyed = true;
        debug!("algorithm #{} destroyed", self.id);
    }
}

impl Destroy for Algorithm {
    fn destroy(&self) {
        Algorithm::destroy(self)
    }

    fn is_alive(&self) -> bool {
        !self.state().destroyed
    }
}

impl Drop for Algorithm {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryKind;
    use crate::device::HostDevice;

    fn setup() -> (Arc<HostDevice>, DeviceRef) {
        let _ = env_logger::builder().is_test(true).try_init();
        let host = Arc::new(HostDevice::new());
        host.register_kernel(b"pair", [1, 1, 1], |_| {});
        let dev: DeviceRef = host.clone();
        (host, dev)
    }

    fn storage(dev: &DeviceRef, n: usize) -> Arc<Buffer> {
        Buffer::from_slice(dev.clone(), &vec![0u32; n], MemoryKind::Device, BindingKind::Storage).unwrap()
    }

    fn one() -> Workgroup {
        Workgroup::new(1, 1, 1)
    }

    fn pair() -> Kernel {
        Kernel::new(b"pair".to_vec(), vec![BindingKind::Storage, BindingKind::Storage])
    }

    #[test]
    fn test_for_problem() {
        assert_eq!(Workgroup::for_problem([1000, 1, 1], [256, 1, 1]), Workgroup::new(4, 1, 1));
        assert_eq!(Workgroup::for_problem([64, 64, 1], [8, 8, 0]), Workgroup::new(8, 8, 1));
        assert_eq!(Workgroup::for_problem([0, 1, 1], [64, 1, 1]), Workgroup::new(0, 1, 1));
    }

    #[test]
    fn test_workgroup_and_params() {
        let (_, dev) = setup();
        let a = storage(&dev, 5);
        let b = storage(&dev, 5);
        let alg = AlgorithmSpec::new(vec![a, b], pair())
            .with_workgroup(Workgroup::new(5, 1, 1))
            .with_params(&[1.0f32, 2.0])
            .build(dev)
            .unwrap();
        assert_eq!(alg.workgroup(), Workgroup::new(5, 1, 1));
        assert_eq!(alg.param_size(), 8);
        assert!(alg.is_init());
    }

    #[test]
    fn test_missing_workgroup_rejected() {
        let (host, dev) = setup();
        let err = AlgorithmSpec::new(vec![storage(&dev, 5), storage(&dev, 5)], pair()).build(dev).unwrap_err();
        assert!(matches!(err, ComputeError::Pipeline(ref m) if m.contains("with_workgroup")));
        let counts = host.live_counts();
        assert_eq!((counts.pipelines, counts.binding_tables), (0, 0));
    }

    #[test]
    fn test_layout_mismatch() {
        let (host, dev) = setup();
        let a = storage(&dev, 3);
        let err = AlgorithmSpec::new(vec![a.clone()], pair())
            .with_workgroup(one())
            .build(dev.clone())
            .unwrap_err();
        assert!(matches!(err, ComputeError::BindingLayoutMismatch(_)));

        let u = Buffer::from_slice(dev.clone(), &[0u32; 3], MemoryKind::Device, BindingKind::Uniform).unwrap();
        let err = AlgorithmSpec::new(vec![a, u], pair()).with_workgroup(one()).build(dev).unwrap_err();
        assert!(matches!(err, ComputeError::BindingLayoutMismatch(_)));
        assert_eq!(host.live_counts().pipelines, 0);
    }

    #[test]
    fn test_unaligned_param_block() {
        let (_, dev) = setup();
        let spec = AlgorithmSpec::new(vec![storage(&dev, 1), storage(&dev, 1)], pair())
            .with_workgroup(one())
            .with_param_size(6);
        assert!(matches!(spec.build(dev), Err(ComputeError::Pipeline(_))));
    }

    #[test]
    fn test_rebuild_swaps_table_and_bumps_generation() {
        let (host, dev) = setup();
        let alg = AlgorithmSpec::new(vec![storage(&dev, 2), storage(&dev, 2)], pair())
            .with_workgroup(Workgroup::new(2, 1, 1))
            .build(dev.clone())
            .unwrap();
        assert_eq!(alg.generation(), 0);
        alg.rebuild(vec![storage(&dev, 4), storage(&dev, 4)]).unwrap();
        assert_eq!(alg.generation(), 1);
        assert_eq!(alg.buffers()[0].len(), 4);
        assert_eq!(host.live_counts().binding_tables, 1);

        // A bad list leaves the previous binding in place.
        assert!(alg.rebuild(vec![storage(&dev, 4)]).is_err());
        assert_eq!(alg.generation(), 1);
        assert_eq!(alg.buffers().len(), 2);
        assert_eq!(host.live_counts().binding_tables, 1);
    }

    #[test]
    fn test_rebuild_defers_table_release_while_held() {
        let (host, dev) = setup();
        let alg = AlgorithmSpec::new(vec![storage(&dev, 2), storage(&dev, 2)], pair())
            .with_workgroup(one())
            .build(dev.clone())
            .unwrap();
        alg.hold_submission();
        alg.hold_submission();
        alg.rebuild(vec![storage(&dev, 2), storage(&dev, 2)]).unwrap();
        alg.rebuild(vec![storage(&dev, 2), storage(&dev, 2)]).unwrap();
        assert_eq!(host.live_counts().binding_tables, 3);
        alg.release_submission();
        assert_eq!(host.live_counts().binding_tables, 3);
        alg.release_submission();
        assert_eq!(host.live_counts().binding_tables, 1);

        alg.hold_submission();
        alg.rebuild(vec![storage(&dev, 2), storage(&dev, 2)]).unwrap();
        alg.destroy();
        assert_eq!(host.live_counts().binding_tables, 0);
        alg.release_submission();
    }

    #[test]
    fn test_set_params_and_workgroup() {
        let (_, dev) = setup();
        let alg = AlgorithmSpec::new(vec![storage(&dev, 2), storage(&dev, 2)], pair())
            .with_workgroup(Workgroup::new(2, 1, 1))
            .with_params(&[0u32])
            .build(dev)
            .unwrap();
        assert!(matches!(
            alg.set_params(&[1u32, 2]),
            Err(ComputeError::SizeMismatch { expected: 4, actual: 8 })
        ));
        alg.set_params(&[7u32]).unwrap();
        alg.set_workgroup(Workgroup::new(3, 1, 1)).unwrap();
        alg.set_workgroup(Workgroup::new(3, 1, 1)).unwrap();
        assert_eq!(alg.generation(), 2);

        let mut rec = CommandRecorder::new();
        alg.record_dispatch(&mut rec, None).unwrap();
        match &rec.commands()[0] {
            Command::Dispatch { push_constants, groups, .. } => {
                assert_eq!(push_constants, &7u32.to_ne_bytes().to_vec());
                assert_eq!(*groups, [3, 1, 1]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(alg.record_dispatch(&mut rec, Some(&[0u8; 2])).is_err());
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn test_destroy_idempotent_and_leaves_buffers() {
        let (host, dev) = setup();
        let a = storage(&dev, 2);
        let alg = AlgorithmSpec::new(vec![a.clone(), storage(&dev, 2)], pair()).with_workgroup(one()).build(dev).unwrap();
        alg.destroy();
        alg.destroy();
        assert!(!alg.is_init());
        assert!(a.is_allocated());
        let counts = host.live_counts();
        assert_eq!((counts.pipelines, counts.binding_tables), (0, 0));
        let mut rec = CommandRecorder::new();
        assert!(matches!(alg.record_dispatch(&mut rec, None), Err(ComputeError::InvalidResource(_))));
    }

    #[test]
    fn test_dispatch_with_destroyed_buffer() {
        let (_, dev) = setup();
        let a = storage(&dev, 2);
        let alg = AlgorithmSpec::new(vec![a.clone(), storage(&dev, 2)], pair()).with_workgroup(one()).build(dev).unwrap();
        a.destroy();
        let mut rec = CommandRecorder::new();
        assert!(matches!(alg.record_dispatch(&mut rec, None), Err(ComputeError::InvalidResource(_))));
    }

    #[test]
    fn test_kernel_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.spv");
        std::fs::write(&path, [3u8, 2, 35, 7]).unwrap();
        let k = Kernel::load(&path, vec![]).unwrap().with_entry_point("entry");
        assert_eq!(&*k.code, &[3u8, 2, 35, 7]);
        assert_eq!(k.entry_point, "entry");
        assert!(matches!(Kernel::load(dir.path().join("nope.spv"), vec![]), Err(ComputeError::Io(_))));
    }
}
