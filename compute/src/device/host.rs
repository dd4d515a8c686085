//! CPU implementation of the device seam.
//!
//! Kernels are Rust closures registered against the xxhash64 of their
//! code bytes, so a [`Kernel`](crate::Kernel) built from the same bytes
//! resolves to the closure when its pipeline is created. Each queue is a
//! worker thread draining submissions in order; fences are condvars.
//! Memory types mirror a discrete GPU: device-local memory exists but
//! cannot be mapped, so data has to move through staging copies exactly as
//! it would on hardware.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytemuck::Pod;
use log::{debug, error, trace};
use octoflow_vulkan::GpuInfo;

use super::{
    kernel_hash, BindingKind, BindingTableHandle, BufferHandle, CommandBufferHandle, Device,
    FenceHandle, MemoryLocation, PipelineDesc, PipelineHandle, QueryPoolHandle, QueueHandle,
    SpecConstant,
};
use crate::command::Command;
use crate::error::{ComputeError, Result};

type KernelFn = dyn Fn(&mut KernelInvocation<'_>) + Send + Sync;

struct HostKernel {
    local_size: [u32; 3],
    body: Arc<KernelFn>,
}

struct HostBuffer {
    location: MemoryLocation,
    data: Arc<Mutex<Vec<u8>>>,
}

struct HostPipeline {
    kernel: Arc<HostKernel>,
    layout: Vec<BindingKind>,
    spec_constants: Vec<SpecConstant>,
    push_constant_size: u32,
}

#[derive(Default)]
struct HostFence {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl HostFence {
    fn signal(&self) {
        *lock(&self.signaled) = true;
        self.cv.notify_all();
    }
}

struct Job {
    commands: Arc<Vec<Command>>,
    fence: Arc<HostFence>,
}

struct HostQueue {
    handle: QueueHandle,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Counts of live objects, for leak checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCounts {
    pub buffers: usize,
    pub pipelines: usize,
    pub binding_tables: usize,
    pub command_buffers: usize,
    pub fences: usize,
    pub query_pools: usize,
}

struct HostState {
    next_id: AtomicU64,
    epoch: Instant,
    lost: AtomicBool,
    lost_reason: Mutex<String>,
    memory_types: Vec<MemoryLocation>,
    kernels: RwLock<HashMap<u64, Arc<HostKernel>>>,
    buffers: Mutex<HashMap<u64, HostBuffer>>,
    pipelines: Mutex<HashMap<u64, Arc<HostPipeline>>>,
    tables: Mutex<HashMap<u64, Arc<Vec<(u64, BindingKind)>>>>,
    command_buffers: Mutex<HashMap<u64, Arc<Vec<Command>>>>,
    fences: Mutex<HashMap<u64, Arc<HostFence>>>,
    query_pools: Mutex<HashMap<u64, Arc<Mutex<Vec<Option<u64>>>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostState {
    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check_lost(&self) -> Result<()> {
        if self.lost.load(Ordering::Acquire) {
            return Err(ComputeError::DeviceLost(lock(&self.lost_reason).clone()));
        }
        Ok(())
    }

    fn lose(&self, reason: String) {
        error!("host device lost: {reason}");
        *lock(&self.lost_reason) = reason;
        self.lost.store(true, Ordering::Release);
    }

    fn buffer_data(&self, id: u64) -> Result<Arc<Mutex<Vec<u8>>>> {
        lock(&self.buffers)
            .get(&id)
            .map(|b| b.data.clone())
            .ok_or_else(|| ComputeError::InvalidResource(format!("host buffer {id} does not exist")))
    }

    fn fence(&self, id: u64) -> Result<Arc<HostFence>> {
        lock(&self.fences)
            .get(&id)
            .cloned()
            .ok_or_else(|| ComputeError::InvalidResource(format!("fence {id} does not exist")))
    }

    fn query_pool(&self, id: u64) -> Result<Arc<Mutex<Vec<Option<u64>>>>> {
        lock(&self.query_pools)
            .get(&id)
            .cloned()
            .ok_or_else(|| ComputeError::InvalidResource(format!("query pool {id} does not exist")))
    }

    fn execute(&self, commands: &[Command]) -> Result<()> {
        for command in commands {
            match command {
                Command::CopyBuffer { src, dst, size } => {
                    let size = *size as usize;
                    let bytes = {
                        let src = self.buffer_data(src.raw)?;
                        let src = lock(&src);
                        src[..size.min(src.len())].to_vec()
                    };
                    let dst = self.buffer_data(dst.raw)?;
                    let mut dst = lock(&dst);
                    let n = bytes.len().min(dst.len());
                    dst[..n].copy_from_slice(&bytes[..n]);
                }
                Command::Dispatch { pipeline, table, push_constants, groups } => {
                    self.dispatch(pipeline, table, push_constants, *groups)?;
                }
                Command::Barrier { buffers, src_stage, dst_stage, .. } => {
                    // Submissions already run in order on one thread.
                    trace!("barrier {src_stage:?} -> {dst_stage:?} over {} buffers", buffers.len());
                }
                Command::ResetQueries { pool, first, count } => {
                    let pool = self.query_pool(pool.raw)?;
                    let mut slots = lock(&pool);
                    let end = (*first + *count) as usize;
                    for slot in slots.iter_mut().take(end).skip(*first as usize) {
                        *slot = None;
                    }
                }
                Command::WriteTimestamp { pool, query, .. } => {
                    let pool = self.query_pool(pool.raw)?;
                    let mut slots = lock(&pool);
                    if let Some(slot) = slots.get_mut(*query as usize) {
                        *slot = Some(self.epoch.elapsed().as_nanos() as u64);
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        pipeline: &PipelineHandle,
        table: &BindingTableHandle,
        push_constants: &[u8],
        groups: [u32; 3],
    ) -> Result<()> {
        let pipeline = lock(&self.pipelines)
            .get(&pipeline.pipeline)
            .cloned()
            .ok_or_else(|| ComputeError::InvalidResource("pipeline does not exist".into()))?;
        let bindings = lock(&self.tables)
            .get(&table.set)
            .cloned()
            .ok_or_else(|| ComputeError::InvalidResource("binding table does not exist".into()))?;

        let sources = bindings
            .iter()
            .map(|(id, _)| self.buffer_data(*id))
            .collect::<Result<Vec<_>>>()?;
        let mut data: Vec<Vec<u8>> = sources.iter().map(|s| lock(s).clone()).collect();
        let kinds: Vec<BindingKind> = bindings.iter().map(|(_, k)| *k).collect();

        let local = pipeline.kernel.local_size;
        trace!(
            "host dispatch {groups:?} x {local:?}, {} bindings, {} push bytes",
            data.len(),
            push_constants.len()
        );
        for wz in 0..groups[2] {
            for wy in 0..groups[1] {
                for wx in 0..groups[0] {
                    for lz in 0..local[2] {
                        for ly in 0..local[1] {
                            for lx in 0..local[0] {
                                let mut inv = KernelInvocation {
                                    global_id: [wx * local[0] + lx, wy * local[1] + ly, wz * local[2] + lz],
                                    local_id: [lx, ly, lz],
                                    workgroup_id: [wx, wy, wz],
                                    num_workgroups: groups,
                                    local_size: local,
                                    bindings: &mut data,
                                    kinds: &kinds,
                                    push_constants,
                                    spec_constants: &pipeline.spec_constants,
                                };
                                (pipeline.kernel.body)(&mut inv);
                            }
                        }
                    }
                }
            }
        }

        for ((source, kind), bytes) in sources.iter().zip(&kinds).zip(data) {
            if *kind == BindingKind::Storage {
                *lock(source) = bytes;
            }
        }
        Ok(())
    }
}

/// One kernel invocation's view of its bindings and constants.
pub struct KernelInvocation<'a> {
    global_id: [u32; 3],
    local_id: [u32; 3],
    workgroup_id: [u32; 3],
    num_workgroups: [u32; 3],
    local_size: [u32; 3],
    bindings: &'a mut [Vec<u8>],
    kinds: &'a [BindingKind],
    push_constants: &'a [u8],
    spec_constants: &'a [SpecConstant],
}

impl<'a> KernelInvocation<'a> {
    pub fn global_id(&self) -> [u32; 3] {
        self.global_id
    }

    pub fn local_id(&self) -> [u32; 3] {
        self.local_id
    }

    pub fn workgroup_id(&self) -> [u32; 3] {
        self.workgroup_id
    }

    pub fn num_workgroups(&self) -> [u32; 3] {
        self.num_workgroups
    }

    pub fn local_size(&self) -> [u32; 3] {
        self.local_size
    }

    /// Element count of `binding` viewed as `T`.
    pub fn len<T: Pod>(&self, binding: usize) -> usize {
        self.bindings[binding].len() / std::mem::size_of::<T>()
    }

    /// Out-of-range reads return zero, like robust buffer access.
    pub fn read<T: Pod>(&self, binding: usize, index: usize) -> T {
        let size = std::mem::size_of::<T>();
        let bytes = &self.bindings[binding];
        match bytes.get(index * size..(index + 1) * size) {
            Some(chunk) => bytemuck::pod_read_unaligned(chunk),
            None => T::zeroed(),
        }
    }

    /// Out-of-range writes are dropped.
    ///
    /// # Panics
    /// Writing a uniform binding panics, which loses the device.
    pub fn write<T: Pod>(&mut self, binding: usize, index: usize, value: T) {
        assert!(
            self.kinds[binding] == BindingKind::Storage,
            "binding {binding} is a read-only uniform"
        );
        let size = std::mem::size_of::<T>();
        if let Some(chunk) = self.bindings[binding].get_mut(index * size..(index + 1) * size) {
            chunk.copy_from_slice(bytemuck::bytes_of(&value));
        }
    }

    /// The `index`th `T` of the parameter block, zero when absent.
    pub fn push_constant<T: Pod>(&self, index: usize) -> T {
        let size = std::mem::size_of::<T>();
        match self.push_constants.get(index * size..(index + 1) * size) {
            Some(chunk) => bytemuck::pod_read_unaligned(chunk),
            None => T::zeroed(),
        }
    }

    pub fn spec_constant(&self, id: usize) -> Option<SpecConstant> {
        self.spec_constants.get(id).copied()
    }
}

/// CPU device. See the module docs.
pub struct HostDevice {
    state: Arc<HostState>,
    queues: Vec<HostQueue>,
}

impl HostDevice {
    /// One queue on family 0.
    pub fn new() -> Self {
        Self::with_queues(&[0])
    }

    /// One queue per entry; repeated families take the next queue index.
    pub fn with_queues(families: &[u32]) -> Self {
        Self::with_memory_types(families, &[MemoryLocation::DeviceLocal, MemoryLocation::HostVisible])
    }

    /// Like [`with_queues`](Self::with_queues) with an explicit memory type table.
    pub fn with_memory_types(families: &[u32], memory_types: &[MemoryLocation]) -> Self {
        let state = Arc::new(HostState {
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
            lost: AtomicBool::new(false),
            lost_reason: Mutex::new(String::new()),
            memory_types: memory_types.to_vec(),
            kernels: RwLock::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            command_buffers: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            query_pools: Mutex::new(HashMap::new()),
        });

        let mut per_family: HashMap<u32, u32> = HashMap::new();
        let queues = families
            .iter()
            .enumerate()
            .map(|(slot, &family)| {
                let index = per_family.entry(family).or_insert(0);
                let handle = QueueHandle { slot, family, index: *index, supports_timestamps: true };
                *index += 1;

                let (tx, rx) = mpsc::channel::<Job>();
                let worker_state = state.clone();
                let worker = thread::Builder::new()
                    .name(format!("octoflow-host-q{slot}"))
                    .spawn(move || {
                        for job in rx {
                            run_job(&worker_state, &job);
                            job.fence.signal();
                        }
                    })
                    .ok();
                HostQueue { handle, sender: Mutex::new(Some(tx)), worker: Mutex::new(worker) }
            })
            .collect();

        debug!("host device up with {} queues", families.len());
        Self { state, queues }
    }

    /// Register `body` as the implementation of kernels whose code is `code`.
    /// Returns the code hash. Re-registering replaces the previous body for
    /// pipelines created afterwards.
    pub fn register_kernel<F>(&self, code: &[u8], local_size: [u32; 3], body: F) -> u64
    where
        F: Fn(&mut KernelInvocation<'_>) + Send + Sync + 'static,
    {
        let hash = kernel_hash(code);
        let kernel = Arc::new(HostKernel { local_size, body: Arc::new(body) });
        self.state
            .kernels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, kernel);
        debug!("registered host kernel {hash:#018x} local size {local_size:?}");
        hash
    }

    pub fn is_lost(&self) -> bool {
        self.state.lost.load(Ordering::Acquire)
    }

    pub fn live_counts(&self) -> HostCounts {
        HostCounts {
            buffers: lock(&self.state.buffers).len(),
            pipelines: lock(&self.state.pipelines).len(),
            binding_tables: lock(&self.state.tables).len(),
            command_buffers: lock(&self.state.command_buffers).len(),
            fences: lock(&self.state.fences).len(),
            query_pools: lock(&self.state.query_pools).len(),
        }
    }

    fn queue(&self, handle: &QueueHandle) -> Result<&HostQueue> {
        self.queues
            .get(handle.slot)
            .ok_or_else(|| ComputeError::InvalidResource(format!("queue slot {} does not exist", handle.slot)))
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn run_job(state: &HostState, job: &Job) {
    if state.lost.load(Ordering::Acquire) {
        return;
    }
    match panic::catch_unwind(AssertUnwindSafe(|| state.execute(&job.commands))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => state.lose(e.to_string()),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "kernel panicked".into());
            state.lose(format!("kernel panicked: {msg}"));
        }
    }
}

impl Device for HostDevice {
    fn name(&self) -> String {
        "octoflow host device".into()
    }

    fn info(&self) -> GpuInfo {
        GpuInfo {
            name: self.name(),
            device_type: "cpu".into(),
            api_version_major: 0,
            api_version_minor: 0,
            vendor_id: 0,
            device_id: 0,
            max_compute_workgroup_size: [u32::MAX; 3],
            max_compute_workgroup_invocations: u32::MAX,
            max_storage_buffer_range: u32::MAX,
            // Host kernels have no workgroup-shared memory.
            max_compute_shared_memory: 0,
            timestamp_period: self.timestamp_period(),
            supports_int64: true,
        }
    }

    fn queues(&self) -> Vec<QueueHandle> {
        self.queues.iter().map(|q| q.handle).collect()
    }

    fn find_memory_type(&self, type_bits: u32, location: MemoryLocation) -> Result<u32> {
        self.state
            .memory_types
            .iter()
            .take(u32::BITS as usize)
            .enumerate()
            .find(|(i, loc)| type_bits & (1 << i) != 0 && **loc == location)
            .map(|(i, _)| i as u32)
            .ok_or(ComputeError::NoSuitableMemoryType { type_bits, location: location.name() })
    }

    fn create_buffer(&self, size: u64, _role: BindingKind, location: MemoryLocation) -> Result<BufferHandle> {
        self.state.check_lost()?;
        if size == 0 {
            return Err(ComputeError::Allocation("zero-sized buffer".into()));
        }
        let all_types = 1u32
            .checked_shl(self.state.memory_types.len() as u32)
            .map_or(u32::MAX, |bit| bit - 1);
        let memory = self.find_memory_type(all_types, location)?;
        let id = self.state.id();
        lock(&self.state.buffers).insert(
            id,
            HostBuffer { location, data: Arc::new(Mutex::new(vec![0u8; size as usize])) },
        );
        Ok(BufferHandle { raw: id, memory: memory as u64, size })
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        lock(&self.state.buffers).remove(&buffer.raw);
    }

    fn write_mapped(&self, buffer: &BufferHandle, data: &[u8]) -> Result<()> {
        let target = {
            let buffers = lock(&self.state.buffers);
            let b = buffers
                .get(&buffer.raw)
                .ok_or_else(|| ComputeError::InvalidResource("host buffer does not exist".into()))?;
            if b.location != MemoryLocation::HostVisible {
                return Err(ComputeError::InvalidResource("cannot map device-local memory".into()));
            }
            b.data.clone()
        };
        let mut bytes = lock(&target);
        if bytes.len() != data.len() {
            return Err(ComputeError::SizeMismatch { expected: bytes.len(), actual: data.len() });
        }
        bytes.copy_from_slice(data);
        Ok(())
    }

    fn read_mapped(&self, buffer: &BufferHandle, out: &mut [u8]) -> Result<()> {
        let source = {
            let buffers = lock(&self.state.buffers);
            let b = buffers
                .get(&buffer.raw)
                .ok_or_else(|| ComputeError::InvalidResource("host buffer does not exist".into()))?;
            if b.location != MemoryLocation::HostVisible {
                return Err(ComputeError::InvalidResource("cannot map device-local memory".into()));
            }
            b.data.clone()
        };
        let bytes = lock(&source);
        if bytes.len() != out.len() {
            return Err(ComputeError::SizeMismatch { expected: bytes.len(), actual: out.len() });
        }
        out.copy_from_slice(&bytes);
        Ok(())
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<PipelineHandle> {
        self.state.check_lost()?;
        let hash = kernel_hash(desc.code);
        let kernel = self
            .state
            .kernels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&hash)
            .cloned()
            .ok_or_else(|| ComputeError::Pipeline(format!("no host kernel registered for {hash:#018x}")))?;
        let id = self.state.id();
        lock(&self.state.pipelines).insert(
            id,
            Arc::new(HostPipeline {
                kernel,
                layout: desc.layout.to_vec(),
                spec_constants: desc.spec_constants.to_vec(),
                push_constant_size: desc.push_constant_size,
            }),
        );
        Ok(PipelineHandle { pipeline: id, layout: id, set_layout: id, module: hash })
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        lock(&self.state.pipelines).remove(&pipeline.pipeline);
    }

    fn create_binding_table(
        &self,
        pipeline: &PipelineHandle,
        bindings: &[(BufferHandle, BindingKind)],
    ) -> Result<BindingTableHandle> {
        let layout = lock(&self.state.pipelines)
            .get(&pipeline.pipeline)
            .map(|p| p.layout.clone())
            .ok_or_else(|| ComputeError::InvalidResource("pipeline does not exist".into()))?;
        if layout.len() != bindings.len() || layout.iter().zip(bindings).any(|(l, (_, k))| l != k) {
            return Err(ComputeError::BindingLayoutMismatch(format!(
                "pipeline expects {layout:?}, got {:?}",
                bindings.iter().map(|(_, k)| *k).collect::<Vec<_>>()
            )));
        }
        {
            let buffers = lock(&self.state.buffers);
            if let Some((b, _)) = bindings.iter().find(|(b, _)| !buffers.contains_key(&b.raw)) {
                return Err(ComputeError::InvalidResource(format!("host buffer {} does not exist", b.raw)));
            }
        }
        let id = self.state.id();
        lock(&self.state.tables).insert(id, Arc::new(bindings.iter().map(|(b, k)| (b.raw, *k)).collect()));
        Ok(BindingTableHandle { pool: id, set: id })
    }

    fn destroy_binding_table(&self, table: BindingTableHandle) {
        lock(&self.state.tables).remove(&table.set);
    }

    fn create_command_buffer(&self, queue: &QueueHandle) -> Result<CommandBufferHandle> {
        self.queue(queue)?;
        let id = self.state.id();
        lock(&self.state.command_buffers).insert(id, Arc::new(Vec::new()));
        Ok(CommandBufferHandle { pool: queue.slot as u64, raw: id })
    }

    fn record(&self, cmd: &CommandBufferHandle, commands: &[Command]) -> Result<()> {
        let pipelines = lock(&self.state.pipelines);
        for command in commands {
            if let Command::Dispatch { pipeline, push_constants, .. } = command {
                let p = pipelines
                    .get(&pipeline.pipeline)
                    .ok_or_else(|| ComputeError::InvalidResource("pipeline does not exist".into()))?;
                if push_constants.len() != p.push_constant_size as usize {
                    return Err(ComputeError::SizeMismatch {
                        expected: p.push_constant_size as usize,
                        actual: push_constants.len(),
                    });
                }
            }
        }
        drop(pipelines);
        let mut buffers = lock(&self.state.command_buffers);
        let slot = buffers
            .get_mut(&cmd.raw)
            .ok_or_else(|| ComputeError::InvalidResource("command buffer does not exist".into()))?;
        *slot = Arc::new(commands.to_vec());
        Ok(())
    }

    fn destroy_command_buffer(&self, cmd: CommandBufferHandle) {
        lock(&self.state.command_buffers).remove(&cmd.raw);
    }

    fn create_fence(&self) -> Result<FenceHandle> {
        let id = self.state.id();
        lock(&self.state.fences).insert(id, Arc::new(HostFence::default()));
        Ok(FenceHandle(id))
    }

    fn reset_fence(&self, fence: &FenceHandle) -> Result<()> {
        *lock(&self.state.fence(fence.0)?.signaled) = false;
        Ok(())
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        lock(&self.state.fences).remove(&fence.0);
    }

    fn submit(&self, queue: &QueueHandle, cmd: &CommandBufferHandle, fence: &FenceHandle) -> Result<()> {
        self.state.check_lost()?;
        let commands = lock(&self.state.command_buffers)
            .get(&cmd.raw)
            .cloned()
            .ok_or_else(|| ComputeError::InvalidResource("command buffer does not exist".into()))?;
        let fence = self.state.fence(fence.0)?;
        let queue = self.queue(queue)?;
        let sender = lock(&queue.sender);
        let sender = sender
            .as_ref()
            .ok_or_else(|| ComputeError::DeviceLost("queue worker stopped".into()))?;
        sender
            .send(Job { commands, fence })
            .map_err(|_| ComputeError::DeviceLost("queue worker stopped".into()))
    }

    fn wait_fence(&self, fence: &FenceHandle, timeout_ns: u64) -> Result<bool> {
        let fence = self.state.fence(fence.0)?;
        let guard = lock(&fence.signaled);
        let signaled = if timeout_ns == u64::MAX {
            *fence.cv.wait_while(guard, |s| !*s).unwrap_or_else(PoisonError::into_inner)
        } else {
            let (guard, _) = fence
                .cv
                .wait_timeout_while(guard, Duration::from_nanos(timeout_ns), |s| !*s)
                .unwrap_or_else(PoisonError::into_inner);
            *guard
        };
        self.state.check_lost()?;
        Ok(signaled)
    }

    fn fence_status(&self, fence: &FenceHandle) -> Result<bool> {
        let signaled = *lock(&self.state.fence(fence.0)?.signaled);
        self.state.check_lost()?;
        Ok(signaled)
    }

    fn create_query_pool(&self, _queue: &QueueHandle, count: u32) -> Result<QueryPoolHandle> {
        let id = self.state.id();
        lock(&self.state.query_pools).insert(id, Arc::new(Mutex::new(vec![None; count as usize])));
        Ok(QueryPoolHandle { raw: id, count, valid_bits: u64::BITS })
    }

    fn destroy_query_pool(&self, pool: QueryPoolHandle) {
        lock(&self.state.query_pools).remove(&pool.raw);
    }

    fn query_timestamps(&self, pool: &QueryPoolHandle, first: u32, count: u32) -> Result<Vec<u64>> {
        let pool = self.state.query_pool(pool.raw)?;
        let slots = lock(&pool);
        (first..first + count)
            .map(|q| {
                slots
                    .get(q as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| ComputeError::InvalidResource(format!("timestamp query {q} not written")))
            })
            .collect()
    }

    fn timestamp_period(&self) -> f32 {
        1.0
    }

    fn wait_idle(&self) -> Result<()> {
        // Everything queued before this marker has run once it signals.
        for queue in &self.queues {
            let fence = Arc::new(HostFence::default());
            let sent = lock(&queue.sender)
                .as_ref()
                .map(|s| s.send(Job { commands: Arc::new(Vec::new()), fence: fence.clone() }).is_ok())
                .unwrap_or(false);
            if sent {
                let guard = lock(&fence.signaled);
                drop(fence.cv.wait_while(guard, |s| !*s).unwrap_or_else(PoisonError::into_inner));
            }
        }
        self.state.check_lost()
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        for queue in &self.queues {
            lock(&queue.sender).take();
            if let Some(worker) = lock(&queue.worker).take() {
                let _ = worker.join();
            }
        }
    }
}
