//! Sequences: one reusable command buffer bound to a queue.
//!
//! State machine: `Idle → Recording → Recorded → Submitted → Idle`. A
//! finished recording stays in the command buffer, so `eval_async` from
//! `Idle` replays it. If an algorithm the recording dispatches has since been
//! rebuilt, the operations are recorded again before submission.
//!
//! Lock order: sequence, then algorithm, then buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::algorithm::Algorithm;
use crate::command::{Command, CommandRecorder, PipelineStage};
use crate::device::{CommandBufferHandle, DeviceRef, FenceHandle, QueryPoolHandle, QueueHandle};
use crate::error::{ComputeError, Result};
use crate::operation::Operation;
use crate::registry::Destroy;

static NEXT_SEQUENCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceState {
    Idle,
    Recording,
    Recorded,
    Submitted,
}

impl SequenceState {
    fn name(self) -> &'static str {
        match self {
            SequenceState::Idle => "Idle",
            SequenceState::Recording => "Recording",
            SequenceState::Recorded => "Recorded",
            SequenceState::Submitted => "Submitted",
        }
    }
}

struct Inner {
    state: SequenceState,
    recorder: CommandRecorder,
    operations: Vec<Operation>,
    /// Algorithm generations seen when each dispatch was recorded.
    generations: Vec<(Arc<Algorithm>, u64)>,
    /// Algorithms whose binding tables the submitted work still reads.
    in_flight: Vec<Arc<Algorithm>>,
    has_recording: bool,
    next_query: u32,
    timestamps_ready: bool,
    command_buffer: Option<CommandBufferHandle>,
    fence: Option<FenceHandle>,
    query_pool: Option<QueryPoolHandle>,
    destroyed: bool,
}

pub struct Sequence {
    id: u64,
    device: DeviceRef,
    queue: QueueHandle,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn wrong_state(state: SequenceState, action: &'static str) -> ComputeError {
    ComputeError::SequenceState { state: state.name(), action }
}

impl Sequence {
    /// `timestamps` is the query capacity; zero disables timestamping.
    pub fn new(device: DeviceRef, queue: QueueHandle, timestamps: u32) -> Result<Arc<Self>> {
        let command_buffer = device.create_command_buffer(&queue)?;
        let fence = match device.create_fence() {
            Ok(f) => f,
            Err(e) => {
                device.destroy_command_buffer(command_buffer);
                return Err(e);
            }
        };
        let query_pool = if timestamps == 0 {
            None
        } else if !queue.supports_timestamps {
            warn!(
                "queue family {} cannot write timestamps; timestamping disabled",
                queue.family
            );
            None
        } else {
            match device.create_query_pool(&queue, timestamps) {
                Ok(p) => Some(p),
                Err(e) => {
                    device.destroy_fence(fence);
                    device.destroy_command_buffer(command_buffer);
                    return Err(e);
                }
            }
        };

        let id = NEXT_SEQUENCE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            "sequence #{id} on queue {}:{} ({} timestamps)",
            queue.family,
            queue.index,
            query_pool.map_or(0, |p| p.count)
        );
        Ok(Arc::new(Self {
            id,
            device,
            queue,
            inner: Mutex::new(Inner {
                state: SequenceState::Idle,
                recorder: CommandRecorder::new(),
                operations: Vec::new(),
                generations: Vec::new(),
                in_flight: Vec::new(),
                has_recording: false,
                next_query: 0,
                timestamps_ready: false,
                command_buffer: Some(command_buffer),
                fence: Some(fence),
                query_pool,
                destroyed: false,
            }),
        }))
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_inner(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.inner();
        if inner.destroyed {
            return Err(ComputeError::InvalidResource(format!("sequence #{} was destroyed", self.id)));
        }
        Ok(inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    pub fn state(&self) -> SequenceState {
        self.inner().state
    }

    pub fn is_recording(&self) -> bool {
        self.state() == SequenceState::Recording
    }

    pub fn is_init(&self) -> bool {
        let inner = self.inner();
        !inner.destroyed && inner.command_buffer.is_some()
    }

    /// Number of operations in the current recording.
    pub fn operation_count(&self) -> usize {
        self.inner().operations.len()
    }

    fn write_prologue(inner: &mut Inner) {
        inner.next_query = 0;
        if let Some(pool) = inner.query_pool {
            inner.recorder.push(Command::ResetQueries { pool, first: 0, count: pool.count });
            inner.recorder.push(Command::WriteTimestamp { pool, stage: PipelineStage::ALL_COMMANDS, query: 0 });
            inner.next_query = 1;
        }
    }

    fn record_into(&self, inner: &mut Inner, op: &Operation) -> Result<()> {
        let generation = op.algorithm().map(|a| (a.clone(), a.generation()));
        let mark = inner.recorder.len();
        if let Err(e) = op.record(&mut inner.recorder) {
            inner.recorder.truncate(mark);
            return Err(e);
        }
        if let Some(pool) = inner.query_pool {
            if inner.next_query < pool.count {
                inner.recorder.push(Command::WriteTimestamp {
                    pool,
                    stage: PipelineStage::ALL_COMMANDS,
                    query: inner.next_query,
                });
                inner.next_query += 1;
            } else {
                warn!(
                    "sequence #{}: timestamp pool full ({}), {} not timed",
                    self.id,
                    pool.count,
                    op.name()
                );
            }
        }
        if let Some(g) = generation {
            inner.generations.push(g);
        }
        Ok(())
    }

    /// Start a new recording, discarding any previous one.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.live_inner()?;
        match inner.state {
            SequenceState::Recording | SequenceState::Submitted => {
                return Err(wrong_state(inner.state, "begin recording"))
            }
            SequenceState::Idle | SequenceState::Recorded => {}
        }
        inner.recorder.clear();
        inner.operations.clear();
        inner.generations.clear();
        inner.has_recording = false;
        inner.timestamps_ready = false;
        Self::write_prologue(&mut inner);
        inner.state = SequenceState::Recording;
        trace!("sequence #{} recording", self.id);
        Ok(())
    }

    /// Append an operation. A failed operation leaves no commands behind.
    pub fn record(&self, op: Operation) -> Result<&Self> {
        let mut inner = self.live_inner()?;
        if inner.state != SequenceState::Recording {
            return Err(wrong_state(inner.state, "record"));
        }
        self.record_into(&mut inner, &op)?;
        trace!("sequence #{}: recorded {}", self.id, op.name());
        inner.operations.push(op);
        Ok(self)
    }

    /// Finish recording and commit the commands to the device command buffer.
    pub fn end(&self) -> Result<()> {
        let mut inner = self.live_inner()?;
        if inner.state != SequenceState::Recording {
            return Err(wrong_state(inner.state, "end recording"));
        }
        self.commit(&inner)?;
        inner.has_recording = true;
        inner.state = SequenceState::Recorded;
        debug!(
            "sequence #{}: recorded {} operations ({} commands)",
            self.id,
            inner.operations.len(),
            inner.recorder.len()
        );
        Ok(())
    }

    fn commit(&self, inner: &Inner) -> Result<()> {
        let cmd = inner
            .command_buffer
            .ok_or_else(|| ComputeError::InvalidResource(format!("sequence #{} has no command buffer", self.id)))?;
        self.device.record(&cmd, inner.recorder.commands())
    }

    fn hold_algorithms(inner: &mut Inner) {
        for (alg, _) in &inner.generations {
            if !inner.in_flight.iter().any(|held| Arc::ptr_eq(held, alg)) {
                alg.hold_submission();
                inner.in_flight.push(alg.clone());
            }
        }
    }

    fn release_algorithms(inner: &mut Inner) {
        for alg in inner.in_flight.drain(..) {
            alg.release_submission();
        }
    }

    fn rerecord(&self, inner: &mut Inner) -> Result<()> {
        debug!("sequence #{}: algorithm rebuilt since recording, recording again", self.id);
        inner.recorder.clear();
        inner.generations.clear();
        inner.has_recording = false;
        Self::write_prologue(inner);
        let operations = std::mem::take(&mut inner.operations);
        let result = operations.iter().try_for_each(|op| self.record_into(inner, op));
        inner.operations = operations;
        result?;
        self.commit(inner)?;
        inner.has_recording = true;
        Ok(())
    }

    /// Submit the recording without waiting.
    pub fn eval_async(&self) -> Result<()> {
        let mut inner = self.live_inner()?;
        match inner.state {
            SequenceState::Recorded => {}
            SequenceState::Idle if inner.has_recording => {}
            SequenceState::Idle => return Err(wrong_state(inner.state, "submit without a recording")),
            SequenceState::Recording | SequenceState::Submitted => {
                return Err(wrong_state(inner.state, "submit"))
            }
        }

        if inner.generations.iter().any(|(alg, seen)| alg.generation() != *seen) {
            self.rerecord(&mut inner)?;
        }
        for op in &inner.operations {
            op.pre_eval()?;
        }

        let (cmd, fence) = match (inner.command_buffer, inner.fence) {
            (Some(c), Some(f)) => (c, f),
            _ => return Err(ComputeError::InvalidResource(format!("sequence #{} is not initialized", self.id))),
        };
        self.device.reset_fence(&fence)?;
        self.device.submit(&self.queue, &cmd, &fence)?;
        Self::hold_algorithms(&mut inner);
        inner.timestamps_ready = false;
        inner.state = SequenceState::Submitted;
        trace!("sequence #{} submitted", self.id);
        Ok(())
    }

    /// Wait for the submitted work. On success the post-eval hooks run and the
    /// sequence goes back to `Idle`. On timeout it stays `Submitted` and can
    /// be awaited again. Outside `Submitted` this does nothing.
    pub fn eval_await(&self, timeout_ns: u64) -> Result<()> {
        let fence = {
            let inner = self.live_inner()?;
            if inner.state != SequenceState::Submitted {
                debug!("sequence #{}: eval_await while {}, nothing to wait for", self.id, inner.state.name());
                return Ok(());
            }
            inner
                .fence
                .ok_or_else(|| ComputeError::InvalidResource(format!("sequence #{} has no fence", self.id)))?
        };

        // Wait without holding the lock so is_running stays responsive.
        if !self.device.wait_fence(&fence, timeout_ns)? {
            return Err(ComputeError::Timeout(timeout_ns));
        }

        let mut inner = self.live_inner()?;
        if inner.state != SequenceState::Submitted {
            return Ok(());
        }
        Self::release_algorithms(&mut inner);
        for op in &inner.operations {
            op.post_eval();
        }
        inner.timestamps_ready = inner.query_pool.is_some();
        inner.state = SequenceState::Idle;
        trace!("sequence #{} complete", self.id);
        Ok(())
    }

    /// Submit and wait with no timeout.
    pub fn eval(&self) -> Result<()> {
        self.eval_async()?;
        self.eval_await(u64::MAX)
    }

    /// Record `op` as the whole sequence and run it.
    pub fn eval_op(&self, op: Operation) -> Result<&Self> {
        self.begin()?;
        self.record(op)?;
        self.end()?;
        self.eval()?;
        Ok(self)
    }

    /// Drop the recording and return to `Idle`.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.live_inner()?;
        if inner.state == SequenceState::Submitted {
            return Err(wrong_state(inner.state, "clear"));
        }
        inner.recorder.clear();
        inner.operations.clear();
        inner.generations.clear();
        inner.has_recording = false;
        inner.timestamps_ready = false;
        inner.state = SequenceState::Idle;
        Ok(())
    }

    /// Non-blocking: is submitted work still executing?
    pub fn is_running(&self) -> bool {
        let inner = self.inner();
        if inner.destroyed || inner.state != SequenceState::Submitted {
            return false;
        }
        match inner.fence {
            Some(fence) => !self.device.fence_status(&fence).unwrap_or(true),
            None => false,
        }
    }

    /// Timestamps in nanoseconds from the last completed evaluation: one
    /// for the start, then one per timed operation.
    pub fn timestamps(&self) -> Result<Vec<u64>> {
        let inner = self.live_inner()?;
        let pool = match inner.query_pool {
            Some(pool) if inner.timestamps_ready => pool,
            Some(_) => return Err(wrong_state(inner.state, "read timestamps before a completed eval")),
            None => return Err(ComputeError::InvalidResource(format!("sequence #{} has no timestamps", self.id))),
        };
        let period = self.device.timestamp_period() as f64;
        Ok(self
            .device
            .query_timestamps(&pool, 0, inner.next_query)?
            .into_iter()
            .map(|ticks| (ticks as f64 * period) as u64)
            .collect())
    }

    /// Time spent in each timed operation.
    pub fn operation_durations(&self) -> Result<Vec<Duration>> {
        let ts = self.timestamps()?;
        Ok(ts.windows(2).map(|w| Duration::from_nanos(w[1].saturating_sub(w[0]))).collect())
    }

    /// Time from the start timestamp to the last one.
    pub fn total_duration(&self) -> Result<Duration> {
        let ts = self.timestamps()?;
        Ok(match (ts.first(), ts.last()) {
            (Some(first), Some(last)) => Duration::from_nanos(last.saturating_sub(*first)),
            _ => Duration::ZERO,
        })
    }

    /// Wait for in-flight work, then free the command buffer, fence and
    /// query pool and drop all operation references. Safe to call twice.
    pub fn destroy(&self) {
        let mut inner = self.inner();
        if inner.destroyed {
            return;
        }
        if inner.state == SequenceState::Submitted {
            if let Some(fence) = inner.fence {
                if let Err(e) = self.device.wait_fence(&fence, u64::MAX) {
                    warn!("sequence #{}: wait before destroy failed: {e}", self.id);
                }
            }
        }
        Self::release_algorithms(&mut inner);
        if let Some(pool) = inner.query_pool.take() {
            self.device.destroy_query_pool(pool);
        }
        if let Some(fence) = inner.fence.take() {
            self.device.destroy_fence(fence);
        }
        if let Some(cmd) = inner.command_buffer.take() {
            self.device.destroy_command_buffer(cmd);
        }
        inner.recorder.clear();
        inner.operations.clear();
        inner.generations.clear();
        inner.has_recording = false;
        inner.state = SequenceState::Idle;
        inner.destroyed = true;
        debug!("sequence #{} destroyed", self.id);
    }
}

impl Destroy for Sequence {
    fn destroy(&self) {
        Sequence::destroy(self)
    }

    fn is_alive(&self) -> bool {
        !self.inner().destroyed
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        self.destroy();
    }
}
