//! Operations: the unit a sequence records.

use std::sync::Arc;

use bytemuck::Pod;

use crate::algorithm::Algorithm;
use crate::buffer::{BarrierTarget, Buffer};
use crate::command::{Access, CommandRecorder, PipelineStage};
use crate::device::BindingKind;
use crate::error::{ComputeError, Result};

/// A recordable step. Holds its resources alive while it sits in a
/// sequence but never destroys them.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Staging → primary for each buffer.
    SyncDevice(Vec<Arc<Buffer>>),
    /// Primary → staging for each buffer.
    SyncLocal(Vec<Arc<Buffer>>),
    /// Primary → primary.
    CopyBuffer { src: Arc<Buffer>, dst: Arc<Buffer> },
    /// Dispatch an algorithm, optionally overriding its parameter block.
    Dispatch { algorithm: Arc<Algorithm>, params: Option<Vec<u8>> },
    Barrier {
        buffers: Vec<Arc<Buffer>>,
        src_access: Access,
        dst_access: Access,
        src_stage: PipelineStage,
        dst_stage: PipelineStage,
        target: BarrierTarget,
    },
}

impl Operation {
    pub fn sync_device(buffers: Vec<Arc<Buffer>>) -> Self {
        Operation::SyncDevice(buffers)
    }

    pub fn sync_local(buffers: Vec<Arc<Buffer>>) -> Self {
        Operation::SyncLocal(buffers)
    }

    pub fn copy(src: Arc<Buffer>, dst: Arc<Buffer>) -> Result<Self> {
        if src.byte_len() != dst.byte_len() {
            return Err(ComputeError::SizeMismatch { expected: dst.byte_len(), actual: src.byte_len() });
        }
        Ok(Operation::CopyBuffer { src, dst })
    }

    pub fn dispatch(algorithm: Arc<Algorithm>) -> Self {
        Operation::Dispatch { algorithm, params: None }
    }

    pub fn dispatch_with<T: Pod>(algorithm: Arc<Algorithm>, params: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(params);
        if bytes.len() != algorithm.param_size() {
            return Err(ComputeError::SizeMismatch { expected: algorithm.param_size(), actual: bytes.len() });
        }
        Ok(Operation::Dispatch { algorithm, params: Some(bytes.to_vec()) })
    }

    pub fn barrier(
        buffers: Vec<Arc<Buffer>>,
        src_access: Access,
        dst_access: Access,
        src_stage: PipelineStage,
        dst_stage: PipelineStage,
        target: BarrierTarget,
    ) -> Self {
        Operation::Barrier { buffers, src_access, dst_access, src_stage, dst_stage, target }
    }

    /// Shader writes visible to the next dispatch's reads.
    pub fn compute_barrier(buffers: Vec<Arc<Buffer>>) -> Self {
        Self::barrier(
            buffers,
            Access::SHADER_WRITE,
            Access::SHADER_READ,
            PipelineStage::COMPUTE_SHADER,
            PipelineStage::COMPUTE_SHADER,
            BarrierTarget::Primary,
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::SyncDevice(_) => "SyncDevice",
            Operation::SyncLocal(_) => "SyncLocal",
            Operation::CopyBuffer { .. } => "CopyBuffer",
            Operation::Dispatch { .. } => "Dispatch",
            Operation::Barrier { .. } => "Barrier",
        }
    }

    pub(crate) fn algorithm(&self) -> Option<&Arc<Algorithm>> {
        match self {
            Operation::Dispatch { algorithm, .. } => Some(algorithm),
            _ => None,
        }
    }

    /// Append this operation's commands. On error the recorder may hold a
    /// partial tail; the caller truncates it.
    pub fn record(&self, rec: &mut CommandRecorder) -> Result<()> {
        match self {
            Operation::SyncDevice(buffers) => {
                buffers.iter().try_for_each(|b| b.record_sync_to_device(rec))
            }
            Operation::SyncLocal(buffers) => {
                buffers.iter().try_for_each(|b| b.record_sync_to_local(rec))
            }
            Operation::CopyBuffer { src, dst } => dst.record_copy_from(src, rec),
            Operation::Dispatch { algorithm, params } => {
                algorithm.record_dispatch(rec, params.as_deref())
            }
            Operation::Barrier { buffers, src_access, dst_access, src_stage, dst_stage, target } => {
                buffers.iter().try_for_each(|b| {
                    b.record_barrier(rec, *target, *src_access, *dst_access, *src_stage, *dst_stage)
                })
            }
        }
    }

    /// Runs on the host right before submission.
    pub fn pre_eval(&self) -> Result<()> {
        let dead = |b: &Arc<Buffer>| {
            ComputeError::InvalidResource(format!("{} references destroyed buffer #{}", self.name(), b.id()))
        };
        match self {
            Operation::SyncDevice(buffers) | Operation::SyncLocal(buffers) => {
                if let Some(b) = buffers.iter().find(|b| !b.is_allocated()) {
                    return Err(dead(b));
                }
            }
            Operation::Barrier { buffers, .. } => {
                if let Some(b) = buffers.iter().find(|b| !b.is_allocated()) {
                    return Err(dead(b));
                }
            }
            Operation::CopyBuffer { src, dst } => {
                if let Some(b) = [src, dst].into_iter().find(|b| !b.is_allocated()) {
                    return Err(dead(b));
                }
            }
            Operation::Dispatch { algorithm, .. } => {
                if !algorithm.is_init() {
                    return Err(ComputeError::InvalidResource(format!(
                        "Dispatch references destroyed algorithm #{}",
                        algorithm.id()
                    )));
                }
                if let Some(b) = algorithm.buffers().iter().find(|b| !b.is_allocated()) {
                    return Err(dead(b));
                }
            }
        }
        Ok(())
    }

    /// Runs on the host once the sequence's work has completed.
    pub fn post_eval(&self) {
        match self {
            Operation::SyncDevice(buffers) => buffers.iter().for_each(|b| b.mark_device_written()),
            Operation::SyncLocal(buffers) => buffers.iter().for_each(|b| b.mark_host_synced()),
            Operation::CopyBuffer { dst, .. } => dst.mark_device_written(),
            Operation::Dispatch { algorithm, .. } => algorithm
                .buffers()
                .iter()
                .filter(|b| b.role() == BindingKind::Storage)
                .for_each(|b| b.mark_device_written()),
            Operation::Barrier { .. } => {}
        }
    }
}
