//! Backend-neutral command list.
//!
//! Operations record into a [`CommandRecorder`]; a [`Device`](crate::device::Device)
//! turns the finished list into its own command buffer. Stage and access
//! flags carry the Vulkan bit values so the Vulkan backend can pass them
//! straight through.

use bitflags::bitflags;

use crate::device::{BindingTableHandle, BufferHandle, PipelineHandle, QueryPoolHandle};

bitflags! {
    /// Pipeline stages an execution dependency waits on or blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStage: u32 {
        const TOP_OF_PIPE = 0x1;
        const COMPUTE_SHADER = 0x800;
        const TRANSFER = 0x1000;
        const BOTTOM_OF_PIPE = 0x2000;
        const HOST = 0x4000;
        const ALL_COMMANDS = 0x10000;
    }
}

bitflags! {
    /// Memory accesses made visible or available by a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u32 {
        const UNIFORM_READ = 0x8;
        const SHADER_READ = 0x20;
        const SHADER_WRITE = 0x40;
        const TRANSFER_READ = 0x800;
        const TRANSFER_WRITE = 0x1000;
        const HOST_READ = 0x2000;
        const HOST_WRITE = 0x4000;
        const MEMORY_READ = 0x8000;
        const MEMORY_WRITE = 0x10000;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    },
    Dispatch {
        pipeline: PipelineHandle,
        table: BindingTableHandle,
        push_constants: Vec<u8>,
        groups: [u32; 3],
    },
    Barrier {
        buffers: Vec<BufferHandle>,
        src_access: Access,
        dst_access: Access,
        src_stage: PipelineStage,
        dst_stage: PipelineStage,
    },
    ResetQueries {
        pool: QueryPoolHandle,
        first: u32,
        count: u32,
    },
    WriteTimestamp {
        pool: QueryPoolHandle,
        stage: PipelineStage,
        query: u32,
    },
}

/// Ordered command list built up by operations while a sequence records.
#[derive(Debug, Default, Clone)]
pub struct CommandRecorder {
    commands: Vec<Command>,
}

impl CommandRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop everything recorded after `len`. Used to undo a failed operation.
    pub fn truncate(&mut self, len: usize) {
        self.commands.truncate(len);
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}
