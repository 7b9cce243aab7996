//! Dynamic recompiler.
//!
//! Guest code is translated one block at a time into Cranelift functions.
//! Every block gets two host functions: a checked entry that tests the cycle
//! budget and a normal entry holding the translated body. Blocks exit either
//! by tail-jumping into the checked entry of another block through the link
//! table or by returning an [`ExitReason`] to the dispatcher.

pub mod analysis;
pub mod block_cache;
pub mod compiler;
pub mod dispatcher;
pub mod exits;
pub mod regcache;

use cranelift::prelude::*;
use log::Level;

use crate::{
    cpu::{CpuState, Memory},
    mips::interpreter,
};

pub use block_cache::{
    BlockCache, BlockState, CacheError, ExitSlot, JitBlock, CODE_PAGE_SIZE, MAX_EXITS,
};
pub use dispatcher::DispatchState;

/// Free code space below which the cache is cleared before a new block is
/// compiled.
pub const CODE_SPACE_MARGIN: usize = 0x10000;

pub(crate) const EXIT_DISPATCH: i32 = 0;
pub(crate) const EXIT_SYSCALL: i32 = 1;
pub(crate) const EXIT_OUTER: i32 = 2;

/// Why compiled code handed control back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `pc` holds the next guest address to resolve.
    Dispatch,
    /// A SYSCALL retired; `pc` holds the address after it.
    Syscall,
    /// The cycle budget ran out at a checked entry; `pc` holds that block's
    /// start address.
    OuterLoop,
}

impl ExitReason {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            EXIT_DISPATCH => Some(Self::Dispatch),
            EXIT_SYSCALL => Some(Self::Syscall),
            EXIT_OUTER => Some(Self::OuterLoop),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JitOptions {
    /// Chain block exits directly into already compiled blocks.
    pub enable_block_link: bool,
    /// Longest block, in guest instructions, before a fall-through exit is
    /// forced. Delay slots do not count against it.
    pub max_block_instructions: usize,
    /// Host code budget in bytes.
    pub code_space: usize,
    pub max_blocks: usize,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            enable_block_link: true,
            max_block_instructions: 128,
            code_space: 16 << 20,
            max_blocks: 1 << 16,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JitStats {
    pub dispatches: u64,
    pub blocks_compiled: u64,
    pub cache_clears: u64,
    pub budget_exits: u64,
    pub syscall_exits: u64,
    pub dispatcher_exits: u64,
    /// Instructions compiled as calls into the interpreter.
    pub fallback_instructions: u64,
    /// Exit slots patched to jump straight into another block.
    pub linked_exits: u64,
}

/// Host entry point of a compiled block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry(*const u8);

impl BlockEntry {
    pub fn as_ptr(self) -> *const u8 {
        self.0
    }
}

impl std::fmt::Debug for BlockEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlockEntry({:p})", self.0)
    }
}

/// Host functions reachable from compiled code. Layout is read by
/// generated code.
#[repr(C)]
pub(crate) struct Callbacks {
    pub interpret: extern "C" fn(*mut CpuState, *mut Memory, u32),
    pub memory: *mut Memory,
}

extern "C" fn interpret(cpu: *mut CpuState, mem: *mut Memory, op: u32) {
    // SAFETY: compiled code passes the pointers it received from
    // `Jit::enter`, which borrows both mutably for the whole call, and
    // registers are flushed to `cpu` before this is called.
    unsafe { interpreter::interpret(&mut *cpu, &mut *mem, op) }
}

pub struct Jit {
    cache: BlockCache,
    ctx: codegen::Context,
    builder_ctx: FunctionBuilderContext,
    options: JitOptions,
    stats: JitStats,
    state: DispatchState,
}

impl Jit {
    pub fn new(options: JitOptions) -> anyhow::Result<Self> {
        let cache = BlockCache::new(options.max_blocks, options.code_space)?;
        Ok(Self {
            cache,
            ctx: codegen::Context::new(),
            builder_ctx: FunctionBuilderContext::new(),
            options,
            stats: JitStats::default(),
            state: DispatchState::Dispatching,
        })
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Normal entry of the finalized block starting at `addr`, if any.
    pub fn block_entry(&self, addr: u32) -> Option<BlockEntry> {
        let index = self.cache.get_block_number(addr)?;
        Some(BlockEntry(self.cache.block(index).normal_entry))
    }

    /// Drops every translation and link.
    pub fn clear_cache(&mut self) -> anyhow::Result<()> {
        self.cache.clear()?;
        self.stats.cache_clears += 1;
        Ok(())
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        if log::log_enabled!(Level::Info) {
            let s = &self.stats;
            log::info!("*** JIT stats:");
            log::info!("    dispatches:      {}", s.dispatches);
            log::info!("    blocks compiled: {}", s.blocks_compiled);
            log::info!("    cache clears:    {}", s.cache_clears);
            log::info!("    linked exits:    {}", s.linked_exits);
            log::info!("    fallback insts:  {}", s.fallback_instructions);
            log::info!(
                "    exits: dispatch={} syscall={} budget={}",
                s.dispatcher_exits,
                s.syscall_exits,
                s.budget_exits
            );
        }
    }
}
