//! Block table, address index, host code space and the link table.
//!
//! Exit slots never patch host code. Each block owns `MAX_EXITS` entries in
//! the link table; compiled exit code loads its entry and tail-jumps into
//! the pointed-to checked entry when it is non-null. Clearing the cache
//! zeroes the whole table together with the blocks and frees the module,
//! so no link can outlive its target.

use std::{collections::HashMap, mem::ManuallyDrop, ptr};

use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};

use super::Callbacks;
use crate::cpu::CpuState;

/// Exit slots per block: taken and not-taken.
pub const MAX_EXITS: usize = 2;

/// Granule the JIT module hands out executable memory in. Every
/// `finalize_definitions` starts a fresh allocation, so each block and the
/// trampoline occupy at least one.
pub const CODE_PAGE_SIZE: usize = 0x1000;

/// Host memory taken by `code_size` bytes finalized on their own.
fn footprint(code_size: usize) -> usize {
    code_size.max(1).next_multiple_of(CODE_PAGE_SIZE)
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("block table full ({0} blocks)")]
    CacheFull(usize),
    #[error("code space exhausted ({left:#x} bytes left)")]
    CodeBufferExhausted { left: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Compiling,
    Finalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSlot {
    pub dest: u32,
    /// Index into the link table.
    pub link: usize,
    pub linked: bool,
}

#[derive(Debug)]
pub struct JitBlock {
    pub start: u32,
    pub checked_entry: *const u8,
    pub normal_entry: *const u8,
    /// Host bytes of both entries.
    pub code_size: usize,
    /// Guest instructions translated, delay slots included.
    pub original_size: usize,
    /// Sum of the cycle estimates of every translated instruction.
    pub cycles: i32,
    pub exits: Vec<ExitSlot>,
    pub state: BlockState,
}

/// Output of the translation unit for one block.
pub(crate) struct BlockCode {
    pub checked_entry: *const u8,
    pub normal_entry: *const u8,
    pub code_size: usize,
    pub original_size: usize,
    pub cycles: i32,
    /// `(exit number, destination)` for every static exit written.
    pub exits: Vec<(usize, u32)>,
}

/// Host-side entry into compiled code. Calls a tail-convention block entry
/// with the remaining arguments and returns its exit code.
pub(crate) type EnterFn = unsafe extern "C" fn(
    cpu: *mut CpuState,
    mem_base: *mut u8,
    downcount: *mut i32,
    cb: *const Callbacks,
    links: *const *const u8,
    entry: *const u8,
) -> i32;

/// Signature shared by every checked and normal entry.
pub(crate) fn block_signature(pt: Type) -> Signature {
    let mut sig = Signature::new(isa::CallConv::Tail);
    // cpu, mem_base, downcount, cb, links
    sig.params.extend((0..5).map(|_| AbiParam::new(pt)));
    sig.returns.push(AbiParam::new(types::I32));
    sig
}

fn new_module() -> anyhow::Result<JITModule> {
    Ok(JITModule::new(JITBuilder::with_flags(
        &[
            ("opt_level", "speed"),
            ("preserve_frame_pointers", "true"),
            ("unwind_info", "false"),
        ],
        cranelift_module::default_libcall_names(),
    )?))
}

fn compile_trampoline(module: &mut JITModule) -> anyhow::Result<EnterFn> {
    let pt = module.target_config().pointer_type();
    let mut ctx = module.make_context();
    let mut builder_ctx = FunctionBuilderContext::new();

    ctx.func
        .signature
        .params
        .extend((0..6).map(|_| AbiParam::new(pt)));
    ctx.func.signature.returns.push(AbiParam::new(types::I32));

    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let params = builder.block_params(entry_block).to_vec();
    let sig = builder.import_signature(block_signature(pt));
    let call = builder.ins().call_indirect(sig, params[5], &params[..5]);
    let ret = builder.inst_results(call)[0];
    builder.ins().return_(&[ret]);
    builder.finalize();

    let id = module.declare_function("enter", Linkage::Local, &ctx.func.signature)?;
    module.define_function(id, &mut ctx)?;
    module.clear_context(&mut ctx);
    module.finalize_definitions()?;

    // SAFETY: the function was just defined with exactly the parameter and
    // return types of `EnterFn` in the platform's default convention.
    Ok(unsafe { std::mem::transmute::<*const u8, EnterFn>(module.get_finalized_function(id)) })
}

/// One Cranelift module and everything compiled into it.
struct CodeSpace {
    module: ManuallyDrop<JITModule>,
    enter: EnterFn,
    /// Page-rounded footprint of everything finalized into `module`.
    used: usize,
}

impl CodeSpace {
    fn new() -> anyhow::Result<Self> {
        let mut module = new_module()?;
        let enter = compile_trampoline(&mut module)?;
        log::debug!("*** JIT target ISA: {}", module.isa().triple());
        Ok(Self {
            module: ManuallyDrop::new(module),
            enter,
            used: CODE_PAGE_SIZE,
        })
    }
}

impl Drop for CodeSpace {
    fn drop(&mut self) {
        // SAFETY: the owning cache drops its blocks and zeroes the link
        // table before letting go of a code space, and compiled code never
        // runs while the cache is being mutated.
        unsafe { ManuallyDrop::take(&mut self.module).free_memory() }
    }
}

pub struct BlockCache {
    blocks: Vec<JitBlock>,
    index: HashMap<u32, usize>,
    /// Unlinked exits waiting for a block at the key address.
    links_to: HashMap<u32, Vec<(usize, usize)>>,
    links: Box<[*const u8]>,
    code: CodeSpace,
    max_blocks: usize,
    capacity: usize,
    generation: u64,
}

impl BlockCache {
    pub fn new(max_blocks: usize, capacity: usize) -> anyhow::Result<Self> {
        Ok(Self {
            blocks: Vec::new(),
            index: HashMap::new(),
            links_to: HashMap::new(),
            links: vec![ptr::null(); max_blocks * MAX_EXITS].into_boxed_slice(),
            code: CodeSpace::new()?,
            max_blocks,
            capacity,
            generation: 0,
        })
    }

    pub fn allocate_block(&mut self, addr: u32) -> Result<usize, CacheError> {
        if self.is_full() {
            return Err(CacheError::CacheFull(self.max_blocks));
        }
        debug_assert!(
            !self.index.contains_key(&addr),
            "block at {addr:08x} already compiled"
        );
        self.blocks.push(JitBlock {
            start: addr,
            checked_entry: ptr::null(),
            normal_entry: ptr::null(),
            code_size: 0,
            original_size: 0,
            cycles: 0,
            exits: vec![],
            state: BlockState::Compiling,
        });
        Ok(self.blocks.len() - 1)
    }

    /// Gives back the slot of a block whose translation failed. Only the
    /// latest allocation can be released, and it was never published.
    pub fn abort_block(&mut self, index: usize) {
        debug_assert_eq!(index + 1, self.blocks.len());
        debug_assert_eq!(self.blocks[index].state, BlockState::Compiling);
        self.blocks.truncate(index);
    }

    /// Publishes a compiled block and, when `enable_linking` is set, links
    /// its exits to compiled targets and pending exits of other blocks to
    /// it. Returns the number of exit slots linked.
    pub(crate) fn finalize_block(
        &mut self,
        index: usize,
        enable_linking: bool,
        code: BlockCode,
    ) -> usize {
        let block = &mut self.blocks[index];
        debug_assert_eq!(block.state, BlockState::Compiling);
        let start = block.start;

        block.checked_entry = code.checked_entry;
        block.normal_entry = code.normal_entry;
        block.code_size = code.code_size;
        block.original_size = code.original_size;
        block.cycles = code.cycles;
        block.exits = code
            .exits
            .iter()
            .map(|&(exit, dest)| ExitSlot {
                dest,
                link: index * MAX_EXITS + exit,
                linked: false,
            })
            .collect();
        block.state = BlockState::Finalized;
        self.code.used += footprint(code.code_size);
        self.index.insert(start, index);

        if !enable_linking {
            return 0;
        }

        let mut linked = 0;
        for exit in 0..self.blocks[index].exits.len() {
            let dest = self.blocks[index].exits[exit].dest;
            match self.index.get(&dest) {
                Some(&target) => {
                    self.link(index, exit, target);
                    linked += 1;
                }
                None => self.links_to.entry(dest).or_default().push((index, exit)),
            }
        }
        for (from, exit) in self.links_to.remove(&start).unwrap_or_default() {
            self.link(from, exit, index);
            linked += 1;
        }
        linked
    }

    fn link(&mut self, from: usize, exit: usize, target: usize) {
        let entry = self.blocks[target].checked_entry;
        let slot = &mut self.blocks[from].exits[exit];
        self.links[slot.link] = entry;
        slot.linked = true;
    }

    /// Finalized block starting at `addr`.
    pub fn get_block_number(&self, addr: u32) -> Option<usize> {
        self.index.get(&addr).copied()
    }

    pub fn block(&self, index: usize) -> &JitBlock {
        &self.blocks[index]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.max_blocks
    }

    pub fn space_left(&self) -> usize {
        self.capacity.saturating_sub(self.code.used)
    }

    /// Number of times the cache has been cleared.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fails when a new block should not be started without clearing the
    /// cache first.
    pub fn check_capacity(&self, margin: usize) -> Result<(), CacheError> {
        if self.is_full() {
            return Err(CacheError::CacheFull(self.max_blocks));
        }
        let left = self.space_left();
        if left < margin {
            return Err(CacheError::CodeBufferExhausted { left });
        }
        Ok(())
    }

    pub fn link_target(&self, slot: usize) -> *const u8 {
        self.links[slot]
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        let fresh = CodeSpace::new()?;
        log::info!(
            "*** Clearing block cache: {} blocks, {:#x} bytes of code",
            self.blocks.len(),
            self.code.used
        );
        self.blocks.clear();
        self.index.clear();
        self.links_to.clear();
        self.links.fill(ptr::null());
        self.code = fresh;
        self.generation += 1;
        Ok(())
    }

    pub(crate) fn module(&mut self) -> &mut JITModule {
        &mut self.code.module
    }

    pub(crate) fn enter_fn(&self) -> EnterFn {
        self.code.enter
    }

    pub(crate) fn links_ptr(&self) -> *const *const u8 {
        self.links.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_code(entry: usize, exits: Vec<(usize, u32)>) -> BlockCode {
        BlockCode {
            checked_entry: entry as *const u8,
            normal_entry: (entry + 0x10) as *const u8,
            code_size: 0x100,
            original_size: 4,
            cycles: 4,
            exits,
        }
    }

    #[test]
    fn finalize_publishes_address() {
        let mut cache = BlockCache::new(8, 1 << 20).unwrap();
        let b = cache.allocate_block(0x100).unwrap();
        assert_eq!(cache.get_block_number(0x100), None);
        assert_eq!(cache.block(b).state, BlockState::Compiling);

        cache.finalize_block(b, true, fake_code(0x1000, vec![(0, 0x200)]));
        assert_eq!(cache.get_block_number(0x100), Some(b));
        assert_eq!(cache.block(b).state, BlockState::Finalized);
        // one page for the trampoline, one for the block
        assert_eq!(cache.space_left(), (1 << 20) - 2 * CODE_PAGE_SIZE);
    }

    #[test]
    fn aborted_block_frees_its_slot() {
        let mut cache = BlockCache::new(1, 1 << 20).unwrap();
        let b = cache.allocate_block(0x100).unwrap();
        assert!(cache.is_full());

        cache.abort_block(b);
        assert_eq!(cache.num_blocks(), 0);
        assert!(!cache.is_full());
        assert_eq!(cache.get_block_number(0x100), None);

        let b = cache.allocate_block(0x100).unwrap();
        cache.finalize_block(b, true, fake_code(0x1000, vec![]));
        assert_eq!(cache.get_block_number(0x100), Some(0));
    }

    #[test]
    fn pending_exits_link_when_target_appears() {
        let mut cache = BlockCache::new(8, 1 << 20).unwrap();
        let a = cache.allocate_block(0x100).unwrap();
        assert_eq!(
            cache.finalize_block(a, true, fake_code(0x1000, vec![(0, 0x200), (1, 0x108)])),
            0
        );
        assert!(cache.link_target(a * MAX_EXITS).is_null());

        let b = cache.allocate_block(0x200).unwrap();
        assert_eq!(cache.finalize_block(b, true, fake_code(0x2000, vec![])), 1);
        assert_eq!(cache.link_target(a * MAX_EXITS), 0x2000 as *const u8);
        assert!(cache.block(a).exits[0].linked);
        assert!(!cache.block(a).exits[1].linked);
        assert!(cache.link_target(a * MAX_EXITS + 1).is_null());
    }

    #[test]
    fn self_loop_links_to_own_checked_entry() {
        let mut cache = BlockCache::new(8, 1 << 20).unwrap();
        let a = cache.allocate_block(0x100).unwrap();
        let linked = cache.finalize_block(a, true, fake_code(0x1000, vec![(0, 0x100)]));
        assert_eq!(linked, 1);
        assert_eq!(cache.link_target(a * MAX_EXITS), 0x1000 as *const u8);
    }

    #[test]
    fn linking_disabled_leaves_slots_empty() {
        let mut cache = BlockCache::new(8, 1 << 20).unwrap();
        let a = cache.allocate_block(0x100).unwrap();
        cache.finalize_block(a, false, fake_code(0x1000, vec![(0, 0x100)]));
        assert!(cache.link_target(a * MAX_EXITS).is_null());
        assert!(!cache.block(a).exits[0].linked);
    }

    #[test]
    fn full_table_and_clear() {
        let mut cache = BlockCache::new(2, 1 << 20).unwrap();
        for (i, addr) in [0x100, 0x200].into_iter().enumerate() {
            let b = cache.allocate_block(addr).unwrap();
            cache.finalize_block(b, true, fake_code(0x1000 * (i + 1), vec![(0, 0x100)]));
        }
        assert!(cache.is_full());
        assert!(matches!(cache.allocate_block(0x300), Err(CacheError::CacheFull(2))));
        assert!(matches!(cache.check_capacity(0), Err(CacheError::CacheFull(_))));

        cache.clear().unwrap();
        assert_eq!(cache.generation(), 1);
        assert_eq!(cache.num_blocks(), 0);
        assert_eq!(cache.get_block_number(0x100), None);
        assert!(cache.link_target(0).is_null());
        assert!(cache.link_target(MAX_EXITS).is_null());
        assert_eq!(cache.space_left(), (1 << 20) - CODE_PAGE_SIZE);
        assert!(cache.check_capacity(0x1000).is_ok());
    }

    #[test]
    fn low_code_space_is_reported() {
        let mut cache = BlockCache::new(8, 3 * CODE_PAGE_SIZE).unwrap();
        let b = cache.allocate_block(0x100).unwrap();
        cache.finalize_block(b, true, fake_code(0x1000, vec![]));
        assert!(matches!(
            cache.check_capacity(2 * CODE_PAGE_SIZE),
            Err(CacheError::CodeBufferExhausted { left: CODE_PAGE_SIZE })
        ));
    }

    #[test]
    fn blocks_are_charged_whole_pages() {
        assert_eq!(footprint(0), CODE_PAGE_SIZE);
        assert_eq!(footprint(0x100), CODE_PAGE_SIZE);
        assert_eq!(footprint(CODE_PAGE_SIZE + 1), 2 * CODE_PAGE_SIZE);

        let mut cache = BlockCache::new(64, 8 * CODE_PAGE_SIZE).unwrap();
        for i in 0..7 {
            let b = cache.allocate_block(0x100 * (i + 1)).unwrap();
            cache.finalize_block(b, true, fake_code(0x1000, vec![]));
        }
        assert_eq!(cache.space_left(), 0);
        assert!(matches!(
            cache.check_capacity(1),
            Err(CacheError::CodeBufferExhausted { left: 0 })
        ));
    }
}
