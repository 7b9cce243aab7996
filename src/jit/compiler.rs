//! Translation unit: turns one guest block into its normal entry (the
//! body) and its checked entry (budget test in front of the body).

use std::mem::offset_of;

use codegen::ir::{Endianness, FuncRef, Function, SigRef};
use cranelift::prelude::*;
use cranelift_module::{Linkage, Module};
use log::{log_enabled, Level};

use super::{
    analysis::{scan_block, Analysis},
    block_cache::{block_signature, BlockCode},
    regcache::RegCache,
    Callbacks, Jit, CODE_SPACE_MARGIN, EXIT_OUTER,
};
use crate::{
    cpu::{CpuState, Memory},
    mips::{disasm::disasm, *},
};

pub(super) fn iconst32(builder: &mut FunctionBuilder, v: u32) -> Value {
    builder.ins().iconst(types::I32, v as i64)
}

/// Guest memory is little-endian regardless of the host.
fn guest_mem() -> MemFlags {
    MemFlags::new().with_endianness(Endianness::Little)
}

pub(super) struct TranslationUnit<'a> {
    pub(super) builder: FunctionBuilder<'a>,
    pub(super) regs: RegCache,

    code: Vec<u32>,
    cursor: usize,
    mem_mask: u32,
    pub(super) pt: Type,
    pub(super) block_index: usize,

    /// Address of the instruction being compiled.
    pub(super) compiler_pc: u32,
    /// Cycles accumulated on the current path and not yet subtracted.
    pub(super) downcount_amount: i32,
    pub(super) compiling: bool,
    pub(super) exits: Vec<(usize, u32)>,
    fallbacks: usize,

    pub(super) param_cpu: Value,
    param_mem_base: Value,
    pub(super) param_downcount: Value,
    param_cb: Value,
    pub(super) param_links: Value,

    pub(super) block_sig: SigRef,
    /// Signature, function and memory pointer of the interpreter callback.
    interp: Option<(SigRef, Value, Value)>,
}

impl<'a> TranslationUnit<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        func: &'a mut Function,
        builder_ctx: &'a mut FunctionBuilderContext,
        code: Vec<u32>,
        start: u32,
        block_index: usize,
        pt: Type,
        host_call_conv: isa::CallConv,
        mem_mask: u32,
    ) -> Self {
        let anal = Analysis::new(&code);

        func.signature = block_signature(pt);
        let mut builder = FunctionBuilder::new(func, builder_ctx);

        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let params = builder.block_params(entry_block).to_vec();
        let (param_cpu, param_mem_base, param_downcount, param_cb, param_links) =
            (params[0], params[1], params[2], params[3], params[4]);

        let block_sig = builder.import_signature(block_signature(pt));

        let interp = anal.call_interpret.then(|| {
            let sig = builder.import_signature(Signature {
                params: vec![
                    AbiParam::new(pt),
                    AbiParam::new(pt),
                    AbiParam::new(types::I32),
                ],
                returns: vec![],
                call_conv: host_call_conv,
            });
            let func = builder.ins().load(
                pt,
                MemFlags::trusted(),
                param_cb,
                offset_of!(Callbacks, interpret) as i32,
            );
            let mem = builder.ins().load(
                pt,
                MemFlags::trusted(),
                param_cb,
                offset_of!(Callbacks, memory) as i32,
            );
            (sig, func, mem)
        });

        let mut regs = RegCache::new(param_cpu);
        regs.start(&mut builder, Some(&anal));

        Self {
            builder,
            regs,
            code,
            cursor: 0,
            mem_mask,
            pt,
            block_index,
            compiler_pc: start,
            downcount_amount: 0,
            compiling: true,
            exits: vec![],
            fallbacks: 0,
            param_cpu,
            param_mem_base,
            param_downcount,
            param_cb,
            param_links,
            block_sig,
            interp,
        }
    }

    /// Block parameters in signature order, for tail calls.
    pub(super) fn params(&self) -> [Value; 5] {
        [
            self.param_cpu,
            self.param_mem_base,
            self.param_downcount,
            self.param_cb,
            self.param_links,
        ]
    }

    pub(super) fn iconst(&mut self, v: u32) -> Value {
        iconst32(&mut self.builder, v)
    }

    pub(super) fn store_pc(&mut self, pc: Value) {
        self.builder.ins().store(
            MemFlags::trusted(),
            pc,
            self.param_cpu,
            offset_of!(CpuState, pc) as i32,
        );
    }

    fn compile_body(&mut self) {
        while self.compiling && self.cursor < self.code.len() {
            let op = self.code[self.cursor];
            self.downcount_amount += cycle_estimate(op);
            self.compile_op(op);
            self.cursor += 1;
            self.compiler_pc = self.compiler_pc.wrapping_add(4);
        }

        if self.compiling {
            // Instruction limit reached: fall through into the next block.
            self.write_exit(self.compiler_pc, 0);
            self.compiling = false;
        }
        debug_assert!(self.regs.is_flushed());
    }

    fn finish(self) -> (Vec<(usize, u32)>, usize) {
        self.builder.finalize();
        (self.exits, self.fallbacks)
    }

    fn compile_op(&mut self, op: u32) {
        match comp_op(op) {
            CompOp::ImmArith => self.comp_imm_arith(op),
            CompOp::RType => self.comp_rtype(op),
            CompOp::ShiftImm => self.comp_shift_imm(op),
            CompOp::ShiftVar => self.comp_shift_var(op),
            CompOp::Load => self.comp_load(op),
            CompOp::Store => self.comp_store(op),
            CompOp::Branch | CompOp::RegImm => self.comp_branch(op),
            CompOp::Jump => self.comp_jump(op),
            CompOp::JumpReg => self.comp_jump_reg(op),
            CompOp::Syscall => {
                self.write_syscall_exit();
                self.compiling = false;
            }
            CompOp::Generic => self.comp_generic(op),
        }
    }

    fn read(&mut self, r: usize) -> Value {
        self.regs.read(&mut self.builder, r)
    }

    fn set_cc(&mut self, cc: IntCC, a: Value, b: Value) -> Value {
        let c = self.builder.ins().icmp(cc, a, b);
        self.builder.ins().uextend(types::I32, c)
    }

    fn comp_imm_arith(&mut self, op: u32) {
        let rt = rt(op);
        if rt == 0 {
            return;
        }

        let v = if opcode(op) == 0x0f {
            self.iconst(imm16(op) << 16)
        } else {
            let s = self.read(rs(op));
            match opcode(op) {
                0x08 | 0x09 => {
                    let c = self.iconst(simm16(op));
                    self.builder.ins().iadd(s, c)
                }
                0x0a => {
                    let c = self.iconst(simm16(op));
                    self.set_cc(IntCC::SignedLessThan, s, c)
                }
                0x0b => {
                    let c = self.iconst(simm16(op));
                    self.set_cc(IntCC::UnsignedLessThan, s, c)
                }
                0x0c => {
                    let c = self.iconst(imm16(op));
                    self.builder.ins().band(s, c)
                }
                0x0d => {
                    let c = self.iconst(imm16(op));
                    self.builder.ins().bor(s, c)
                }
                _ => {
                    let c = self.iconst(imm16(op));
                    self.builder.ins().bxor(s, c)
                }
            }
        };
        self.regs.write(rt, v);
    }

    fn comp_rtype(&mut self, op: u32) {
        let rd = rd(op);
        if rd == 0 {
            return;
        }

        let s = self.read(rs(op));
        let t = self.read(rt(op));
        let v = match funct(op) {
            0x20 | 0x21 => self.builder.ins().iadd(s, t),
            0x22 | 0x23 => self.builder.ins().isub(s, t),
            0x24 => self.builder.ins().band(s, t),
            0x25 => self.builder.ins().bor(s, t),
            0x26 => self.builder.ins().bxor(s, t),
            0x27 => {
                let v = self.builder.ins().bor(s, t);
                self.builder.ins().bnot(v)
            }
            0x2a => self.set_cc(IntCC::SignedLessThan, s, t),
            _ => self.set_cc(IntCC::UnsignedLessThan, s, t),
        };
        self.regs.write(rd, v);
    }

    fn comp_shift_imm(&mut self, op: u32) {
        let rd = rd(op);
        if rd == 0 {
            return;
        }

        let t = self.read(rt(op));
        let sa = self.iconst(sa(op));
        let v = match funct(op) {
            0x00 => self.builder.ins().ishl(t, sa),
            0x02 => self.builder.ins().ushr(t, sa),
            _ => self.builder.ins().sshr(t, sa),
        };
        self.regs.write(rd, v);
    }

    /// Cranelift masks shift amounts to the type width, matching the guest.
    fn comp_shift_var(&mut self, op: u32) {
        let rd = rd(op);
        if rd == 0 {
            return;
        }

        let t = self.read(rt(op));
        let s = self.read(rs(op));
        let v = match funct(op) {
            0x04 => self.builder.ins().ishl(t, s),
            0x06 => self.builder.ins().ushr(t, s),
            _ => self.builder.ins().sshr(t, s),
        };
        self.regs.write(rd, v);
    }

    /// Host address of `rs + simm16`, masked into guest memory and aligned
    /// down to `align` bytes.
    fn guest_addr(&mut self, op: u32, align: u32) -> Value {
        let base = self.read(rs(op));
        let offset = self.iconst(simm16(op));
        let addr = self.builder.ins().iadd(base, offset);
        let mask = self.iconst(self.mem_mask & !(align - 1));
        let addr = self.builder.ins().band(addr, mask);
        let addr = self.builder.ins().uextend(self.pt, addr);
        self.builder.ins().iadd(self.param_mem_base, addr)
    }

    fn comp_load(&mut self, op: u32) {
        let rt = rt(op);
        if rt == 0 {
            return;
        }

        let o = opcode(op);
        let align = match o {
            0x20 | 0x24 => 1,
            0x21 | 0x25 => 2,
            _ => 4,
        };
        let p = self.guest_addr(op, align);
        let ins = self.builder.ins();
        let v = match o {
            0x20 => ins.sload8(types::I32, guest_mem(), p, 0),
            0x24 => ins.uload8(types::I32, guest_mem(), p, 0),
            0x21 => ins.sload16(types::I32, guest_mem(), p, 0),
            0x25 => ins.uload16(types::I32, guest_mem(), p, 0),
            _ => ins.load(types::I32, guest_mem(), p, 0),
        };
        self.regs.write(rt, v);
    }

    fn comp_store(&mut self, op: u32) {
        let t = self.read(rt(op));
        match opcode(op) {
            0x28 => {
                let p = self.guest_addr(op, 1);
                self.builder.ins().istore8(guest_mem(), t, p, 0);
            }
            0x29 => {
                let p = self.guest_addr(op, 2);
                self.builder.ins().istore16(guest_mem(), t, p, 0);
            }
            _ => {
                let p = self.guest_addr(op, 4);
                self.builder.ins().store(guest_mem(), t, p, 0);
            }
        }
    }

    /// Compiles the instruction after the current one in place. Control
    /// transfers there are skipped but still charged.
    fn compile_delay_slot(&mut self) {
        let op = self.code.get(self.cursor + 1).copied().unwrap_or(0);
        let pc = self.compiler_pc;
        self.compiler_pc = pc.wrapping_add(4);
        self.downcount_amount += cycle_estimate(op);
        if comp_op(op).ends_block() {
            log::warn!(
                "Ignoring {op:08x} in delay slot at {:08x}",
                self.compiler_pc
            );
        } else {
            self.compile_op(op);
        }
        self.compiler_pc = pc;
    }

    fn comp_branch(&mut self, op: u32) {
        let pc = self.compiler_pc;
        let target = branch_target(op, pc);
        let s = self.read(rs(op));

        let cond = if comp_op(op) == CompOp::Branch {
            let (cc, t) = match opcode(op) & 3 {
                0 => (IntCC::Equal, self.read(rt(op))),
                1 => (IntCC::NotEqual, self.read(rt(op))),
                2 => (IntCC::SignedLessThanOrEqual, self.iconst(0)),
                _ => (IntCC::SignedGreaterThan, self.iconst(0)),
            };
            self.builder.ins().icmp(cc, s, t)
        } else {
            let zero = self.iconst(0);
            let cc = if rt(op) & 1 == 0 {
                IntCC::SignedLessThan
            } else {
                IntCC::SignedGreaterThanOrEqual
            };
            let cond = self.builder.ins().icmp(cc, s, zero);
            if rt(op) & 0x10 != 0 {
                let link = self.iconst(pc.wrapping_add(8));
                self.regs.write(REG_RA, link);
            }
            cond
        };

        let likely = is_likely(op);
        if !likely {
            self.compile_delay_slot();
        }
        self.regs.flush_all(&mut self.builder);

        let taken = self.builder.create_block();
        let not_taken = self.builder.create_block();
        self.builder.ins().brif(cond, taken, &[], not_taken, &[]);
        self.builder.seal_block(taken);
        self.builder.seal_block(not_taken);

        self.builder.switch_to_block(not_taken);
        self.write_exit(pc.wrapping_add(8), 1);

        self.builder.switch_to_block(taken);
        if likely {
            self.compile_delay_slot();
        }
        self.write_exit(target, 0);

        self.compiling = false;
    }

    fn comp_jump(&mut self, op: u32) {
        let pc = self.compiler_pc;
        if opcode(op) == 0x03 {
            let link = self.iconst(pc.wrapping_add(8));
            self.regs.write(REG_RA, link);
        }
        self.compile_delay_slot();
        self.write_exit(jump_target(op, pc), 0);
        self.compiling = false;
    }

    fn comp_jump_reg(&mut self, op: u32) {
        let pc = self.compiler_pc;
        let target = self.read(rs(op));
        if funct(op) == 0x09 {
            let link = self.iconst(pc.wrapping_add(8));
            self.regs.write(rd(op), link);
        }
        self.compile_delay_slot();
        self.write_exit_dest_in_reg(target);
        self.compiling = false;
    }

    /// Runs one instruction through the interpreter. The block goes on
    /// afterwards with every register unbound.
    fn comp_generic(&mut self, op: u32) {
        self.regs.flush_all(&mut self.builder);
        let pc = self.iconst(self.compiler_pc);
        self.store_pc(pc);

        let (sig, func, mem) = self.interp.expect("fallback missed by block analysis");
        let op = self.iconst(op);
        self.builder
            .ins()
            .call_indirect(sig, func, &[self.param_cpu, mem, op]);
        self.fallbacks += 1;
    }
}

/// Budget test in front of the body. When the budget is gone, `pc` is set
/// to the block start and control returns to the outer loop.
fn build_checked_entry(
    func: &mut Function,
    builder_ctx: &mut FunctionBuilderContext,
    body: FuncRef,
    start: u32,
) {
    let mut builder = FunctionBuilder::new(func, builder_ctx);
    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let params = builder.block_params(entry_block).to_vec();
    let (cpu, downcount) = (params[0], params[2]);

    let dc = builder
        .ins()
        .load(types::I32, MemFlags::trusted(), downcount, 0);
    let exhausted = builder.ins().icmp_imm(IntCC::SignedLessThan, dc, 0);

    let out = builder.create_block();
    let run = builder.create_block();
    builder.set_cold_block(out);
    builder.ins().brif(exhausted, out, &[], run, &[]);
    builder.seal_block(out);
    builder.seal_block(run);

    builder.switch_to_block(run);
    builder.ins().return_call(body, &params);

    builder.switch_to_block(out);
    let pc = iconst32(&mut builder, start);
    builder.ins().store(
        MemFlags::trusted(),
        pc,
        cpu,
        offset_of!(CpuState, pc) as i32,
    );
    let ret = iconst32(&mut builder, EXIT_OUTER as u32);
    builder.ins().return_(&[ret]);

    builder.finalize();
}

impl Jit {
    /// Translates the block at `addr` and publishes it. Returns the block
    /// number.
    ///
    /// The cache is cleared first when it is out of block slots or close to
    /// its code budget.
    pub fn compile(&mut self, mem: &Memory, addr: u32) -> anyhow::Result<usize> {
        if let Some(index) = self.cache.get_block_number(addr) {
            return Ok(index);
        }
        if let Err(e) = self.cache.check_capacity(CODE_SPACE_MARGIN) {
            log::info!("*** {e}, clearing block cache");
            self.clear_cache()?;
        }
        let index = self.cache.allocate_block(addr)?;

        let (code, fallbacks) = match self.translate(mem, addr, index) {
            Ok(code) => code,
            Err(e) => {
                log::warn!("*** Failed to compile block at {addr:08x}: {e}");
                // The module may still hold entries named after `addr`.
                self.cache.abort_block(index);
                self.ctx.clear();
                self.clear_cache()?;
                return Err(e);
            }
        };

        let num_exits = code.exits.len();
        let code_size = code.code_size;
        let linked = self
            .cache
            .finalize_block(index, self.options.enable_block_link, code);

        self.stats.blocks_compiled += 1;
        self.stats.fallback_instructions += fallbacks as u64;
        self.stats.linked_exits += linked as u64;

        log::debug!(
            "*** Block #{index} at {addr:08x}: {code_size} bytes, {num_exits} exits, {linked} linked"
        );

        Ok(index)
    }

    /// Emits both entries of the block at `addr` and finalizes them. Returns
    /// the block's code and its number of interpreter fallbacks.
    fn translate(
        &mut self,
        mem: &Memory,
        addr: u32,
        index: usize,
    ) -> anyhow::Result<(BlockCode, usize)> {
        let code = scan_block(mem, addr, self.options.max_block_instructions);
        let original_size = code.len();
        let cycles = code.iter().map(|&op| cycle_estimate(op)).sum();

        if log_enabled!(Level::Debug) {
            log::debug!("*** JIT compiling block #{index} at {addr:08x} ({original_size} insts)");
            for line in disasm(addr, &code) {
                log::debug!("    {line}");
            }
        }

        let module = self.cache.module();
        let pt = module.target_config().pointer_type();
        let host_call_conv = module.isa().default_call_conv();

        module.clear_context(&mut self.ctx);
        let mut unit = TranslationUnit::new(
            &mut self.ctx.func,
            &mut self.builder_ctx,
            code,
            addr,
            index,
            pt,
            host_call_conv,
            mem.mask(),
        );
        unit.compile_body();
        let (exits, fallbacks) = unit.finish();

        let normal_id = module.declare_function(
            &format!("blk_{addr:08x}"),
            Linkage::Local,
            &self.ctx.func.signature,
        )?;
        if log_enabled!(Level::Trace) {
            self.ctx.set_disasm(true);
        }
        module.define_function(normal_id, &mut self.ctx)?;
        let mut code_size = self
            .ctx
            .compiled_code()
            .map_or(0, |c| c.code_buffer().len());
        if log_enabled!(Level::Trace) {
            if let Some(vcode) = self.ctx.compiled_code().and_then(|c| c.vcode.as_ref()) {
                log::trace!("*** Generated Assembly:");
                log::trace!("{vcode}");
            }
        }
        module.clear_context(&mut self.ctx);

        self.ctx.func.signature = block_signature(pt);
        let body = module.declare_func_in_func(normal_id, &mut self.ctx.func);
        build_checked_entry(&mut self.ctx.func, &mut self.builder_ctx, body, addr);
        let checked_id = module.declare_function(
            &format!("chk_{addr:08x}"),
            Linkage::Local,
            &self.ctx.func.signature,
        )?;
        module.define_function(checked_id, &mut self.ctx)?;
        code_size += self
            .ctx
            .compiled_code()
            .map_or(0, |c| c.code_buffer().len());
        module.clear_context(&mut self.ctx);

        module.finalize_definitions()?;

        let checked_entry = module.get_finalized_function(checked_id);
        let normal_entry = module.get_finalized_function(normal_id);

        Ok((
            BlockCode {
                checked_entry,
                normal_entry,
                code_size,
                original_size,
                cycles,
                exits,
            },
            fallbacks,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        jit::{BlockState, JitOptions},
        mips::asm::*,
    };

    fn memory(prog: &[u32]) -> Memory {
        let mut mem = Memory::new(0x10000).unwrap();
        mem.load_words(0x1000, prog);
        mem
    }

    #[test]
    fn compile_of_cached_address_returns_same_block() {
        let mem = memory(&[jr(31), nop()]);
        let mut jit = Jit::new(JitOptions::default()).unwrap();

        let first = jit.compile(&mem, 0x1000).unwrap();
        assert_eq!(jit.compile(&mem, 0x1000).unwrap(), first);
        assert_eq!(jit.cache().num_blocks(), 1);
        assert_eq!(jit.stats().blocks_compiled, 1);
    }

    #[test]
    fn failed_compile_gives_back_its_slot() {
        let mem = memory(&[jr(31), nop()]);
        let mut jit = Jit::new(JitOptions {
            max_blocks: 1,
            ..Default::default()
        })
        .unwrap();

        // A clashing declaration makes the body fail to declare.
        let module = jit.cache.module();
        let sig = Signature::new(module.isa().default_call_conv());
        module
            .declare_function("blk_00001000", Linkage::Local, &sig)
            .unwrap();

        assert!(jit.compile(&mem, 0x1000).is_err());
        assert_eq!(jit.cache().num_blocks(), 0);
        assert_eq!(jit.cache().get_block_number(0x1000), None);
        assert_eq!(jit.stats().blocks_compiled, 0);

        let index = jit.compile(&mem, 0x1000).unwrap();
        assert_eq!(index, 0);
        assert_eq!(jit.cache().block(index).state, BlockState::Finalized);
        assert_eq!(jit.stats().blocks_compiled, 1);
    }
}
