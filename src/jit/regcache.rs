//! Guest register cache.
//!
//! Guest registers live in `CpuState::gpr`. While a block is compiled, a
//! register that has been read or written is bound to an SSA value; dirty
//! bindings are stored back on `flush_all`. Every flush unbinds everything,
//! and the compiler flushes before each interpreter call, syscall and block
//! exit, so no binding ever crosses a Cranelift block boundary.

use std::mem::offset_of;

use cranelift::prelude::*;

use super::analysis::Analysis;
use crate::cpu::CpuState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Unbound,
    Bound { value: Value, dirty: bool },
}

pub struct RegCache {
    regs: [Binding; 32],
    cpu: Value,
}

fn gpr_offset(r: usize) -> i32 {
    (offset_of!(CpuState, gpr) + r * 4) as i32
}

impl RegCache {
    /// `cpu` is the `*mut CpuState` parameter of the function being built.
    pub fn new(cpu: Value) -> Self {
        Self {
            regs: [Binding::Unbound; 32],
            cpu,
        }
    }

    /// Resets every binding and preloads the registers the block reads
    /// before writing them.
    pub fn start(&mut self, builder: &mut FunctionBuilder, hints: Option<&Analysis>) {
        self.regs = [Binding::Unbound; 32];

        if let Some(hints) = hints {
            for r in 1..32 {
                if hints.read_reg[r] {
                    self.read(builder, r);
                }
            }
        }
    }

    pub fn read(&mut self, builder: &mut FunctionBuilder, r: usize) -> Value {
        if r == 0 {
            return builder.ins().iconst(types::I32, 0);
        }
        match self.regs[r] {
            Binding::Bound { value, .. } => value,
            Binding::Unbound => {
                let value =
                    builder
                        .ins()
                        .load(types::I32, MemFlags::trusted(), self.cpu, gpr_offset(r));
                self.regs[r] = Binding::Bound {
                    value,
                    dirty: false,
                };
                value
            }
        }
    }

    /// Writes to `$zero` are dropped.
    pub fn write(&mut self, r: usize, value: Value) {
        if r != 0 {
            self.regs[r] = Binding::Bound { value, dirty: true };
        }
    }

    /// Stores every dirty binding and unbinds all registers. Returns the
    /// number of stores emitted.
    pub fn flush_all(&mut self, builder: &mut FunctionBuilder) -> usize {
        let mut stores = 0;
        for r in 1..32 {
            if let Binding::Bound { value, dirty: true } = self.regs[r] {
                builder
                    .ins()
                    .store(MemFlags::trusted(), value, self.cpu, gpr_offset(r));
                stores += 1;
            }
            self.regs[r] = Binding::Unbound;
        }
        stores
    }

    pub fn is_flushed(&self) -> bool {
        self.regs.iter().all(|b| *b == Binding::Unbound)
    }

    pub fn is_bound(&self, r: usize) -> bool {
        self.regs[r] != Binding::Unbound
    }

    pub fn is_dirty(&self, r: usize) -> bool {
        matches!(self.regs[r], Binding::Bound { dirty: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mips::asm::*;
    use codegen::ir::{Function, Opcode};

    fn build(f: impl FnOnce(&mut FunctionBuilder, Value)) -> Function {
        let mut sig = Signature::new(isa::CallConv::SystemV);
        sig.params.push(AbiParam::new(types::I64));
        let mut func = Function::new();
        func.signature = sig;
        let mut fctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut func, &mut fctx);
        let block = builder.create_block();
        builder.append_block_params_for_function_params(block);
        builder.switch_to_block(block);
        builder.seal_block(block);
        let cpu = builder.block_params(block)[0];
        f(&mut builder, cpu);
        builder.ins().return_(&[]);
        builder.finalize();
        func
    }

    fn count(func: &Function, opcode: Opcode) -> usize {
        func.layout
            .blocks()
            .flat_map(|b| func.layout.block_insts(b))
            .filter(|&i| func.dfg.insts[i].opcode() == opcode)
            .count()
    }

    #[test]
    fn reads_are_cached_until_flush() {
        let func = build(|b, cpu| {
            let mut regs = RegCache::new(cpu);
            regs.start(b, None);
            assert!(regs.is_flushed());

            let v1 = regs.read(b, 5);
            let v2 = regs.read(b, 5);
            assert_eq!(v1, v2);
            assert!(regs.is_bound(5));
            assert!(!regs.is_dirty(5));

            // clean bindings need no store
            assert_eq!(regs.flush_all(b), 0);
            assert!(regs.is_flushed());
            regs.read(b, 5);
        });
        assert_eq!(count(&func, Opcode::Load), 2);
        assert_eq!(count(&func, Opcode::Store), 0);
    }

    #[test]
    fn dirty_registers_are_written_back_once() {
        let func = build(|b, cpu| {
            let mut regs = RegCache::new(cpu);
            regs.start(b, None);
            let v = b.ins().iconst(types::I32, 7);
            regs.write(3, v);
            regs.write(4, v);
            regs.write(0, v);
            assert!(regs.is_dirty(3));
            assert!(!regs.is_bound(0));
            assert_eq!(regs.read(b, 3), v);

            assert_eq!(regs.flush_all(b), 2);
            assert!(regs.is_flushed());
            assert_eq!(regs.flush_all(b), 0);
        });
        assert_eq!(count(&func, Opcode::Store), 2);
        assert_eq!(count(&func, Opcode::Load), 0);
    }

    #[test]
    fn hints_preload_live_in_registers() {
        let code = [addu(3, 1, 2), addiu(1, 3, 1), sw(1, 29, 0)];
        let anal = Analysis::new(&code);
        let func = build(|b, cpu| {
            let mut regs = RegCache::new(cpu);
            regs.start(b, Some(&anal));
            assert!(regs.is_bound(1));
            assert!(regs.is_bound(2));
            assert!(regs.is_bound(29));
            assert!(!regs.is_bound(3));
            assert!(!regs.is_dirty(1));
        });
        assert_eq!(count(&func, Opcode::Load), 3);
    }
}
