//! Block exits.
//!
//! Every exit flushes the register cache and charges the cycles of the path
//! that led to it before control leaves the block.

use cranelift::prelude::*;

use super::{compiler::TranslationUnit, EXIT_DISPATCH, EXIT_SYSCALL, MAX_EXITS};

impl TranslationUnit<'_> {
    /// Subtracts the cycles accumulated on the current path from the
    /// budget counter.
    pub(super) fn do_downcount(&mut self) {
        if self.downcount_amount == 0 {
            return;
        }
        let dc = self
            .builder
            .ins()
            .load(types::I32, MemFlags::trusted(), self.param_downcount, 0);
        let amount = self.iconst(self.downcount_amount as u32);
        let dc = self.builder.ins().isub(dc, amount);
        self.builder
            .ins()
            .store(MemFlags::trusted(), dc, self.param_downcount, 0);
    }

    fn return_code(&mut self, code: i32) {
        let code = self.iconst(code as u32);
        self.builder.ins().return_(&[code]);
    }

    /// Static exit to `dest` through link slot `exit_num`. A filled slot
    /// tail-jumps into the target's checked entry, an empty one hands `dest`
    /// to the dispatcher.
    pub(super) fn write_exit(&mut self, dest: u32, exit_num: usize) {
        debug_assert!(exit_num < MAX_EXITS);
        self.regs.flush_all(&mut self.builder);
        self.do_downcount();
        self.exits.push((exit_num, dest));

        let slot = (self.block_index * MAX_EXITS + exit_num) * self.pt.bytes() as usize;
        let slot = self.builder.ins().iadd_imm(self.param_links, slot as i64);
        let target = self
            .builder
            .ins()
            .load(self.pt, MemFlags::trusted(), slot, 0);

        let linked = self.builder.create_block();
        let unlinked = self.builder.create_block();
        self.builder.ins().brif(target, linked, &[], unlinked, &[]);
        self.builder.seal_block(linked);
        self.builder.seal_block(unlinked);

        self.builder.switch_to_block(linked);
        let params = self.params();
        self.builder
            .ins()
            .return_call_indirect(self.block_sig, target, &params);

        self.builder.switch_to_block(unlinked);
        let dest = self.iconst(dest);
        self.store_pc(dest);
        self.return_code(EXIT_DISPATCH);
    }

    /// Exit to an address computed at run time. Always goes through the
    /// dispatcher.
    pub(super) fn write_exit_dest_in_reg(&mut self, dest: Value) {
        self.regs.flush_all(&mut self.builder);
        self.do_downcount();
        self.store_pc(dest);
        self.return_code(EXIT_DISPATCH);
    }

    /// Exit after a SYSCALL; `pc` is left on the following instruction.
    pub(super) fn write_syscall_exit(&mut self) {
        self.regs.flush_all(&mut self.builder);
        let pc = self.iconst(self.compiler_pc.wrapping_add(4));
        self.store_pc(pc);
        self.do_downcount();
        self.return_code(EXIT_SYSCALL);
    }
}
