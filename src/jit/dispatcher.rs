//! Dispatcher: resolves the guest `pc` to a compiled block, runs it and
//! services whatever made it return.

use super::{BlockEntry, Callbacks, ExitReason, Jit};
use crate::{
    cpu::Memory,
    hle::{CoreState, Kernel},
    machine::System,
    mips::syscall_code,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// Resolving `pc` to a host entry point, compiling if needed.
    Dispatching,
    /// Compiled code is executing.
    Running,
}

impl Jit {
    /// Runs guest code until the global clock reaches `until` cycles or the
    /// CPU powers down.
    pub fn run_loop_until<K: Kernel>(
        &mut self,
        sys: &mut System<K>,
        until: u64,
    ) -> anyhow::Result<()> {
        while sys.service(until)? {
            while sys.timing.downcount >= 0 && sys.core_state == CoreState::Running {
                match self.execute_block(sys)? {
                    ExitReason::Dispatch => {}
                    ExitReason::Syscall => {
                        let op = sys.mem.read_u32(sys.cpu.pc.wrapping_sub(4));
                        sys.syscall(syscall_code(op))?;
                    }
                    ExitReason::OuterLoop => break,
                }
            }
        }
        Ok(())
    }

    /// One dispatch: resolves `pc`, compiling on a miss, and runs compiled
    /// code until it exits back here.
    pub fn execute_block<K: Kernel>(&mut self, sys: &mut System<K>) -> anyhow::Result<ExitReason> {
        self.state = DispatchState::Dispatching;
        self.stats.dispatches += 1;
        let entry = self.resolve(&sys.mem, sys.cpu.pc)?;

        self.state = DispatchState::Running;
        let reason = self.enter(sys, entry);
        self.state = DispatchState::Dispatching;

        let reason = reason?;
        match reason {
            ExitReason::Dispatch => self.stats.dispatcher_exits += 1,
            ExitReason::Syscall => self.stats.syscall_exits += 1,
            ExitReason::OuterLoop => self.stats.budget_exits += 1,
        }
        log::trace!("*** Exit {reason:?} at pc={:08x}", sys.cpu.pc);
        Ok(reason)
    }

    /// Normal entry for `pc`. The budget was already checked by the caller.
    pub fn resolve(&mut self, mem: &Memory, pc: u32) -> anyhow::Result<BlockEntry> {
        let index = match self.cache.get_block_number(pc) {
            Some(index) => index,
            None => self.compile(mem, pc)?,
        };
        Ok(BlockEntry(self.cache.block(index).normal_entry))
    }

    fn enter<K: Kernel>(
        &mut self,
        sys: &mut System<K>,
        entry: BlockEntry,
    ) -> anyhow::Result<ExitReason> {
        let mem: *mut Memory = &mut sys.mem;
        let callbacks = Callbacks {
            interpret: super::interpret,
            memory: mem,
        };

        // SAFETY: `entry` comes from the current code space, which cannot be
        // freed while this call runs. Every pointer stays valid for the
        // call: `cpu`, `downcount` and the memory image are exclusively
        // borrowed from `sys`, and `callbacks` and the link table outlive it.
        let code = unsafe {
            (self.cache.enter_fn())(
                &mut sys.cpu,
                (*mem).base_ptr(),
                &mut sys.timing.downcount,
                &callbacks,
                self.cache.links_ptr(),
                entry.0,
            )
        };

        ExitReason::from_code(code)
            .ok_or_else(|| anyhow::anyhow!("compiled code returned bad exit code {code}"))
    }
}
