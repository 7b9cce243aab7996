//! Kernel collaborator interface and a small demo kernel.
//!
//! The execution engines call into the kernel on every SYSCALL and for
//! every fired timing event. Guest registers are fully flushed at those
//! points, so the kernel may read and modify them freely.

use std::io::Write;

use crate::{
    cpu::{CpuState, Memory},
    mips::{REG_A0, REG_V0, REG_V1},
    timing::{CoreTiming, EventType, FiredEvent},
};

/// Whether the logical CPU executes guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Running,
    /// Waiting for a timing event to wake it up.
    Idle,
    Powerdown,
}

/// Everything a kernel may touch while servicing a request.
pub struct KernelContext<'a> {
    pub cpu: &'a mut CpuState,
    pub mem: &'a mut Memory,
    pub timing: &'a mut CoreTiming,
    pub core_state: &'a mut CoreState,
}

pub trait Kernel {
    fn init(&mut self, _timing: &mut CoreTiming) {}

    fn syscall(&mut self, code: u32, ctx: KernelContext) -> anyhow::Result<()>;

    fn event(&mut self, _event: FiredEvent, _ctx: KernelContext) -> anyhow::Result<()> {
        Ok(())
    }
}

pub const SYS_EXIT: u32 = 0;
pub const SYS_PRINT_INT: u32 = 1;
pub const SYS_PRINT_CHAR: u32 = 2;
pub const SYS_PRINT_STR: u32 = 3;
pub const SYS_SLEEP: u32 = 4;
pub const SYS_TICKS: u32 = 5;

const MAX_STRING: usize = 4096;

/// Console output, process exit, timed sleeps and a cycle clock.
pub struct SimpleKernel<W: Write> {
    out: W,
    wake_event: Option<EventType>,
    exit_code: Option<u32>,
}

impl<W: Write> SimpleKernel<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            wake_event: None,
            exit_code: None,
        }
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }
}

impl<W: Write> Kernel for SimpleKernel<W> {
    fn init(&mut self, timing: &mut CoreTiming) {
        self.wake_event = Some(timing.register_event("WakeCpu"));
    }

    fn syscall(&mut self, code: u32, ctx: KernelContext) -> anyhow::Result<()> {
        let a0 = ctx.cpu.reg(REG_A0);
        match code {
            SYS_EXIT => {
                log::info!("Guest exited with {a0}");
                self.exit_code = Some(a0);
                *ctx.core_state = CoreState::Powerdown;
            }
            SYS_PRINT_INT => write!(self.out, "{}", a0 as i32)?,
            SYS_PRINT_CHAR => self.out.write_all(&[a0 as u8])?,
            SYS_PRINT_STR => self.out.write_all(&ctx.mem.read_cstr(a0, MAX_STRING))?,
            SYS_SLEEP => {
                let Some(wake) = self.wake_event else {
                    anyhow::bail!("kernel used before init");
                };
                ctx.timing.schedule_event(a0 as u64, wake, 0);
                *ctx.core_state = CoreState::Idle;
            }
            SYS_TICKS => {
                let ticks = ctx.timing.ticks();
                ctx.cpu.set_reg(REG_V0, ticks as u32);
                ctx.cpu.set_reg(REG_V1, (ticks >> 32) as u32);
            }
            _ => log::warn!("Unknown syscall {code:#x} at {:08x}", ctx.cpu.pc),
        }
        Ok(())
    }

    fn event(&mut self, event: FiredEvent, ctx: KernelContext) -> anyhow::Result<()> {
        if Some(event.ty) == self.wake_event {
            ctx.cpu.set_reg(REG_V0, 0);
            if *ctx.core_state == CoreState::Idle {
                *ctx.core_state = CoreState::Running;
            }
        }
        Ok(())
    }
}
