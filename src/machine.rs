use crate::{
    cpu::{CpuState, Memory},
    hle::{CoreState, Kernel, KernelContext},
    jit::{Jit, JitOptions},
    mips::interpreter,
    timing::CoreTiming,
};

/// Guest state shared by both execution engines.
pub struct System<K: Kernel> {
    pub cpu: CpuState,
    pub mem: Memory,
    pub timing: CoreTiming,
    pub kernel: K,
    pub core_state: CoreState,
}

impl<K: Kernel> System<K> {
    pub fn new(mem: Memory, entry: u32, mut kernel: K) -> Self {
        let mut timing = CoreTiming::new();
        kernel.init(&mut timing);
        Self {
            cpu: CpuState::new(entry),
            mem,
            timing,
            kernel,
            core_state: CoreState::Running,
        }
    }

    fn kernel_ctx(&mut self) -> (&mut K, KernelContext<'_>) {
        (
            &mut self.kernel,
            KernelContext {
                cpu: &mut self.cpu,
                mem: &mut self.mem,
                timing: &mut self.timing,
                core_state: &mut self.core_state,
            },
        )
    }

    pub fn syscall(&mut self, code: u32) -> anyhow::Result<()> {
        let (kernel, ctx) = self.kernel_ctx();
        kernel.syscall(code, ctx)
    }

    /// Outer loop of both engines: closes the current slice, fires due
    /// events and idles through slices while the CPU sleeps.
    ///
    /// Returns whether guest code should run in the new slice.
    pub fn service(&mut self, until: u64) -> anyhow::Result<bool> {
        loop {
            for event in self.timing.advance(until) {
                log::trace!(
                    "Event {} fired {} cycles late",
                    self.timing.event_name(event.ty),
                    event.cycles_late
                );
                let (kernel, ctx) = self.kernel_ctx();
                kernel.event(event, ctx)?;
            }

            if self.core_state == CoreState::Powerdown || self.timing.ticks() >= until {
                return Ok(false);
            }
            if self.core_state == CoreState::Running {
                return Ok(true);
            }
            self.timing.idle();
        }
    }
}

pub enum Engine {
    Interpreter,
    Jit(Box<Jit>),
}

pub struct Machine<K: Kernel> {
    pub sys: System<K>,
    engine: Engine,
}

impl<K: Kernel> Machine<K> {
    pub fn interpreter(sys: System<K>) -> Self {
        Self {
            sys,
            engine: Engine::Interpreter,
        }
    }

    pub fn jit(sys: System<K>, options: JitOptions) -> anyhow::Result<Self> {
        Ok(Self {
            sys,
            engine: Engine::Jit(Box::new(Jit::new(options)?)),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn jit_mut(&mut self) -> Option<&mut Jit> {
        match &mut self.engine {
            Engine::Jit(jit) => Some(jit),
            Engine::Interpreter => None,
        }
    }

    /// Runs guest code until the global clock reaches `until` cycles or the
    /// CPU powers down.
    pub fn run_loop_until(&mut self, until: u64) -> anyhow::Result<()> {
        match &mut self.engine {
            Engine::Interpreter => interpreter::run_loop_until(&mut self.sys, until),
            Engine::Jit(jit) => jit.run_loop_until(&mut self.sys, until),
        }
    }

    /// Runs until the CPU powers down, `max_cycles` elapse, or it sleeps
    /// with nothing left to wake it.
    pub fn run(&mut self, max_cycles: u64) -> anyhow::Result<()> {
        while self.sys.core_state != CoreState::Powerdown {
            let now = self.sys.timing.ticks();
            if now >= max_cycles {
                log::info!("Cycle limit of {max_cycles} reached");
                break;
            }
            if self.sys.core_state == CoreState::Idle && !self.sys.timing.has_pending_events() {
                anyhow::bail!("CPU idle at {:08x} with no pending events", self.sys.cpu.pc);
            }
            let slice = now.saturating_add(10 * crate::timing::MAX_SLICE_LENGTH as u64);
            self.run_loop_until(slice.min(max_cycles))?;
        }
        Ok(())
    }
}
