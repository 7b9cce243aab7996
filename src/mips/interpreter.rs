//! Reference interpreter. Serves as the per-instruction fallback for the
//! JIT and as a complete execution engine of its own.

use super::*;
use crate::{
    cpu::{CpuState, Memory},
    hle::{CoreState, Kernel},
    machine::System,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Syscall(u32),
}

fn unknown(op: u32) {
    log::warn!("Ignoring unknown instruction {op:08x}");
}

/// Executes a single instruction that does not transfer control.
///
/// Cycles are not charged here; callers account for them.
pub fn interpret(cpu: &mut CpuState, mem: &mut Memory, op: u32) {
    let (rs, rt, rd) = (rs(op), rt(op), rd(op));
    let s = cpu.reg(rs);
    let t = cpu.reg(rt);
    let addr = s.wrapping_add(simm16(op));

    match opcode(op) {
        0x00 => match funct(op) {
            0x00 => cpu.set_reg(rd, t << sa(op)),
            0x02 => cpu.set_reg(rd, t >> sa(op)),
            0x03 => cpu.set_reg(rd, ((t as i32) >> sa(op)) as u32),
            0x04 => cpu.set_reg(rd, t << (s & 31)),
            0x06 => cpu.set_reg(rd, t >> (s & 31)),
            0x07 => cpu.set_reg(rd, ((t as i32) >> (s & 31)) as u32),
            0x0a => {
                if t == 0 {
                    cpu.set_reg(rd, s)
                }
            }
            0x0b => {
                if t != 0 {
                    cpu.set_reg(rd, s)
                }
            }
            0x0d => log::warn!("BREAK at {:08x} ignored", cpu.pc),
            0x0f => {}
            0x10 => cpu.set_reg(rd, cpu.hi),
            0x11 => cpu.hi = s,
            0x12 => cpu.set_reg(rd, cpu.lo),
            0x13 => cpu.lo = s,
            0x18 => {
                let r = (s as i32 as i64) * (t as i32 as i64);
                cpu.hi = (r >> 32) as u32;
                cpu.lo = r as u32;
            }
            0x19 => {
                let r = (s as u64) * (t as u64);
                cpu.hi = (r >> 32) as u32;
                cpu.lo = r as u32;
            }
            0x1a => {
                if t == 0 {
                    cpu.hi = s;
                    cpu.lo = if (s as i32) < 0 { 1 } else { 0xffff_ffff };
                } else {
                    cpu.lo = (s as i32).wrapping_div(t as i32) as u32;
                    cpu.hi = (s as i32).wrapping_rem(t as i32) as u32;
                }
            }
            0x1b => {
                if t == 0 {
                    cpu.hi = s;
                    cpu.lo = 0xffff_ffff;
                } else {
                    cpu.lo = s / t;
                    cpu.hi = s % t;
                }
            }
            0x20 | 0x21 => cpu.set_reg(rd, s.wrapping_add(t)),
            0x22 | 0x23 => cpu.set_reg(rd, s.wrapping_sub(t)),
            0x24 => cpu.set_reg(rd, s & t),
            0x25 => cpu.set_reg(rd, s | t),
            0x26 => cpu.set_reg(rd, s ^ t),
            0x27 => cpu.set_reg(rd, !(s | t)),
            0x2a => cpu.set_reg(rd, ((s as i32) < (t as i32)) as u32),
            0x2b => cpu.set_reg(rd, (s < t) as u32),
            _ => unknown(op),
        },
        0x08 | 0x09 => cpu.set_reg(rt, s.wrapping_add(simm16(op))),
        0x0a => cpu.set_reg(rt, ((s as i32) < (simm16(op) as i32)) as u32),
        0x0b => cpu.set_reg(rt, (s < simm16(op)) as u32),
        0x0c => cpu.set_reg(rt, s & imm16(op)),
        0x0d => cpu.set_reg(rt, s | imm16(op)),
        0x0e => cpu.set_reg(rt, s ^ imm16(op)),
        0x0f => cpu.set_reg(rt, imm16(op) << 16),
        0x1c => match funct(op) {
            0x02 => cpu.set_reg(rd, s.wrapping_mul(t)),
            0x20 => cpu.set_reg(rd, s.leading_zeros()),
            _ => unknown(op),
        },
        0x1f if funct(op) == 0x20 => match sa(op) {
            0x10 => cpu.set_reg(rd, t as u8 as i8 as i32 as u32),
            0x18 => cpu.set_reg(rd, t as u16 as i16 as i32 as u32),
            _ => unknown(op),
        },
        0x20 => cpu.set_reg(rt, mem.read_u8(addr) as i8 as i32 as u32),
        0x21 => cpu.set_reg(rt, mem.read_u16(addr) as i16 as i32 as u32),
        0x23 => cpu.set_reg(rt, mem.read_u32(addr)),
        0x24 => cpu.set_reg(rt, mem.read_u8(addr) as u32),
        0x25 => cpu.set_reg(rt, mem.read_u16(addr) as u32),
        0x28 => mem.write_u8(addr, t as u8),
        0x29 => mem.write_u16(addr, t as u16),
        0x2b => mem.write_u32(addr, t),
        _ => unknown(op),
    }
}

/// Resolves a control transfer: returns whether it is taken and where it
/// goes. Link registers are written after the operands are read.
fn branch(cpu: &mut CpuState, op: u32, pc: u32) -> (bool, u32) {
    let link = pc.wrapping_add(8);
    match comp_op(op) {
        CompOp::Branch => {
            let s = cpu.reg(rs(op));
            let t = cpu.reg(rt(op));
            let taken = match opcode(op) & 3 {
                0 => s == t,
                1 => s != t,
                2 => (s as i32) <= 0,
                _ => (s as i32) > 0,
            };
            (taken, branch_target(op, pc))
        }
        CompOp::RegImm => {
            let s = cpu.reg(rs(op)) as i32;
            let taken = if rt(op) & 1 == 0 { s < 0 } else { s >= 0 };
            if rt(op) & 0x10 != 0 {
                cpu.set_reg(REG_RA, link);
            }
            (taken, branch_target(op, pc))
        }
        CompOp::Jump => {
            if opcode(op) == 0x03 {
                cpu.set_reg(REG_RA, link);
            }
            (true, jump_target(op, pc))
        }
        CompOp::JumpReg => {
            let target = cpu.reg(rs(op));
            if funct(op) == 0x09 {
                cpu.set_reg(rd(op), link);
            }
            (true, target)
        }
        _ => unreachable!("not a branch: {op:08x}"),
    }
}

fn delay_slot(cpu: &mut CpuState, mem: &mut Memory, pc: u32) -> i32 {
    let op = mem.read_u32(pc);
    if comp_op(op).ends_block() {
        log::warn!("Ignoring {op:08x} in delay slot at {pc:08x}");
    } else {
        interpret(cpu, mem, op);
    }
    cycle_estimate(op)
}

/// Executes the instruction at `pc`. A branch executes together with its
/// delay slot. Returns the cycles consumed.
pub fn step(cpu: &mut CpuState, mem: &mut Memory) -> (Step, i32) {
    let pc = cpu.pc;
    let op = mem.read_u32(pc);
    let mut cycles = cycle_estimate(op);

    match comp_op(op) {
        CompOp::Syscall => {
            cpu.pc = pc.wrapping_add(4);
            return (Step::Syscall(syscall_code(op)), cycles);
        }
        c if c.is_branch() => {
            let (taken, target) = branch(cpu, op, pc);
            if taken || !is_likely(op) {
                cycles += delay_slot(cpu, mem, pc.wrapping_add(4));
            }
            cpu.pc = if taken { target } else { pc.wrapping_add(8) };
        }
        _ => {
            interpret(cpu, mem, op);
            cpu.pc = pc.wrapping_add(4);
        }
    }

    (Step::Continue, cycles)
}

/// Interpreter engine: runs guest code one instruction at a time until
/// `until` cycles have elapsed or the CPU powers down.
pub fn run_loop_until<K: Kernel>(sys: &mut System<K>, until: u64) -> anyhow::Result<()> {
    while sys.service(until)? {
        while sys.timing.downcount >= 0 && sys.core_state == CoreState::Running {
            let (step, cycles) = step(&mut sys.cpu, &mut sys.mem);
            sys.timing.downcount -= cycles;
            if let Step::Syscall(code) = step {
                sys.syscall(code)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::asm::*;
    use super::*;

    fn machine(prog: &[u32]) -> (CpuState, Memory) {
        let mut mem = Memory::new(0x10000).unwrap();
        mem.load_words(0x1000, prog);
        (CpuState::new(0x1000), mem)
    }

    #[test]
    fn arithmetic_and_logic() {
        let (mut cpu, mut mem) = machine(&[]);
        cpu.gpr[1] = 7;
        cpu.gpr[2] = 0xffff_fffe;
        interpret(&mut cpu, &mut mem, addu(3, 1, 2));
        assert_eq!(cpu.gpr[3], 5);
        interpret(&mut cpu, &mut mem, slt(4, 2, 1));
        assert_eq!(cpu.gpr[4], 1);
        interpret(&mut cpu, &mut mem, sltu(4, 2, 1));
        assert_eq!(cpu.gpr[4], 0);
        interpret(&mut cpu, &mut mem, sra(5, 2, 1));
        assert_eq!(cpu.gpr[5], 0xffff_ffff);
        interpret(&mut cpu, &mut mem, sltiu(6, 1, -1));
        assert_eq!(cpu.gpr[6], 1);
        interpret(&mut cpu, &mut mem, addiu(0, 1, 1));
        assert_eq!(cpu.gpr[0], 0);
    }

    #[test]
    fn mult_div() {
        let (mut cpu, mut mem) = machine(&[]);
        cpu.gpr[1] = (-6i32) as u32;
        cpu.gpr[2] = 4;
        interpret(&mut cpu, &mut mem, mult(1, 2));
        assert_eq!((cpu.hi, cpu.lo), (0xffff_ffff, (-24i32) as u32));
        interpret(&mut cpu, &mut mem, div(1, 2));
        assert_eq!((cpu.hi, cpu.lo), ((-2i32) as u32, (-1i32) as u32));
        interpret(&mut cpu, &mut mem, div(1, 0));
        assert_eq!((cpu.hi, cpu.lo), ((-6i32) as u32, 1));
        interpret(&mut cpu, &mut mem, mflo(3));
        assert_eq!(cpu.gpr[3], 1);
    }

    #[test]
    fn loads_and_stores() {
        let (mut cpu, mut mem) = machine(&[]);
        cpu.gpr[1] = 0x2000;
        cpu.gpr[2] = 0x8081_8283;
        interpret(&mut cpu, &mut mem, sw(2, 1, 4));
        interpret(&mut cpu, &mut mem, lb(3, 1, 4));
        assert_eq!(cpu.gpr[3], 0xffff_ff83);
        interpret(&mut cpu, &mut mem, lhu(3, 1, 6));
        assert_eq!(cpu.gpr[3], 0x8081);
        interpret(&mut cpu, &mut mem, sb(0, 1, 5));
        assert_eq!(mem.read_u32(0x2004), 0x8081_0083);
    }

    #[test]
    fn branch_runs_delay_slot() {
        let (mut cpu, mut mem) = machine(&[beq(0, 0, 2), addiu(1, 0, 9), addiu(2, 0, 1)]);
        let (step, cycles) = step(&mut cpu, &mut mem);
        assert_eq!(step, Step::Continue);
        assert_eq!(cycles, 2);
        assert_eq!(cpu.gpr[1], 9);
        assert_eq!(cpu.pc, 0x100c);
    }

    #[test]
    fn likely_not_taken_skips_delay_slot() {
        let (mut cpu, mut mem) = machine(&[bnel(0, 0, 5), addiu(1, 0, 9)]);
        let (_, cycles) = step(&mut cpu, &mut mem);
        assert_eq!(cycles, 1);
        assert_eq!(cpu.gpr[1], 0);
        assert_eq!(cpu.pc, 0x1008);
    }

    #[test]
    fn jalr_links_after_reading_target() {
        let (mut cpu, mut mem) = machine(&[jalr(5, 5), nop()]);
        cpu.gpr[5] = 0x4000;
        step(&mut cpu, &mut mem);
        assert_eq!(cpu.pc, 0x4000);
        assert_eq!(cpu.gpr[5], 0x1008);
    }

    #[test]
    fn syscall_reports_code() {
        let (mut cpu, mut mem) = machine(&[syscall(42)]);
        assert_eq!(step(&mut cpu, &mut mem), (Step::Syscall(42), 1));
        assert_eq!(cpu.pc, 0x1004);
    }
}
