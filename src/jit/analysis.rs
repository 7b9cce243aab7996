//! Pre-scan of a block before code generation.

use crate::{cpu::Memory, mips::*};

/// Guest instructions making up the block at `addr`: straight-line code up
/// to and including the first control transfer (with its delay slot) or
/// SYSCALL, or `max_insts` instructions if none comes first.
pub fn scan_block(mem: &Memory, addr: u32, max_insts: usize) -> Vec<u32> {
    let mut code = vec![];
    let mut pc = addr;
    while code.len() < max_insts.max(1) {
        let op = mem.read_u32(pc);
        code.push(op);
        pc = pc.wrapping_add(4);

        let comp = comp_op(op);
        if comp.is_branch() {
            code.push(mem.read_u32(pc));
            break;
        }
        if comp.ends_block() {
            break;
        }
    }
    code
}

/// Registers a block reads before writing them, and which host callbacks
/// it needs.
pub struct Analysis {
    pub read_reg: [bool; 32],
    pub write_reg: [bool; 32],
    pub call_interpret: bool,
}

impl Analysis {
    pub fn new(code: &[u32]) -> Self {
        let mut read_reg = [false; 32];
        let mut write_reg = [false; 32];
        let mut call_interpret = false;

        for &op in code {
            let mut read = |r: usize| read_reg[r] |= r != 0 && !write_reg[r];
            let (s, t, d) = (rs(op), rt(op), rd(op));

            let write = match comp_op(op) {
                CompOp::ImmArith => {
                    if opcode(op) != 0x0f {
                        read(s);
                    }
                    Some(t)
                }
                CompOp::RType | CompOp::ShiftVar => {
                    read(s);
                    read(t);
                    Some(d)
                }
                CompOp::ShiftImm => {
                    read(t);
                    Some(d)
                }
                CompOp::Load => {
                    read(s);
                    Some(t)
                }
                CompOp::Store | CompOp::Branch => {
                    read(s);
                    read(t);
                    None
                }
                CompOp::RegImm => {
                    read(s);
                    (t & 0x10 != 0).then_some(REG_RA)
                }
                CompOp::Jump => (opcode(op) == 0x03).then_some(REG_RA),
                CompOp::JumpReg => {
                    read(s);
                    (funct(op) == 0x09).then_some(d)
                }
                CompOp::Syscall => None,
                CompOp::Generic => {
                    call_interpret = true;
                    None
                }
            };

            if let Some(r) = write {
                write_reg[r] = true;
            }
        }

        Self {
            read_reg,
            write_reg,
            call_interpret,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mips::asm::*;

    #[test]
    fn read_before_write() {
        let anal = Analysis::new(&[lui(1, 0x10), addu(2, 1, 3), ori(3, 3, 1), jr(31), nop()]);
        assert!(!anal.read_reg[1]);
        assert!(anal.read_reg[3]);
        assert!(anal.read_reg[31]);
        assert!(!anal.read_reg[0]);
        assert!(anal.write_reg[1] && anal.write_reg[2] && anal.write_reg[3]);
        assert!(!anal.call_interpret);
    }

    #[test]
    fn fallback_is_noticed() {
        let anal = Analysis::new(&[mult(4, 5), mflo(2)]);
        assert!(anal.call_interpret);
    }

    #[test]
    fn scan_stops_after_delay_slot() {
        let mut mem = Memory::new(0x1000).unwrap();
        let prog = [addiu(1, 0, 1), bne(1, 0, -2), addiu(2, 0, 2), addiu(3, 0, 3)];
        mem.load_words(0x100, &prog);
        assert_eq!(scan_block(&mem, 0x100, 128), prog[..3].to_vec());
    }

    #[test]
    fn scan_stops_at_syscall_and_limit() {
        let mut mem = Memory::new(0x1000).unwrap();
        mem.load_words(0x100, &[nop(), syscall(1), nop()]);
        assert_eq!(scan_block(&mem, 0x100, 128).len(), 2);
        assert_eq!(scan_block(&mem, 0x200, 5).len(), 5);
    }
}
