//! Guest instruction set: field decoding, cycle estimates and the
//! compiler table mapping each encoding to a code-generation class.

pub mod asm;
pub mod disasm;
pub mod interpreter;

pub const REG_V0: usize = 2;
pub const REG_V1: usize = 3;
pub const REG_A0: usize = 4;
pub const REG_SP: usize = 29;
pub const REG_RA: usize = 31;

pub fn opcode(op: u32) -> u32 {
    op >> 26
}

pub fn rs(op: u32) -> usize {
    ((op >> 21) & 0x1f) as usize
}

pub fn rt(op: u32) -> usize {
    ((op >> 16) & 0x1f) as usize
}

pub fn rd(op: u32) -> usize {
    ((op >> 11) & 0x1f) as usize
}

pub fn sa(op: u32) -> u32 {
    (op >> 6) & 0x1f
}

pub fn funct(op: u32) -> u32 {
    op & 0x3f
}

pub fn imm16(op: u32) -> u32 {
    op & 0xffff
}

pub fn simm16(op: u32) -> u32 {
    op as u16 as i16 as i32 as u32
}

/// Target of a conditional branch at `pc`.
pub fn branch_target(op: u32, pc: u32) -> u32 {
    pc.wrapping_add(4).wrapping_add(simm16(op) << 2)
}

/// Target of J/JAL at `pc`.
pub fn jump_target(op: u32, pc: u32) -> u32 {
    (pc.wrapping_add(4) & 0xf000_0000) | ((op & 0x03ff_ffff) << 2)
}

pub fn syscall_code(op: u32) -> u32 {
    (op >> 6) & 0xfffff
}

/// Code-generation class of an instruction. Everything the compiler does
/// not special-case is `Generic` and runs through the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Generic,
    ImmArith,
    RType,
    ShiftImm,
    ShiftVar,
    Load,
    Store,
    Branch,
    RegImm,
    Jump,
    JumpReg,
    Syscall,
}

impl CompOp {
    /// Instructions that end a block and own a delay slot.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            CompOp::Branch | CompOp::RegImm | CompOp::Jump | CompOp::JumpReg
        )
    }

    /// Instructions that transfer control out of straight-line code.
    pub fn ends_block(self) -> bool {
        self.is_branch() || self == CompOp::Syscall
    }
}

const fn primary_table() -> [CompOp; 64] {
    let mut t = [CompOp::Generic; 64];
    t[0x00] = CompOp::RType; // refined through SPECIAL_TABLE
    t[0x01] = CompOp::RegImm;
    t[0x02] = CompOp::Jump;
    t[0x03] = CompOp::Jump;
    t[0x04] = CompOp::Branch;
    t[0x05] = CompOp::Branch;
    t[0x06] = CompOp::Branch;
    t[0x07] = CompOp::Branch;
    let mut i = 0x08;
    while i <= 0x0f {
        t[i] = CompOp::ImmArith;
        i += 1;
    }
    t[0x14] = CompOp::Branch;
    t[0x15] = CompOp::Branch;
    t[0x16] = CompOp::Branch;
    t[0x17] = CompOp::Branch;
    t[0x20] = CompOp::Load;
    t[0x21] = CompOp::Load;
    t[0x23] = CompOp::Load;
    t[0x24] = CompOp::Load;
    t[0x25] = CompOp::Load;
    t[0x28] = CompOp::Store;
    t[0x29] = CompOp::Store;
    t[0x2b] = CompOp::Store;
    t
}

const fn special_table() -> [CompOp; 64] {
    let mut t = [CompOp::Generic; 64];
    t[0x00] = CompOp::ShiftImm;
    t[0x02] = CompOp::ShiftImm;
    t[0x03] = CompOp::ShiftImm;
    t[0x04] = CompOp::ShiftVar;
    t[0x06] = CompOp::ShiftVar;
    t[0x07] = CompOp::ShiftVar;
    t[0x08] = CompOp::JumpReg;
    t[0x09] = CompOp::JumpReg;
    t[0x0c] = CompOp::Syscall;
    let mut i = 0x20;
    while i <= 0x27 {
        t[i] = CompOp::RType;
        i += 1;
    }
    t[0x2a] = CompOp::RType;
    t[0x2b] = CompOp::RType;
    t
}

static PRIMARY_TABLE: [CompOp; 64] = primary_table();
static SPECIAL_TABLE: [CompOp; 64] = special_table();

/// Looks up the compiler table entry for `op`.
pub fn comp_op(op: u32) -> CompOp {
    match opcode(op) {
        0x00 => SPECIAL_TABLE[funct(op) as usize],
        0x01 => match rt(op) {
            0x00..=0x03 | 0x10 | 0x11 => CompOp::RegImm,
            _ => CompOp::Generic,
        },
        o => PRIMARY_TABLE[o as usize],
    }
}

/// Branch-likely forms only execute their delay slot when taken.
pub fn is_likely(op: u32) -> bool {
    match opcode(op) {
        0x14..=0x17 => true,
        0x01 => matches!(rt(op), 0x02 | 0x03),
        _ => false,
    }
}

/// Estimated cost of one instruction in CPU cycles.
pub fn cycle_estimate(op: u32) -> i32 {
    match opcode(op) {
        0x00 => match funct(op) {
            0x18 | 0x19 => 5,
            0x1a | 0x1b => 36,
            _ => 1,
        },
        0x1c if funct(op) == 0x02 => 5,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::asm::*;
    use super::*;

    #[test]
    fn table_classifies_supported_ops() {
        assert_eq!(comp_op(addiu(1, 0, 5)), CompOp::ImmArith);
        assert_eq!(comp_op(lui(1, 0x1234)), CompOp::ImmArith);
        assert_eq!(comp_op(addu(1, 2, 3)), CompOp::RType);
        assert_eq!(comp_op(sll(1, 2, 3)), CompOp::ShiftImm);
        assert_eq!(comp_op(nop()), CompOp::ShiftImm);
        assert_eq!(comp_op(srav(1, 2, 3)), CompOp::ShiftVar);
        assert_eq!(comp_op(lw(1, 2, 0)), CompOp::Load);
        assert_eq!(comp_op(sb(1, 2, 0)), CompOp::Store);
        assert_eq!(comp_op(beq(1, 2, 0)), CompOp::Branch);
        assert_eq!(comp_op(bgezal(1, 0)), CompOp::RegImm);
        assert_eq!(comp_op(jal(0)), CompOp::Jump);
        assert_eq!(comp_op(jr(31)), CompOp::JumpReg);
        assert_eq!(comp_op(syscall(3)), CompOp::Syscall);
    }

    #[test]
    fn table_falls_back_for_everything_else() {
        assert_eq!(comp_op(mult(1, 2)), CompOp::Generic);
        assert_eq!(comp_op(divu(1, 2)), CompOp::Generic);
        assert_eq!(comp_op(mflo(3)), CompOp::Generic);
        assert_eq!(comp_op(movz(1, 2, 3)), CompOp::Generic);
        assert_eq!(comp_op(0xffff_ffff), CompOp::Generic);
        // REGIMM with an unassigned rt
        assert_eq!(comp_op(0x0405_0000), CompOp::Generic);
    }

    #[test]
    fn branch_targets() {
        assert_eq!(branch_target(beq(0, 0, -1), 0x100), 0x100);
        assert_eq!(branch_target(bne(1, 2, 3), 0x100), 0x110);
        assert_eq!(jump_target(j(0x0880_0000), 0x0880_1000), 0x0880_0000);
    }

    #[test]
    fn likely_and_cycles() {
        assert!(is_likely(beql(1, 2, 0)));
        assert!(is_likely(bgezl(1, 0)));
        assert!(!is_likely(beq(1, 2, 0)));
        assert_eq!(cycle_estimate(div(1, 2)), 36);
        assert_eq!(cycle_estimate(mult(1, 2)), 5);
        assert_eq!(cycle_estimate(addu(1, 2, 3)), 1);
        assert_eq!(syscall_code(syscall(0x1234)), 0x1234);
    }
}
