//! Instruction encoders. Register arguments follow assembly operand order,
//! branch offsets are in instructions relative to the delay slot.

fn i_type(op: u32, rs: u32, rt: u32, imm: u32) -> u32 {
    (op << 26) | ((rs & 0x1f) << 21) | ((rt & 0x1f) << 16) | (imm & 0xffff)
}

fn r_type(rs: u32, rt: u32, rd: u32, sa: u32, funct: u32) -> u32 {
    ((rs & 0x1f) << 21) | ((rt & 0x1f) << 16) | ((rd & 0x1f) << 11) | ((sa & 0x1f) << 6) | funct
}

fn regimm(rt: u32, rs: u32, offset: i16) -> u32 {
    i_type(0x01, rs, rt, offset as u16 as u32)
}

pub fn nop() -> u32 {
    0
}

pub fn addiu(rt: u32, rs: u32, imm: i16) -> u32 {
    i_type(0x09, rs, rt, imm as u16 as u32)
}

pub fn addi(rt: u32, rs: u32, imm: i16) -> u32 {
    i_type(0x08, rs, rt, imm as u16 as u32)
}

pub fn slti(rt: u32, rs: u32, imm: i16) -> u32 {
    i_type(0x0a, rs, rt, imm as u16 as u32)
}

pub fn sltiu(rt: u32, rs: u32, imm: i16) -> u32 {
    i_type(0x0b, rs, rt, imm as u16 as u32)
}

pub fn andi(rt: u32, rs: u32, imm: u16) -> u32 {
    i_type(0x0c, rs, rt, imm as u32)
}

pub fn ori(rt: u32, rs: u32, imm: u16) -> u32 {
    i_type(0x0d, rs, rt, imm as u32)
}

pub fn xori(rt: u32, rs: u32, imm: u16) -> u32 {
    i_type(0x0e, rs, rt, imm as u32)
}

pub fn lui(rt: u32, imm: u16) -> u32 {
    i_type(0x0f, 0, rt, imm as u32)
}

pub fn addu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x21)
}

pub fn subu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x23)
}

pub fn and(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x24)
}

pub fn or(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x25)
}

pub fn xor(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x26)
}

pub fn nor(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x27)
}

pub fn slt(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x2a)
}

pub fn sltu(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x2b)
}

pub fn sll(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x00)
}

pub fn srl(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x02)
}

pub fn sra(rd: u32, rt: u32, sa: u32) -> u32 {
    r_type(0, rt, rd, sa, 0x03)
}

pub fn sllv(rd: u32, rt: u32, rs: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x04)
}

pub fn srlv(rd: u32, rt: u32, rs: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x06)
}

pub fn srav(rd: u32, rt: u32, rs: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x07)
}

pub fn mult(rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, 0, 0, 0x18)
}

pub fn multu(rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, 0, 0, 0x19)
}

pub fn div(rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, 0, 0, 0x1a)
}

pub fn divu(rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, 0, 0, 0x1b)
}

pub fn mfhi(rd: u32) -> u32 {
    r_type(0, 0, rd, 0, 0x10)
}

pub fn mflo(rd: u32) -> u32 {
    r_type(0, 0, rd, 0, 0x12)
}

pub fn movz(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x0a)
}

pub fn movn(rd: u32, rs: u32, rt: u32) -> u32 {
    r_type(rs, rt, rd, 0, 0x0b)
}

pub fn lb(rt: u32, base: u32, offset: i16) -> u32 {
    i_type(0x20, base, rt, offset as u16 as u32)
}

pub fn lbu(rt: u32, base: u32, offset: i16) -> u32 {
    i_type(0x24, base, rt, offset as u16 as u32)
}

pub fn lh(rt: u32, base: u32, offset: i16) -> u32 {
    i_type(0x21, base, rt, offset as u16 as u32)
}

pub fn lhu(rt: u32, base: u32, offset: i16) -> u32 {
    i_type(0x25, base, rt, offset as u16 as u32)
}

pub fn lw(rt: u32, base: u32, offset: i16) -> u32 {
    i_type(0x23, base, rt, offset as u16 as u32)
}

pub fn sb(rt: u32, base: u32, offset: i16) -> u32 {
    i_type(0x28, base, rt, offset as u16 as u32)
}

pub fn sh(rt: u32, base: u32, offset: i16) -> u32 {
    i_type(0x29, base, rt, offset as u16 as u32)
}

pub fn sw(rt: u32, base: u32, offset: i16) -> u32 {
    i_type(0x2b, base, rt, offset as u16 as u32)
}

pub fn beq(rs: u32, rt: u32, offset: i16) -> u32 {
    i_type(0x04, rs, rt, offset as u16 as u32)
}

pub fn bne(rs: u32, rt: u32, offset: i16) -> u32 {
    i_type(0x05, rs, rt, offset as u16 as u32)
}

pub fn blez(rs: u32, offset: i16) -> u32 {
    i_type(0x06, rs, 0, offset as u16 as u32)
}

pub fn bgtz(rs: u32, offset: i16) -> u32 {
    i_type(0x07, rs, 0, offset as u16 as u32)
}

pub fn beql(rs: u32, rt: u32, offset: i16) -> u32 {
    i_type(0x14, rs, rt, offset as u16 as u32)
}

pub fn bnel(rs: u32, rt: u32, offset: i16) -> u32 {
    i_type(0x15, rs, rt, offset as u16 as u32)
}

pub fn bltz(rs: u32, offset: i16) -> u32 {
    regimm(0x00, rs, offset)
}

pub fn bgez(rs: u32, offset: i16) -> u32 {
    regimm(0x01, rs, offset)
}

pub fn bgezl(rs: u32, offset: i16) -> u32 {
    regimm(0x03, rs, offset)
}

pub fn bltzal(rs: u32, offset: i16) -> u32 {
    regimm(0x10, rs, offset)
}

pub fn bgezal(rs: u32, offset: i16) -> u32 {
    regimm(0x11, rs, offset)
}

/// `target` is an absolute address inside the current 256 MiB region.
pub fn j(target: u32) -> u32 {
    (0x02 << 26) | ((target >> 2) & 0x03ff_ffff)
}

pub fn jal(target: u32) -> u32 {
    (0x03 << 26) | ((target >> 2) & 0x03ff_ffff)
}

pub fn jr(rs: u32) -> u32 {
    r_type(rs, 0, 0, 0, 0x08)
}

pub fn jalr(rd: u32, rs: u32) -> u32 {
    r_type(rs, 0, rd, 0, 0x09)
}

pub fn syscall(code: u32) -> u32 {
    ((code & 0xfffff) << 6) | 0x0c
}
