use super::*;

const REG_NAMES: [&str; 32] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp",
    "fp", "ra",
];

pub fn decode(bin: &[u8]) -> anyhow::Result<Vec<u32>> {
    let chunks = bin.chunks_exact(4);
    if !chunks.remainder().is_empty() {
        anyhow::bail!("invalid binary: size {} is not a multiple of 4", bin.len());
    }
    Ok(chunks
        .into_iter()
        .map(|w| w.try_into().map(u32::from_le_bytes))
        .collect::<Result<_, _>>()?)
}

pub fn disasm(pc_base: u32, progn: &[u32]) -> Vec<String> {
    progn
        .iter()
        .enumerate()
        .map(|(i, &op)| {
            let pc = pc_base.wrapping_add(i as u32 * 4);
            format!("{pc:#010x}: {op:08x}  {}", disasm_op(op, pc))
        })
        .collect()
}

pub fn disasm_op(op: u32, pc: u32) -> String {
    let r = |n: usize| format!("${}", REG_NAMES[n]);
    let (s, t, d) = (r(rs(op)), r(rt(op)), r(rd(op)));
    let simm = simm16(op) as i32;
    let imm = imm16(op);
    let btarget = branch_target(op, pc);

    let special = |name: &str| match funct(op) {
        0x00..=0x03 => format!("{name} {d}, {t}, {}", sa(op)),
        0x04..=0x07 => format!("{name} {d}, {t}, {s}"),
        0x10 | 0x12 => format!("{name} {d}"),
        0x11 | 0x13 | 0x08 => format!("{name} {s}"),
        0x18..=0x1b => format!("{name} {s}, {t}"),
        0x0c => format!("{name} {:#x}", syscall_code(op)),
        _ => format!("{name} {d}, {s}, {t}"),
    };

    match opcode(op) {
        0x00 if op == 0 => "nop".to_string(),
        0x00 => {
            let name = match funct(op) {
                0x00 => "sll",
                0x02 => "srl",
                0x03 => "sra",
                0x04 => "sllv",
                0x06 => "srlv",
                0x07 => "srav",
                0x08 => "jr",
                0x09 => return format!("jalr {d}, {s}"),
                0x0a => "movz",
                0x0b => "movn",
                0x0c => "syscall",
                0x0d => return "break".to_string(),
                0x0f => return "sync".to_string(),
                0x10 => "mfhi",
                0x11 => "mthi",
                0x12 => "mflo",
                0x13 => "mtlo",
                0x18 => "mult",
                0x19 => "multu",
                0x1a => "div",
                0x1b => "divu",
                0x20 => "add",
                0x21 => "addu",
                0x22 => "sub",
                0x23 => "subu",
                0x24 => "and",
                0x25 => "or",
                0x26 => "xor",
                0x27 => "nor",
                0x2a => "slt",
                0x2b => "sltu",
                _ => return format!("invalid special {:#04x}", funct(op)),
            };
            special(name)
        }
        0x01 => {
            let name = match rt(op) {
                0x00 => "bltz",
                0x01 => "bgez",
                0x02 => "bltzl",
                0x03 => "bgezl",
                0x10 => "bltzal",
                0x11 => "bgezal",
                _ => return format!("invalid regimm {:#04x}", rt(op)),
            };
            format!("{name} {s}, {btarget:#010x}")
        }
        0x02 => format!("j {:#010x}", jump_target(op, pc)),
        0x03 => format!("jal {:#010x}", jump_target(op, pc)),
        o @ (0x04 | 0x05 | 0x14 | 0x15) => {
            let name = ["beq", "bne", "beql", "bnel"][(((o >> 3) & 2) | (o & 1)) as usize];
            format!("{name} {s}, {t}, {btarget:#010x}")
        }
        o @ (0x06 | 0x07 | 0x16 | 0x17) => {
            let name = ["blez", "bgtz", "blezl", "bgtzl"][(((o >> 3) & 2) | (o & 1)) as usize];
            format!("{name} {s}, {btarget:#010x}")
        }
        0x08 => format!("addi {t}, {s}, {simm}"),
        0x09 => format!("addiu {t}, {s}, {simm}"),
        0x0a => format!("slti {t}, {s}, {simm}"),
        0x0b => format!("sltiu {t}, {s}, {simm}"),
        0x0c => format!("andi {t}, {s}, {imm:#x}"),
        0x0d => format!("ori {t}, {s}, {imm:#x}"),
        0x0e => format!("xori {t}, {s}, {imm:#x}"),
        0x0f => format!("lui {t}, {imm:#x}"),
        0x1c if funct(op) == 0x02 => format!("mul {d}, {s}, {t}"),
        0x1c if funct(op) == 0x20 => format!("clz {d}, {s}"),
        0x1f if funct(op) == 0x20 && sa(op) == 0x10 => format!("seb {d}, {t}"),
        0x1f if funct(op) == 0x20 && sa(op) == 0x18 => format!("seh {d}, {t}"),
        o @ (0x20 | 0x21 | 0x23 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2b) => {
            let name = match o {
                0x20 => "lb",
                0x21 => "lh",
                0x23 => "lw",
                0x24 => "lbu",
                0x25 => "lhu",
                0x28 => "sb",
                0x29 => "sh",
                _ => "sw",
            };
            format!("{name} {t}, {simm}({s})")
        }
        _ => "invalid".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::asm::*;
    use super::*;

    #[test]
    fn formats_common_ops() {
        assert_eq!(disasm_op(addiu(4, 0, -1), 0), "addiu $a0, $zero, -1");
        assert_eq!(disasm_op(nop(), 0), "nop");
        assert_eq!(disasm_op(lw(2, 29, 8), 0), "lw $v0, 8($sp)");
        assert_eq!(disasm_op(bnel(1, 2, 1), 0x100), "bnel $at, $v0, 0x00000108");
        assert_eq!(disasm_op(bgtz(3, -1), 0x100), "bgtz $v1, 0x00000100");
        assert_eq!(disasm_op(syscall(5), 0), "syscall 0x5");
        assert_eq!(disasm_op(jalr(31, 8), 0), "jalr $ra, $t0");
    }

    #[test]
    fn decode_is_little_endian() {
        assert_eq!(decode(&[0x01, 0x00, 0x00, 0x24]).unwrap(), vec![0x2400_0001]);
        assert!(decode(&[0; 3]).is_err());
    }

    #[test]
    fn listing_has_addresses() {
        let lines = disasm(0x0880_0000, &[nop(), jr(31)]);
        assert_eq!(lines[1], "0x08800004: 03e00008  jr $ra");
    }
}
