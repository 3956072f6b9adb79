//! Instruction disassembler backing the console `dump` command.
//!
//! Output is one line of classical MIPS assembly with conventional
//! register names; branch targets are shown as absolute addresses.

use crate::bits::sign_extend16;

use super::{cp0, Instr, REGISTER_NAMES};

fn reg(index: usize) -> &'static str {
    REGISTER_NAMES[index]
}

fn cp0_reg(index: usize) -> &'static str {
    cp0::REGISTER_NAMES[index]
}

/// Branch destination: relative to the delay slot.
fn target(addr: u32, imm: u16) -> u32 {
    addr.wrapping_add(4).wrapping_add(sign_extend16(imm) << 2)
}

/// Disassemble the word at `addr` into one line of assembly.
pub fn disassemble(addr: u32, word: u32) -> String {
    if word == 0 {
        return "NOP".into();
    }
    let i = Instr::decode(word);

    match i.opcode {
        0x00 => special(&i),
        0x01 => regimm(addr, &i),
        0x02 => format!("j\t{:#010x}", (addr.wrapping_add(4) & 0xf000_0000) | (i.index << 2)),
        0x03 => format!("jal\t{:#010x}", (addr.wrapping_add(4) & 0xf000_0000) | (i.index << 2)),
        0x04 => format!("beq\t${}, ${}, {:#010x}", reg(i.rs), reg(i.rt), target(addr, i.imm)),
        0x05 => format!("bne\t${}, ${}, {:#010x}", reg(i.rs), reg(i.rt), target(addr, i.imm)),
        0x06 => format!("blez\t${}, {:#010x}", reg(i.rs), target(addr, i.imm)),
        0x07 => format!("bgtz\t${}, {:#010x}", reg(i.rs), target(addr, i.imm)),
        0x08 => format!("addi\t${}, ${}, {:#x}", reg(i.rt), reg(i.rs), i.imm),
        0x09 => format!("addiu\t${}, ${}, {:#x}", reg(i.rt), reg(i.rs), i.imm),
        0x0a => format!("slti\t${}, ${}, {:#x}", reg(i.rt), reg(i.rs), i.imm),
        0x0b => format!("sltiu\t${}, ${}, {:#x}", reg(i.rt), reg(i.rs), i.imm),
        0x0c => format!("andi\t${}, ${}, {:#x}", reg(i.rt), reg(i.rs), i.imm),
        0x0d => format!("ori\t${}, ${}, {:#x}", reg(i.rt), reg(i.rs), i.imm),
        0x0e => format!("xori\t${}, ${}, {:#x}", reg(i.rt), reg(i.rs), i.imm),
        0x0f => format!("lui\t${}, {:#x}", reg(i.rt), i.imm),
        0x10 => cop0(&i),
        0x11 | 0x12 | 0x13 => format!("cop{}\t(unusable)", i.opcode - 0x10),
        0x14 => format!("beql\t${}, ${}, {:#010x}", reg(i.rs), reg(i.rt), target(addr, i.imm)),
        0x15 => format!("bnel\t${}, ${}, {:#010x}", reg(i.rs), reg(i.rt), target(addr, i.imm)),
        0x16 => format!("blezl\t${}, {:#010x}", reg(i.rs), target(addr, i.imm)),
        0x17 => format!("bgtzl\t${}, {:#010x}", reg(i.rs), target(addr, i.imm)),
        0x1c => special2(&i),
        0x20 => mem("lb", &i),
        0x21 => mem("lh", &i),
        0x22 => mem("lwl", &i),
        0x23 => mem("lw", &i),
        0x24 => mem("lbu", &i),
        0x25 => mem("lhu", &i),
        0x26 => mem("lwr", &i),
        0x28 => mem("sb", &i),
        0x29 => mem("sh", &i),
        0x2a => mem("swl", &i),
        0x2b => mem("sw", &i),
        0x2e => mem("swr", &i),
        0x2f => "cache".into(),
        0x30 => mem("ll", &i),
        0x33 => "pref".into(),
        0x38 => mem("sc", &i),
        0x31 | 0x32 | 0x35 | 0x36 | 0x39 | 0x3a | 0x3d | 0x3e => {
            "coprocessor load/store (unusable)".into()
        }
        _ => "Invalid instr".into(),
    }
}

fn mem(name: &str, i: &Instr) -> String {
    format!(
        "{}\t${}, {}(${})",
        name,
        reg(i.rt),
        sign_extend16(i.imm) as i32,
        reg(i.rs)
    )
}

fn special(i: &Instr) -> String {
    match i.funct {
        0x00 => format!("sll\t${}, ${}, {:#x}", reg(i.rd), reg(i.rt), i.sa),
        0x02 => format!("srl\t${}, ${}, {:#x}", reg(i.rd), reg(i.rt), i.sa),
        0x03 => format!("sra\t${}, ${}, {:#x}", reg(i.rd), reg(i.rt), i.sa),
        0x04 => format!("sllv\t${}, ${}, ${}", reg(i.rd), reg(i.rt), reg(i.rs)),
        0x06 => format!("srlv\t${}, ${}, ${}", reg(i.rd), reg(i.rt), reg(i.rs)),
        0x07 => format!("srav\t${}, ${}, ${}", reg(i.rd), reg(i.rt), reg(i.rs)),
        0x08 => format!("jr\t${}", reg(i.rs)),
        0x09 => format!("jalr\t${}, ${}", reg(i.rd), reg(i.rs)),
        0x0a => format!("movz\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x0b => format!("movn\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x0c => "syscall".into(),
        0x0d => "break".into(),
        0x0f => "sync".into(),
        0x10 => format!("mfhi\t${}", reg(i.rd)),
        0x11 => format!("mthi\t${}", reg(i.rs)),
        0x12 => format!("mflo\t${}", reg(i.rd)),
        0x13 => format!("mtlo\t${}", reg(i.rs)),
        0x18 => format!("mult\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x19 => format!("multu\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x1a => format!("div\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x1b => format!("divu\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x20 => format!("add\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x21 => format!("addu\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x22 => format!("sub\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x23 => format!("subu\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x24 => format!("and\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x25 => format!("or\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x26 => format!("xor\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x27 => format!("nor\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x2a => format!("slt\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x2b => format!("sltu\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x30 => format!("tge\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x31 => format!("tgeu\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x32 => format!("tlt\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x33 => format!("tltu\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x34 => format!("teq\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x36 => format!("tne\t${}, ${}", reg(i.rs), reg(i.rt)),
        _ => "Invalid instr (SPECIAL)".into(),
    }
}

fn regimm(addr: u32, i: &Instr) -> String {
    let name = match i.rt as u32 {
        0x00 => "bltz",
        0x01 => "bgez",
        0x02 => "bltzl",
        0x03 => "bgezl",
        0x08 => return format!("tgei\t${}, {:#x}", reg(i.rs), i.imm),
        0x09 => return format!("tgeiu\t${}, {:#x}", reg(i.rs), i.imm),
        0x0a => return format!("tlti\t${}, {:#x}", reg(i.rs), i.imm),
        0x0b => return format!("tltiu\t${}, {:#x}", reg(i.rs), i.imm),
        0x0c => return format!("teqi\t${}, {:#x}", reg(i.rs), i.imm),
        0x0e => return format!("tnei\t${}, {:#x}", reg(i.rs), i.imm),
        0x10 => "bltzal",
        0x11 => "bgezal",
        0x12 => "bltzall",
        0x13 => "bgezall",
        _ => return "Invalid instr (REGIMM)".into(),
    };
    format!("{}\t${}, {:#010x}", name, reg(i.rs), target(addr, i.imm))
}

fn special2(i: &Instr) -> String {
    match i.funct {
        0x00 => format!("madd\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x01 => format!("maddu\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x02 => format!("mul\t${}, ${}, ${}", reg(i.rd), reg(i.rs), reg(i.rt)),
        0x04 => format!("msub\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x05 => format!("msubu\t${}, ${}", reg(i.rs), reg(i.rt)),
        0x20 => format!("clz\t${}, ${}", reg(i.rd), reg(i.rs)),
        0x21 => format!("clo\t${}, ${}", reg(i.rd), reg(i.rs)),
        _ => "Invalid instr (SPECIAL2)".into(),
    }
}

fn cop0(i: &Instr) -> String {
    if i.rs as u32 & 0x10 != 0 {
        match i.funct {
            0x01 => "tlbr".into(),
            0x02 => "tlbwi".into(),
            0x06 => "tlbwr".into(),
            0x08 => "tlbp".into(),
            0x18 => "eret".into(),
            0x20 => "wait".into(),
            _ => "Invalid instr (COP0)".into(),
        }
    } else {
        match i.rs as u32 {
            0x00 => format!("mfc0\t${}, {}", reg(i.rt), cp0_reg(i.rd)),
            0x04 => format!("mtc0\t${}, {}", reg(i.rt), cp0_reg(i.rd)),
            _ => "Invalid instr (COP0)".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nop() {
        assert_eq!(disassemble(0, 0), "NOP");
    }

    #[test]
    fn test_ori() {
        // ori $v0, $zero, 0x1234
        let word = (0x0d << 26) | (2 << 16) | 0x1234;
        assert_eq!(disassemble(0, word), "ori\t$v0, $zero, 0x1234");
    }

    #[test]
    fn test_branch_target_is_absolute() {
        // beq $zero, $zero, +1 at 0x80010000 lands at 0x80010008.
        let word = (0x04 << 26) | 1;
        assert_eq!(
            disassemble(0x8001_0000, word),
            "beq\t$zero, $zero, 0x80010008"
        );
    }

    #[test]
    fn test_load_with_negative_offset() {
        // lw $t0, -4($sp)
        let word = (0x23 << 26) | (29 << 21) | (8 << 16) | 0xfffc;
        assert_eq!(disassemble(0, word), "lw\t$t0, -4($sp)");
    }

    #[test]
    fn test_cop0_forms() {
        // mtc0 $k0, Status
        let word = (0x10 << 26) | (0x04 << 21) | (26 << 16) | (12 << 11);
        assert_eq!(disassemble(0, word), "mtc0\t$k0, Status");
        // eret
        let word = (0x10 << 26) | (0x10 << 21) | 0x18;
        assert_eq!(disassemble(0, word), "eret");
    }

    #[test]
    fn test_invalid_word() {
        assert_eq!(disassemble(0, 0x7400_0000), "Invalid instr");
    }
}
