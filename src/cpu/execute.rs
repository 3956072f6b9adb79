//! The instruction interpreter: one classical decode-execute step.
//!
//! Control flow mirrors the pipeline model in [`super`]: `next_next_pc`
//! starts at `next_pc + 4`, branches overwrite it with their target, and
//! branch-likely instructions skip the delay slot by bumping `next_pc`
//! when not taken. An instruction that raises an exception returns
//! [`Flow::Raised`] and leaves PC untouched so delivery can compute EPC
//! from it on the next tick.

use crate::bits::{sign_extend8, sign_extend16};
use crate::bus::{Bus, Width};

use super::{cp0, Cpu, Exception, Instr, HI, LO, PC, R31};

/// Opcode field values.
mod op {
    pub const SPECIAL: u32 = 0x00;
    pub const REGIMM: u32 = 0x01;
    pub const J: u32 = 0x02;
    pub const JAL: u32 = 0x03;
    pub const BEQ: u32 = 0x04;
    pub const BNE: u32 = 0x05;
    pub const BLEZ: u32 = 0x06;
    pub const BGTZ: u32 = 0x07;
    pub const ADDI: u32 = 0x08;
    pub const ADDIU: u32 = 0x09;
    pub const SLTI: u32 = 0x0a;
    pub const SLTIU: u32 = 0x0b;
    pub const ANDI: u32 = 0x0c;
    pub const ORI: u32 = 0x0d;
    pub const XORI: u32 = 0x0e;
    pub const LUI: u32 = 0x0f;
    pub const COP0: u32 = 0x10;
    pub const COP1: u32 = 0x11;
    pub const COP2: u32 = 0x12;
    pub const COP3: u32 = 0x13;
    pub const BEQL: u32 = 0x14;
    pub const BNEL: u32 = 0x15;
    pub const BLEZL: u32 = 0x16;
    pub const BGTZL: u32 = 0x17;
    pub const SPECIAL2: u32 = 0x1c;
    pub const LB: u32 = 0x20;
    pub const LH: u32 = 0x21;
    pub const LWL: u32 = 0x22;
    pub const LW: u32 = 0x23;
    pub const LBU: u32 = 0x24;
    pub const LHU: u32 = 0x25;
    pub const LWR: u32 = 0x26;
    pub const SB: u32 = 0x28;
    pub const SH: u32 = 0x29;
    pub const SWL: u32 = 0x2a;
    pub const SW: u32 = 0x2b;
    pub const SWR: u32 = 0x2e;
    pub const CACHE: u32 = 0x2f;
    pub const LL: u32 = 0x30;
    pub const LWC1: u32 = 0x31;
    pub const LWC2: u32 = 0x32;
    pub const PREF: u32 = 0x33;
    pub const LDC1: u32 = 0x35;
    pub const LDC2: u32 = 0x36;
    pub const SC: u32 = 0x38;
    pub const SWC1: u32 = 0x39;
    pub const SWC2: u32 = 0x3a;
    pub const SDC1: u32 = 0x3d;
    pub const SDC2: u32 = 0x3e;
}

/// SPECIAL function field values.
mod spec {
    pub const SLL: u32 = 0x00;
    pub const MOVC1: u32 = 0x01;
    pub const SRL: u32 = 0x02;
    pub const SRA: u32 = 0x03;
    pub const SLLV: u32 = 0x04;
    pub const SRLV: u32 = 0x06;
    pub const SRAV: u32 = 0x07;
    pub const JR: u32 = 0x08;
    pub const JALR: u32 = 0x09;
    pub const MOVZ: u32 = 0x0a;
    pub const MOVN: u32 = 0x0b;
    pub const SYSCALL: u32 = 0x0c;
    pub const BREAK: u32 = 0x0d;
    pub const SYNC: u32 = 0x0f;
    pub const MFHI: u32 = 0x10;
    pub const MTHI: u32 = 0x11;
    pub const MFLO: u32 = 0x12;
    pub const MTLO: u32 = 0x13;
    pub const MULT: u32 = 0x18;
    pub const MULTU: u32 = 0x19;
    pub const DIV: u32 = 0x1a;
    pub const DIVU: u32 = 0x1b;
    pub const ADD: u32 = 0x20;
    pub const ADDU: u32 = 0x21;
    pub const SUB: u32 = 0x22;
    pub const SUBU: u32 = 0x23;
    pub const AND: u32 = 0x24;
    pub const OR: u32 = 0x25;
    pub const XOR: u32 = 0x26;
    pub const NOR: u32 = 0x27;
    pub const SLT: u32 = 0x2a;
    pub const SLTU: u32 = 0x2b;
    pub const TGE: u32 = 0x30;
    pub const TGEU: u32 = 0x31;
    pub const TLT: u32 = 0x32;
    pub const TLTU: u32 = 0x33;
    pub const TEQ: u32 = 0x34;
    pub const TNE: u32 = 0x36;
}

/// REGIMM rt field values.
mod regimm {
    pub const BLTZ: u32 = 0x00;
    pub const BGEZ: u32 = 0x01;
    pub const BLTZL: u32 = 0x02;
    pub const BGEZL: u32 = 0x03;
    pub const TGEI: u32 = 0x08;
    pub const TGEIU: u32 = 0x09;
    pub const TLTI: u32 = 0x0a;
    pub const TLTIU: u32 = 0x0b;
    pub const TEQI: u32 = 0x0c;
    pub const TNEI: u32 = 0x0e;
    pub const BLTZAL: u32 = 0x10;
    pub const BGEZAL: u32 = 0x11;
    pub const BLTZALL: u32 = 0x12;
    pub const BGEZALL: u32 = 0x13;
}

/// SPECIAL2 function field values. Encoded strictly by value; the
/// architecture manual's binary column is off by one around MSUB.
mod spec2 {
    pub const MADD: u32 = 0x00;
    pub const MADDU: u32 = 0x01;
    pub const MUL: u32 = 0x02;
    pub const MSUB: u32 = 0x04;
    pub const MSUBU: u32 = 0x05;
    pub const CLZ: u32 = 0x20;
    pub const CLO: u32 = 0x21;
}

/// COP0 rs / function field values.
mod cop0_op {
    pub const MFC0: u32 = 0x00;
    pub const MTC0: u32 = 0x04;
    pub const TLBR: u32 = 0x01;
    pub const TLBWI: u32 = 0x02;
    pub const TLBWR: u32 = 0x06;
    pub const TLBP: u32 = 0x08;
    pub const ERET: u32 = 0x18;
    pub const WAIT: u32 = 0x20;
}

/// How the instruction ended.
pub(super) enum Flow {
    /// Rotate PC forward as usual.
    Continue,
    /// An exception was latched; PC must not advance.
    Raised,
}

/// Signed-overflow detecting add: operands of the same sign producing a
/// result of the other sign.
fn add_overflow(left: u32, right: u32) -> (u32, bool) {
    let samesign = (!(left ^ right)) >> 31 != 0;
    let result = left.wrapping_add(right);
    (result, samesign && (left ^ result) >> 31 != 0)
}

fn branch_target(cpu: &Cpu, imm: u16) -> u32 {
    (sign_extend16(imm) << 2).wrapping_add(cpu.next_pc)
}

/// Skip the delay slot of an untaken branch-likely.
fn nullify_delay_slot(cpu: &mut Cpu, next_next_pc: &mut u32) {
    cpu.next_pc = *next_next_pc;
    *next_next_pc = cpu.next_pc.wrapping_add(4);
}

pub(super) fn execute(
    cpu: &mut Cpu,
    bus: &mut Bus,
    i: Instr,
    next_next_pc: &mut u32,
    store: &mut Option<u32>,
) -> Flow {
    match i.opcode {
        op::SPECIAL => exec_special(cpu, i, next_next_pc),
        op::REGIMM => exec_regimm(cpu, i, next_next_pc),
        op::SPECIAL2 => exec_special2(cpu, i),
        op::COP0 => exec_cop0(cpu, i, next_next_pc),

        op::J => {
            *next_next_pc =
                (cpu.regs[PC].wrapping_add(4) & 0xf000_0000) | (i.index << 2);
            Flow::Continue
        }
        op::JAL => {
            // Jump within the current 256 MB region; ra gets the return
            // address past the delay slot.
            cpu.write_reg(R31, cpu.regs[PC].wrapping_add(8));
            *next_next_pc =
                (cpu.regs[PC].wrapping_add(4) & 0xf000_0000) | (i.index << 2);
            Flow::Continue
        }

        op::BEQ => {
            if cpu.read_reg(i.rs) == cpu.read_reg(i.rt) {
                *next_next_pc = branch_target(cpu, i.imm);
            }
            Flow::Continue
        }
        op::BNE => {
            if cpu.read_reg(i.rs) != cpu.read_reg(i.rt) {
                *next_next_pc = branch_target(cpu, i.imm);
            }
            Flow::Continue
        }
        op::BLEZ => {
            if (cpu.read_reg(i.rs) as i32) <= 0 {
                *next_next_pc = branch_target(cpu, i.imm);
            }
            Flow::Continue
        }
        op::BGTZ => {
            if (cpu.read_reg(i.rs) as i32) > 0 {
                *next_next_pc = branch_target(cpu, i.imm);
            }
            Flow::Continue
        }
        op::BEQL => {
            if cpu.read_reg(i.rs) == cpu.read_reg(i.rt) {
                *next_next_pc = branch_target(cpu, i.imm);
            } else {
                nullify_delay_slot(cpu, next_next_pc);
            }
            Flow::Continue
        }
        op::BNEL => {
            if cpu.read_reg(i.rs) != cpu.read_reg(i.rt) {
                *next_next_pc = branch_target(cpu, i.imm);
            } else {
                nullify_delay_slot(cpu, next_next_pc);
            }
            Flow::Continue
        }
        op::BLEZL => {
            if (cpu.read_reg(i.rs) as i32) <= 0 {
                *next_next_pc = branch_target(cpu, i.imm);
            } else {
                nullify_delay_slot(cpu, next_next_pc);
            }
            Flow::Continue
        }
        op::BGTZL => {
            if (cpu.read_reg(i.rs) as i32) > 0 {
                *next_next_pc = branch_target(cpu, i.imm);
            } else {
                nullify_delay_slot(cpu, next_next_pc);
            }
            Flow::Continue
        }

        op::ADDI => {
            let (result, overflow) =
                add_overflow(cpu.read_reg(i.rs), sign_extend16(i.imm));
            if overflow {
                cpu.raise(Exception::ArithmeticOverflow);
                return Flow::Raised;
            }
            cpu.write_reg(i.rt, result);
            Flow::Continue
        }
        op::ADDIU => {
            let result = cpu.read_reg(i.rs).wrapping_add(sign_extend16(i.imm));
            cpu.write_reg(i.rt, result);
            Flow::Continue
        }
        op::SLTI => {
            let flag = (cpu.read_reg(i.rs) as i32) < sign_extend16(i.imm) as i32;
            cpu.write_reg(i.rt, flag as u32);
            Flow::Continue
        }
        op::SLTIU => {
            let flag = cpu.read_reg(i.rs) < sign_extend16(i.imm);
            cpu.write_reg(i.rt, flag as u32);
            Flow::Continue
        }
        op::ANDI => {
            cpu.write_reg(i.rt, cpu.read_reg(i.rs) & i.imm as u32);
            Flow::Continue
        }
        op::ORI => {
            cpu.write_reg(i.rt, cpu.read_reg(i.rs) | i.imm as u32);
            Flow::Continue
        }
        op::XORI => {
            cpu.write_reg(i.rt, cpu.read_reg(i.rs) ^ i.imm as u32);
            Flow::Continue
        }
        op::LUI => {
            cpu.write_reg(i.rt, (i.imm as u32) << 16);
            Flow::Continue
        }

        op::COP1 | op::LWC1 | op::LDC1 | op::SWC1 | op::SDC1 => {
            cpu.raise_cp(1);
            Flow::Raised
        }
        op::COP2 | op::LWC2 | op::LDC2 | op::SWC2 | op::SDC2 => {
            cpu.raise_cp(2);
            Flow::Raised
        }
        op::COP3 => {
            cpu.raise_cp(3);
            Flow::Raised
        }

        op::LB => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            match bus.read(&cpu.cp0, vaddr, Width::Byte) {
                Ok(byte) => cpu.write_reg(i.rt, sign_extend8(byte as u8)),
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            }
            Flow::Continue
        }
        op::LH => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            match bus.read(&cpu.cp0, vaddr, Width::Half) {
                Ok(half) => cpu.write_reg(i.rt, sign_extend16(half as u16)),
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            }
            Flow::Continue
        }
        op::LBU => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            match bus.read(&cpu.cp0, vaddr, Width::Byte) {
                Ok(byte) => cpu.write_reg(i.rt, byte),
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            }
            Flow::Continue
        }
        op::LHU => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            match bus.read(&cpu.cp0, vaddr, Width::Half) {
                Ok(half) => cpu.write_reg(i.rt, half),
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            }
            Flow::Continue
        }
        op::LW => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            match bus.read(&cpu.cp0, vaddr, Width::Word) {
                Ok(word) => cpu.write_reg(i.rt, word),
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            }
            Flow::Continue
        }
        op::LWL => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            let word = match bus.read(&cpu.cp0, vaddr & !3, Width::Word) {
                Ok(word) => word,
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            };
            let merged = word << ((vaddr & 3) * 8);
            let sft = 32 - (vaddr & 3) * 8;
            let mask = if sft >= 32 { 0 } else { u32::MAX >> sft };
            cpu.write_reg(i.rt, (cpu.read_reg(i.rt) & mask) | merged);
            Flow::Continue
        }
        op::LWR => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            let word = match bus.read(&cpu.cp0, vaddr & !3, Width::Word) {
                Ok(word) => word,
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            };
            let merged = word >> (24 - (vaddr & 3) * 8);
            let sft = 8 + (vaddr & 3) * 8;
            let mask = if sft >= 32 { 0 } else { u32::MAX << sft };
            cpu.write_reg(i.rt, (cpu.read_reg(i.rt) & mask) | merged);
            Flow::Continue
        }

        op::SB => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            let value = cpu.read_reg(i.rt) & 0xff;
            if let Err(exc) = bus.write(&cpu.cp0, vaddr, Width::Byte, value) {
                cpu.raise_address(exc, vaddr);
                return Flow::Raised;
            }
            *store = Some(bus.phys_addr(&cpu.cp0, vaddr & !3));
            Flow::Continue
        }
        op::SH => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            let value = cpu.read_reg(i.rt) & 0xffff;
            if let Err(exc) = bus.write(&cpu.cp0, vaddr, Width::Half, value) {
                cpu.raise_address(exc, vaddr);
                return Flow::Raised;
            }
            *store = Some(bus.phys_addr(&cpu.cp0, vaddr & !3));
            Flow::Continue
        }
        op::SW => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            let value = cpu.read_reg(i.rt);
            if let Err(exc) = bus.write(&cpu.cp0, vaddr, Width::Word, value) {
                cpu.raise_address(exc, vaddr);
                return Flow::Raised;
            }
            *store = Some(bus.phys_addr(&cpu.cp0, vaddr));
            Flow::Continue
        }
        op::SWL => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            let word = match bus.read(&cpu.cp0, vaddr & !3, Width::Word) {
                Ok(word) => word,
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            };
            let sft = 32 - (vaddr & 3) * 8;
            let mask = if sft >= 32 { 0 } else { u32::MAX << sft };
            let merged = (word & mask) | (cpu.read_reg(i.rt) >> ((vaddr & 3) * 8));
            if let Err(exc) = bus.write(&cpu.cp0, vaddr & !3, Width::Word, merged) {
                cpu.raise_address(exc, vaddr);
                return Flow::Raised;
            }
            *store = Some(bus.phys_addr(&cpu.cp0, vaddr & !3));
            Flow::Continue
        }
        op::SWR => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            let word = match bus.read(&cpu.cp0, vaddr & !3, Width::Word) {
                Ok(word) => word,
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            };
            let sft = 8 + (vaddr & 3) * 8;
            let mask = if sft >= 32 { 0 } else { u32::MAX >> sft };
            let merged = (word & mask) | (cpu.read_reg(i.rt) << (24 - (vaddr & 3) * 8));
            if let Err(exc) = bus.write(&cpu.cp0, vaddr & !3, Width::Word, merged) {
                cpu.raise_address(exc, vaddr);
                return Flow::Raised;
            }
            *store = Some(bus.phys_addr(&cpu.cp0, vaddr & !3));
            Flow::Continue
        }

        // No caches: nothing to flush or prefetch.
        op::CACHE | op::PREF => Flow::Continue,

        op::LL => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            match bus.read(&cpu.cp0, vaddr, Width::Word) {
                Ok(word) => {
                    cpu.write_reg(i.rt, word);
                    // Start the atomic read-modify-write sequence.
                    cpu.cp0.regs[cp0::LLADDR] = bus.phys_addr(&cpu.cp0, vaddr);
                }
                Err(exc) => {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
            }
            Flow::Continue
        }
        op::SC => {
            let vaddr = sign_extend16(i.imm).wrapping_add(cpu.read_reg(i.rs));
            // Probe for exceptions first so a failed reservation still
            // faults the way a store would.
            if let Err(exc) = bus.write(&cpu.cp0, vaddr, Width::Probe, 0) {
                cpu.raise_address(exc, vaddr);
                return Flow::Raised;
            }
            let paddr = bus.phys_addr(&cpu.cp0, vaddr);

            if cpu.cp0.regs[cp0::LLADDR] == paddr {
                let value = cpu.read_reg(i.rt);
                if let Err(exc) = bus.write(&cpu.cp0, vaddr, Width::Word, value) {
                    cpu.raise_address(exc, vaddr);
                    return Flow::Raised;
                }
                // Break every other CPU's sequence on this word.
                *store = Some(paddr);
                cpu.write_reg(i.rt, 1);
            } else {
                cpu.write_reg(i.rt, 0);
            }
            Flow::Continue
        }

        _ => {
            cpu.raise(Exception::ReservedInstruction);
            Flow::Raised
        }
    }
}

fn exec_special(cpu: &mut Cpu, i: Instr, next_next_pc: &mut u32) -> Flow {
    match i.funct {
        spec::SLL => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rt) << i.sa);
        }
        spec::SRL => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rt) >> i.sa);
        }
        spec::SRA => {
            cpu.write_reg(i.rd, ((cpu.read_reg(i.rt) as i32) >> i.sa) as u32);
        }
        spec::SLLV => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rt) << (cpu.read_reg(i.rs) & 0x1f));
        }
        spec::SRLV => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rt) >> (cpu.read_reg(i.rs) & 0x1f));
        }
        spec::SRAV => {
            let shift = cpu.read_reg(i.rs) & 0x1f;
            cpu.write_reg(i.rd, ((cpu.read_reg(i.rt) as i32) >> shift) as u32);
        }
        spec::JR => {
            *next_next_pc = cpu.read_reg(i.rs);
        }
        spec::JALR => {
            cpu.write_reg(i.rd, cpu.regs[PC].wrapping_add(8));
            *next_next_pc = cpu.read_reg(i.rs);
        }
        spec::MOVZ => {
            if cpu.read_reg(i.rt) == 0 {
                cpu.write_reg(i.rd, cpu.read_reg(i.rs));
            }
        }
        spec::MOVN => {
            if cpu.read_reg(i.rt) != 0 {
                cpu.write_reg(i.rd, cpu.read_reg(i.rs));
            }
        }
        spec::SYSCALL => {
            cpu.raise(Exception::Syscall);
            return Flow::Raised;
        }
        spec::BREAK => {
            cpu.raise(Exception::Breakpoint);
            return Flow::Raised;
        }
        spec::SYNC => {}
        spec::MOVC1 => {
            cpu.raise_cp(1);
            return Flow::Raised;
        }
        spec::MFHI => {
            cpu.write_reg(i.rd, cpu.regs[HI]);
        }
        spec::MTHI => {
            cpu.regs[HI] = cpu.read_reg(i.rs);
        }
        spec::MFLO => {
            cpu.write_reg(i.rd, cpu.regs[LO]);
        }
        spec::MTLO => {
            cpu.regs[LO] = cpu.read_reg(i.rs);
        }
        spec::MULT => {
            let product = (cpu.read_reg(i.rs) as i32 as i64)
                * (cpu.read_reg(i.rt) as i32 as i64);
            cpu.regs[LO] = product as u32;
            cpu.regs[HI] = (product >> 32) as u32;
        }
        spec::MULTU => {
            let product = (cpu.read_reg(i.rs) as u64) * (cpu.read_reg(i.rt) as u64);
            cpu.regs[LO] = product as u32;
            cpu.regs[HI] = (product >> 32) as u32;
        }
        spec::DIV => {
            let dividend = cpu.read_reg(i.rs);
            let divisor = cpu.read_reg(i.rt);
            if divisor == 0 {
                // Result is unpredictable; HI/LO stay as they were.
            } else if dividend == 0x8000_0000 && divisor == 0xffff_ffff {
                // i32::MIN / -1 would trap on the host.
                cpu.regs[LO] = 0x8000_0000;
                cpu.regs[HI] = 0;
            } else {
                cpu.regs[LO] = ((dividend as i32) / (divisor as i32)) as u32;
                cpu.regs[HI] = ((dividend as i32) % (divisor as i32)) as u32;
            }
        }
        spec::DIVU => {
            let divisor = cpu.read_reg(i.rt);
            if divisor != 0 {
                cpu.regs[LO] = cpu.read_reg(i.rs) / divisor;
                cpu.regs[HI] = cpu.read_reg(i.rs) % divisor;
            }
        }
        spec::ADD => {
            let (result, overflow) =
                add_overflow(cpu.read_reg(i.rs), cpu.read_reg(i.rt));
            if overflow {
                cpu.raise(Exception::ArithmeticOverflow);
                return Flow::Raised;
            }
            cpu.write_reg(i.rd, result);
        }
        spec::ADDU => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rs).wrapping_add(cpu.read_reg(i.rt)));
        }
        spec::SUB => {
            let left = cpu.read_reg(i.rs);
            let right = (!cpu.read_reg(i.rt)).wrapping_add(1);
            // 0x80000000 has no valid negation but the addition works;
            // treat it as positive for the same-sign test.
            let samesign = if right == 0x8000_0000 {
                (!(left ^ 0)) >> 31 != 0
            } else {
                (!(left ^ right)) >> 31 != 0
            };
            let result = left.wrapping_add(right);
            if samesign && (left ^ result) >> 31 != 0 {
                cpu.raise(Exception::ArithmeticOverflow);
                return Flow::Raised;
            }
            cpu.write_reg(i.rd, result);
        }
        spec::SUBU => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rs).wrapping_sub(cpu.read_reg(i.rt)));
        }
        spec::AND => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rs) & cpu.read_reg(i.rt));
        }
        spec::OR => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rs) | cpu.read_reg(i.rt));
        }
        spec::XOR => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rs) ^ cpu.read_reg(i.rt));
        }
        spec::NOR => {
            cpu.write_reg(i.rd, !(cpu.read_reg(i.rs) | cpu.read_reg(i.rt)));
        }
        spec::SLT => {
            let flag = (cpu.read_reg(i.rs) as i32) < (cpu.read_reg(i.rt) as i32);
            cpu.write_reg(i.rd, flag as u32);
        }
        spec::SLTU => {
            let flag = cpu.read_reg(i.rs) < cpu.read_reg(i.rt);
            cpu.write_reg(i.rd, flag as u32);
        }
        spec::TGE => {
            if (cpu.read_reg(i.rs) as i32) >= (cpu.read_reg(i.rt) as i32) {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        spec::TGEU => {
            if cpu.read_reg(i.rs) >= cpu.read_reg(i.rt) {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        spec::TLT => {
            if (cpu.read_reg(i.rs) as i32) < (cpu.read_reg(i.rt) as i32) {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        spec::TLTU => {
            if cpu.read_reg(i.rs) < cpu.read_reg(i.rt) {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        spec::TEQ => {
            if cpu.read_reg(i.rs) == cpu.read_reg(i.rt) {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        spec::TNE => {
            if cpu.read_reg(i.rs) != cpu.read_reg(i.rt) {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        _ => {
            cpu.raise(Exception::ReservedInstruction);
            return Flow::Raised;
        }
    }
    Flow::Continue
}

fn exec_regimm(cpu: &mut Cpu, i: Instr, next_next_pc: &mut u32) -> Flow {
    let rt = i.rt as u32;
    match rt {
        regimm::BLTZ => {
            if (cpu.read_reg(i.rs) as i32) < 0 {
                *next_next_pc = branch_target(cpu, i.imm);
            }
        }
        regimm::BGEZ => {
            if (cpu.read_reg(i.rs) as i32) >= 0 {
                *next_next_pc = branch_target(cpu, i.imm);
            }
        }
        regimm::BLTZL => {
            if (cpu.read_reg(i.rs) as i32) < 0 {
                *next_next_pc = branch_target(cpu, i.imm);
            } else {
                nullify_delay_slot(cpu, next_next_pc);
            }
        }
        regimm::BGEZL => {
            if (cpu.read_reg(i.rs) as i32) >= 0 {
                *next_next_pc = branch_target(cpu, i.imm);
            } else {
                nullify_delay_slot(cpu, next_next_pc);
            }
        }
        regimm::BLTZAL => {
            let target = branch_target(cpu, i.imm);
            cpu.write_reg(R31, cpu.regs[PC].wrapping_add(8));
            if (cpu.read_reg(i.rs) as i32) < 0 {
                *next_next_pc = target;
            }
        }
        regimm::BGEZAL => {
            let target = branch_target(cpu, i.imm);
            cpu.write_reg(R31, cpu.regs[PC].wrapping_add(8));
            if (cpu.read_reg(i.rs) as i32) >= 0 {
                *next_next_pc = target;
            }
        }
        regimm::BLTZALL => {
            let target = branch_target(cpu, i.imm);
            cpu.write_reg(R31, cpu.regs[PC].wrapping_add(8));
            if (cpu.read_reg(i.rs) as i32) < 0 {
                *next_next_pc = target;
            } else {
                nullify_delay_slot(cpu, next_next_pc);
            }
        }
        regimm::BGEZALL => {
            let target = branch_target(cpu, i.imm);
            cpu.write_reg(R31, cpu.regs[PC].wrapping_add(8));
            if (cpu.read_reg(i.rs) as i32) >= 0 {
                *next_next_pc = target;
            } else {
                nullify_delay_slot(cpu, next_next_pc);
            }
        }
        regimm::TGEI => {
            if (cpu.read_reg(i.rs) as i32) >= sign_extend16(i.imm) as i32 {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        regimm::TGEIU => {
            if cpu.read_reg(i.rs) >= sign_extend16(i.imm) {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        regimm::TLTI => {
            if (cpu.read_reg(i.rs) as i32) < sign_extend16(i.imm) as i32 {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        regimm::TLTIU => {
            if cpu.read_reg(i.rs) < sign_extend16(i.imm) {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        regimm::TEQI => {
            if (cpu.read_reg(i.rs) as i32) == sign_extend16(i.imm) as i32 {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        regimm::TNEI => {
            if (cpu.read_reg(i.rs) as i32) != sign_extend16(i.imm) as i32 {
                cpu.raise(Exception::Trap);
                return Flow::Raised;
            }
        }
        _ => {
            cpu.raise(Exception::ReservedInstruction);
            return Flow::Raised;
        }
    }
    Flow::Continue
}

fn exec_special2(cpu: &mut Cpu, i: Instr) -> Flow {
    match i.funct {
        spec2::MADD => {
            let product = (cpu.read_reg(i.rs) as i32 as i64)
                * (cpu.read_reg(i.rt) as i32 as i64);
            let hilo = (((cpu.regs[HI] as u64) << 32) + cpu.regs[LO] as u64) as i64;
            let result = hilo.wrapping_add(product);
            cpu.regs[LO] = result as u32;
            cpu.regs[HI] = (result >> 32) as u32;
        }
        spec2::MADDU => {
            let product = (cpu.read_reg(i.rs) as u64) * (cpu.read_reg(i.rt) as u64);
            let hilo = ((cpu.regs[HI] as u64) << 32) + cpu.regs[LO] as u64;
            let result = hilo.wrapping_add(product);
            cpu.regs[LO] = result as u32;
            cpu.regs[HI] = (result >> 32) as u32;
        }
        spec2::MUL => {
            let product = (cpu.read_reg(i.rs) as i32 as i64)
                * (cpu.read_reg(i.rt) as i32 as i64);
            cpu.write_reg(i.rd, product as u32);
        }
        spec2::MSUB => {
            let product = (cpu.read_reg(i.rs) as i32 as i64)
                * (cpu.read_reg(i.rt) as i32 as i64);
            let hilo = (((cpu.regs[HI] as u64) << 32) + cpu.regs[LO] as u64) as i64;
            let result = hilo.wrapping_sub(product);
            cpu.regs[LO] = result as u32;
            cpu.regs[HI] = (result >> 32) as u32;
        }
        spec2::MSUBU => {
            let product = (cpu.read_reg(i.rs) as u64) * (cpu.read_reg(i.rt) as u64);
            let hilo = ((cpu.regs[HI] as u64) << 32) + cpu.regs[LO] as u64;
            let result = hilo.wrapping_sub(product);
            cpu.regs[LO] = result as u32;
            cpu.regs[HI] = (result >> 32) as u32;
        }
        spec2::CLZ => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rs).leading_zeros());
        }
        spec2::CLO => {
            cpu.write_reg(i.rd, cpu.read_reg(i.rs).leading_ones());
        }
        _ => {
            cpu.raise(Exception::ReservedInstruction);
            return Flow::Raised;
        }
    }
    Flow::Continue
}

fn exec_cop0(cpu: &mut Cpu, i: Instr, next_next_pc: &mut u32) -> Flow {
    if !cpu.cp0.kernel_mode() {
        cpu.raise_cp(0);
        return Flow::Raised;
    }

    if i.rs as u32 & 0x10 != 0 {
        match i.funct {
            cop0_op::TLBR => cpu.cp0.tlb_read_indexed(),
            cop0_op::TLBWI => cpu.cp0.tlb_write_indexed(),
            cop0_op::TLBWR => cpu.cp0.tlb_write_random(),
            cop0_op::TLBP => cpu.cp0.tlb_probe(),
            cop0_op::ERET => {
                let target = if cpu.cp0.status_erl() {
                    cpu.cp0.set_status_erl(false);
                    cpu.cp0.regs[cp0::ERROR_EPC]
                } else {
                    cpu.cp0.set_status_exl(false);
                    cpu.cp0.regs[cp0::EPC]
                };
                cpu.next_pc = target;
                *next_next_pc = target.wrapping_add(4);
                // Returning from the handler ends any RMW sequence.
                cpu.cp0.regs[cp0::LLADDR] = 0xffff_ffff;
            }
            cop0_op::WAIT => {
                // Stall by holding PC; Status.RP marks the power-save
                // state so interrupt delivery resumes past the WAIT.
                cpu.next_pc = cpu.regs[PC];
                *next_next_pc = cpu.regs[PC];
                cpu.cp0.set_status_rp(true);
            }
            _ => {
                cpu.raise(Exception::ReservedInstruction);
                return Flow::Raised;
            }
        }
    } else {
        match i.rs as u32 {
            cop0_op::MFC0 => {
                let sel = i.word & 0x7;
                cpu.write_reg(i.rt, cpu.cp0.mfc0(i.rd, sel));
            }
            cop0_op::MTC0 => {
                let value = cpu.read_reg(i.rt);
                cpu.cp0.mtc0(i.rd, value);
            }
            _ => {
                cpu.raise(Exception::ReservedInstruction);
                return Flow::Raised;
            }
        }
    }
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_overflow_detection() {
        assert_eq!(add_overflow(1, 1), (2, false));
        assert_eq!(add_overflow(0x7fff_ffff, 1), (0x8000_0000, true));
        assert_eq!(add_overflow(0x8000_0000, 0x8000_0000), (0, true));
        assert_eq!(add_overflow(0x7fff_ffff, 0xffff_ffff), (0x7fff_fffe, false));
    }
}
