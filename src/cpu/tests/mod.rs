//! CPU test suite, organized into:
//! - instructions.rs: individual instructions and instruction families
//! - exceptions.rs: exception and interrupt delivery, vectors, EPC/BD
//! - tlb.rs: translated fetch and data access through the TLB
//!
//! Tests build a one-CPU rig around a bare bus, hand-assemble small
//! programs with the encoder helpers below and step the core directly.

use crate::bits::Endianness;
use crate::bus::Bus;
use crate::memory::{map, Memory};

use super::cp0;
use super::{Cpu, Exception, HI, LO, PC, R31};

mod tlb;

/// One CPU on a deviceless bus with 1 MiB of memory.
fn test_rig() -> (Cpu, Bus) {
    let mem = Memory::new(256, Endianness::Big);
    let mut bus = Bus::new(mem, 100_000, 1);
    bus.init_io();
    (Cpu::new(0, true), bus)
}

/// Place a program at the boot address.
fn load_boot(bus: &mut Bus, words: &[u32]) {
    for (index, &word) in words.iter().enumerate() {
        bus.mem.store32(map::STARTUP_PADDR + 4 * index as u32, word);
    }
}

/// Step `count` full CPU ticks (instruction + timer).
fn run(cpu: &mut Cpu, bus: &mut Bus, count: u32) {
    for _ in 0..count {
        cpu.step(bus);
        cpu.timer_tick();
    }
}

// ========== Encoders ==========

fn r_type(funct: u32, rs: usize, rt: usize, rd: usize, sa: u32) -> u32 {
    ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | (sa << 6) | funct
}

fn i_type(op: u32, rs: usize, rt: usize, imm: u32) -> u32 {
    (op << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | (imm & 0xffff)
}

fn regimm(rt_field: u32, rs: usize, imm: u32) -> u32 {
    (0x01 << 26) | ((rs as u32) << 21) | (rt_field << 16) | (imm & 0xffff)
}

fn special2(funct: u32, rs: usize, rt: usize, rd: usize) -> u32 {
    (0x1c << 26) | ((rs as u32) << 21) | ((rt as u32) << 16) | ((rd as u32) << 11) | funct
}

fn ori(rt: usize, rs: usize, imm: u32) -> u32 {
    i_type(0x0d, rs, rt, imm)
}

fn addi(rt: usize, rs: usize, imm: u32) -> u32 {
    i_type(0x08, rs, rt, imm)
}

fn addiu(rt: usize, rs: usize, imm: u32) -> u32 {
    i_type(0x09, rs, rt, imm)
}

fn lui(rt: usize, imm: u32) -> u32 {
    i_type(0x0f, 0, rt, imm)
}

fn lw(rt: usize, base: usize, offset: u32) -> u32 {
    i_type(0x23, base, rt, offset)
}

fn sw(rt: usize, base: usize, offset: u32) -> u32 {
    i_type(0x2b, base, rt, offset)
}

fn beq(rs: usize, rt: usize, offset: u32) -> u32 {
    i_type(0x04, rs, rt, offset)
}

fn jal(target_word: u32) -> u32 {
    (0x03 << 26) | target_word
}

fn jr(rs: usize) -> u32 {
    r_type(0x08, rs, 0, 0, 0)
}

fn mtc0(rt: usize, rd: usize) -> u32 {
    (0x10 << 26) | (0x04 << 21) | ((rt as u32) << 16) | ((rd as u32) << 11)
}

fn mfc0(rt: usize, rd: usize) -> u32 {
    (0x10 << 26) | ((rt as u32) << 16) | ((rd as u32) << 11)
}

fn cop0_funct(funct: u32) -> u32 {
    (0x10 << 26) | (0x10 << 21) | funct
}

const NOP: u32 = 0;
