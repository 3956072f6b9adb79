//! MIPS32 R2 CPU core.
//!
//! One instruction executes per simulated clock tick. Branch-delay slots
//! are modeled with a `next_pc` register: `next_pc` is `PC + 4` except
//! while a branch is in flight, when it holds the branch target. A tick
//! runs in the order the real pipeline would make visible:
//!
//! 1. deliver a latched exception or a pending, unmasked interrupt;
//! 2. fetch and decode the instruction at PC;
//! 3. execute it, accumulating the next `next_pc`;
//! 4. rotate PC forward and check the hardware breakpoint;
//! 5. advance the Count/Compare timer.
//!
//! Synchronous exceptions raised while executing are latched on the CPU
//! and delivered at the start of the *next* tick, which is also when EPC,
//! Cause.BD and the vector are chosen.
//!
//! # Module organization
//!
//! - `cp0`: coprocessor-0 registers and the TLB
//! - `execute`: the instruction interpreter
//! - `disasm`: disassembler used by the console `dump` command

pub mod cp0;
pub mod disasm;
mod execute;

#[cfg(test)]
mod tests;

pub use cp0::{Cp0, RefType, NUM_TLB_ENTRIES};

use crate::bus::{Bus, RunState, Width};
use crate::memory::map;

/// General register numbers, including the three pseudo registers the
/// console exposes by name.
pub const ZERO: usize = 0;
pub const R31: usize = 31;
pub const PC: usize = 32;
pub const HI: usize = 33;
pub const LO: usize = 34;

pub const NUM_REGS: usize = 35;

/// Conventional register names, indexed by register number.
pub const REGISTER_NAMES: [&str; NUM_REGS] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3",
    "t4", "t5", "t6", "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7",
    "t8", "t9", "k0", "k1", "gp", "sp", "fp", "ra", "pc", "hi", "lo",
];

/// Resolve a register name (conventional or `rN`) to its number.
pub fn register_number(name: &str) -> Option<u32> {
    if let Some(n) = name.strip_prefix('r') {
        if let Ok(n) = n.parse::<u32>() {
            return (n < NUM_REGS as u32).then_some(n);
        }
    }
    REGISTER_NAMES
        .iter()
        .position(|&r| r.eq_ignore_ascii_case(name))
        .map(|i| i as u32)
}

/// Guest-visible synchronous exceptions.
///
/// `TlbLoadInvalid` and `TlbStoreInvalid` are internal-only: the TLB
/// reports them so delivery can route an invalid-entry fault to the
/// general vector instead of the refill vector, and they are rewritten to
/// `TlbLoad`/`TlbStore` before Cause.ExcCode is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    TlbModification,
    TlbLoad,
    TlbStore,
    AddressLoad,
    AddressStore,
    BusErrorInstr,
    BusErrorData,
    Syscall,
    Breakpoint,
    ReservedInstruction,
    CoprocessorUnusable,
    ArithmeticOverflow,
    Trap,
    TlbLoadInvalid,
    TlbStoreInvalid,
}

impl Exception {
    /// Architectural Cause.ExcCode value.
    pub fn code(self) -> u32 {
        match self {
            Exception::TlbModification => 1,
            Exception::TlbLoad => 2,
            Exception::TlbStore => 3,
            Exception::AddressLoad => 4,
            Exception::AddressStore => 5,
            Exception::BusErrorInstr => 6,
            Exception::BusErrorData => 7,
            Exception::Syscall => 8,
            Exception::Breakpoint => 9,
            Exception::ReservedInstruction => 10,
            Exception::CoprocessorUnusable => 11,
            Exception::ArithmeticOverflow => 12,
            Exception::Trap => 13,
            Exception::TlbLoadInvalid => 32,
            Exception::TlbStoreInvalid => 33,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Exception::TlbModification => "TLBModification",
            Exception::TlbLoad => "TLBLoad",
            Exception::TlbStore => "TLBStore",
            Exception::AddressLoad => "AddressLoad",
            Exception::AddressStore => "AddressStore",
            Exception::BusErrorInstr => "BusErrorInstr",
            Exception::BusErrorData => "BusErrorData",
            Exception::Syscall => "Syscall",
            Exception::Breakpoint => "Breakpoint",
            Exception::ReservedInstruction => "ReservedInstruction",
            Exception::CoprocessorUnusable => "CoprocessorUnusable",
            Exception::ArithmeticOverflow => "ArithmeticOverflow",
            Exception::Trap => "Trap",
            Exception::TlbLoadInvalid => "TLBLoadInvalid",
            Exception::TlbStoreInvalid => "TLBStoreInvalid",
        }
    }
}

/// Classical MIPS32 instruction fields.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub word: u32,
    pub opcode: u32,
    pub rs: usize,
    pub rt: usize,
    pub rd: usize,
    pub sa: u32,
    pub index: u32,
    pub imm: u16,
    pub funct: u32,
}

impl Instr {
    pub fn decode(word: u32) -> Self {
        Self {
            word,
            opcode: word >> 26,
            rs: ((word & 0x03e0_0000) >> 21) as usize,
            rt: ((word & 0x001f_0000) >> 16) as usize,
            rd: ((word & 0x0000_f800) >> 11) as usize,
            sa: (word & 0x0000_07c0) >> 6,
            index: word & 0x03ff_ffff,
            imm: (word & 0xffff) as u16,
            funct: word & 0x3f,
        }
    }
}

/// One MIPS32 processor.
pub struct Cpu {
    pub regs: [u32; NUM_REGS],
    /// Address of the instruction to run after the current one; equals
    /// PC + 4 except while a branch delay slot is in flight.
    pub next_pc: u32,
    /// At most one latched synchronous exception per tick.
    pub pending: Option<Exception>,
    pub cp0: Cp0,
    pub id: u32,
}

impl Cpu {
    pub fn new(id: u32, big_endian: bool) -> Self {
        let mut regs = [0u32; NUM_REGS];
        regs[PC] = map::STARTUP_PC;
        Self {
            regs,
            next_pc: map::STARTUP_PC + 4,
            pending: None,
            cp0: Cp0::new(id, big_endian),
            id,
        }
    }

    pub fn read_reg(&self, reg: usize) -> u32 {
        self.regs[reg]
    }

    /// Write a register; writes to register 0 are discarded.
    pub fn write_reg(&mut self, reg: usize, value: u32) {
        if reg != ZERO {
            self.regs[reg] = value;
        }
    }

    /// Point the CPU at `pc`, clearing any in-flight delay slot.
    pub fn set_pc(&mut self, pc: u32) {
        self.regs[PC] = pc;
        self.next_pc = pc.wrapping_add(4);
    }

    pub(crate) fn raise(&mut self, exc: Exception) {
        self.pending = Some(exc);
    }

    pub(crate) fn raise_address(&mut self, exc: Exception, vaddr: u32) {
        if matches!(
            exc,
            Exception::TlbModification
                | Exception::TlbLoad
                | Exception::TlbStore
                | Exception::TlbLoadInvalid
                | Exception::TlbStoreInvalid
        ) {
            // TLB exceptions also report the fault through Context and
            // EntryHi; the ASID field already holds the current value.
            self.cp0.set_context_bad_vpn2(vaddr);
            self.cp0.set_entry_hi_bad_vpn2(vaddr);
        }
        self.pending = Some(exc);
        self.cp0.regs[cp0::BAD_VADDR] = vaddr;
    }

    pub(crate) fn raise_cp(&mut self, cp: u32) {
        self.pending = Some(Exception::CoprocessorUnusable);
        self.cp0.set_cause_ce(cp);
    }

    /// Is there an event to deliver this tick? `Some(None)` is an
    /// interrupt, `Some(Some(exc))` a latched synchronous exception.
    fn exception_condition(&mut self) -> Option<Option<Exception>> {
        if let Some(exc) = self.pending.take() {
            return Some(Some(exc));
        }
        if self.cp0.cause_ip() & self.cp0.status_im() != 0
            && self.cp0.status_ie()
            && !self.cp0.status_exl()
            && !self.cp0.status_erl()
        {
            return Some(None);
        }
        None
    }

    /// Deliver a pending event, if any. Returns false when the vector
    /// lands on the hardware breakpoint and the tick must end so the
    /// handler entry can be stepped from the console.
    fn deliver_exception(&mut self, bus: &mut Bus, next_next_pc: &mut u32) -> bool {
        let Some(mut code) = self.exception_condition() else {
            return true;
        };

        let offset;
        if !self.cp0.status_exl() {
            if self.regs[PC] != self.next_pc.wrapping_sub(4) {
                if self.cp0.status_rp() {
                    // Stalled by WAIT: resume past it after the interrupt.
                    self.cp0.regs[cp0::EPC] = self.regs[PC].wrapping_add(4);
                    self.cp0.set_status_rp(false);
                } else {
                    // In a delay slot: EPC points at the branch.
                    self.cp0.regs[cp0::EPC] = self.regs[PC].wrapping_sub(4);
                }
                self.cp0.set_cause_bd(true);
            } else {
                self.cp0.regs[cp0::EPC] = self.regs[PC];
                self.cp0.set_cause_bd(false);
            }

            offset = match code {
                Some(Exception::TlbLoad) | Some(Exception::TlbStore) => 0x000,
                Some(Exception::TlbLoadInvalid) => {
                    code = Some(Exception::TlbLoad);
                    0x180
                }
                Some(Exception::TlbStoreInvalid) => {
                    code = Some(Exception::TlbStore);
                    0x180
                }
                None if self.cp0.cause_iv() => 0x200,
                _ => 0x180,
            };
        } else {
            // Nested exception: general vector, no EPC update.
            if code == Some(Exception::TlbLoadInvalid) {
                code = Some(Exception::TlbLoad);
            }
            if code == Some(Exception::TlbStoreInvalid) {
                code = Some(Exception::TlbStore);
            }
            offset = 0x180;
        }

        self.cp0.set_cause_exc_code(code.map_or(0, Exception::code));
        self.cp0.set_status_exl(true);

        let base = if self.cp0.status_bev() { 0xbfc0_0200 } else { 0x8000_0000 };
        self.regs[PC] = base + offset;
        self.next_pc = self.regs[PC].wrapping_add(4);
        *next_next_pc = self.next_pc.wrapping_add(4);

        if self.regs[PC] == bus.breakpoint {
            bus.run = RunState::Console;
            println!(
                "CPU {} hit breakpoint at #{:08x} (exception handler entry)",
                self.id, bus.breakpoint
            );
            // The excepting instruction takes two clock cycles this way,
            // but the first handler instruction can be stepped normally.
            return false;
        }
        true
    }

    /// Execute one tick. Returns the physical address of a completed
    /// store, which the machine uses to break other CPUs' LL/SC
    /// reservations before the next CPU runs.
    pub fn step(&mut self, bus: &mut Bus) -> Option<u32> {
        let mut next_next_pc = self.next_pc.wrapping_add(4);

        if !self.deliver_exception(bus, &mut next_next_pc) {
            return None;
        }

        let word = match bus.read(&self.cp0, self.regs[PC], Width::Word) {
            Ok(word) => word,
            Err(exc) => {
                let exc = if exc == Exception::BusErrorData {
                    Exception::BusErrorInstr
                } else {
                    exc
                };
                let pc = self.regs[PC];
                self.raise_address(exc, pc);
                return None;
            }
        };

        let mut store = None;
        if word != 0 {
            // Word 0 is SLL $0, $0, 0: the canonical NOP.
            let instr = Instr::decode(word);
            match execute::execute(self, bus, instr, &mut next_next_pc, &mut store) {
                execute::Flow::Continue => {}
                execute::Flow::Raised => return None,
            }
        }

        self.regs[PC] = self.next_pc;
        self.next_pc = next_next_pc;

        if self.regs[PC] == bus.breakpoint {
            bus.run = RunState::Console;
            println!("CPU {} hit breakpoint at #{:08x}", self.id, bus.breakpoint);
        }

        store
    }

    /// Per-tick timer step: hardware IP bits are level-triggered and
    /// reasserted by devices each tick, so clear them first, then advance
    /// Count and raise IP7 while the Compare latch is set.
    pub fn timer_tick(&mut self) {
        self.cp0.clear_cause_ip_hw();
        self.cp0.regs[cp0::COUNT] = self.cp0.regs[cp0::COUNT].wrapping_add(1);
        if self.cp0.regs[cp0::COUNT] == self.cp0.regs[cp0::COMPARE] {
            self.cp0.timer_interrupt_pending = true;
        }
        if self.cp0.timer_interrupt_pending {
            self.cp0.set_cause_ip7();
        }
    }

    /// Clear this CPU's LL/SC reservation if it covers `paddr`.
    pub fn invalidate_reservation(&mut self, paddr: u32) {
        if self.cp0.regs[cp0::LLADDR] == paddr {
            self.cp0.regs[cp0::LLADDR] = 0xffff_ffff;
        }
    }
}
