//! Translated execution: TLB-mapped fetch and data paths, the TLB
//! maintenance instructions, and refill/invalid vector selection.

use super::*;
use crate::cpu::RefType;
use pretty_assertions::assert_eq;

/// Install a global 4 KiB mapping pair for `vpn2` with the given even
/// and odd frame numbers, valid and dirty.
fn map_pages(cpu: &mut Cpu, index: u32, vpn2: u32, pfn_even: u32, pfn_odd: u32) {
    cpu.cp0.regs[cp0::ENTRY_HI] = vpn2 << 13;
    cpu.cp0.regs[cp0::ENTRY_LO0] = (pfn_even << 6) | 0x7; // D, V, G
    cpu.cp0.regs[cp0::ENTRY_LO1] = (pfn_odd << 6) | 0x7;
    cpu.cp0.regs[cp0::INDEX] = index;
    cpu.cp0.tlb_write_indexed();
}

#[test]
fn test_mapped_load_in_user_mode() {
    // Scenario: an entry maps VPN2 0x40 with PFN0 0x10; a user-mode LW
    // from 0x00080000 reads the word at physical 0x00010000. The code
    // page itself is mapped at 0x00400000.
    let (mut cpu, mut bus) = test_rig();
    map_pages(&mut cpu, 0, 0x40, 0x10, 0x11);
    map_pages(&mut cpu, 1, 0x200, 0x20, 0x21); // code at vaddr 0x400000

    bus.mem.store32(0x0001_0000, 0xfeed_f00d);
    bus.mem.store32(0x0002_0000, lw(2, 8, 0));
    cpu.regs[8] = 0x0008_0000;
    cpu.cp0.regs[cp0::STATUS] = 0x1000_0010; // user mode
    cpu.set_pc(0x0040_0000);

    run(&mut cpu, &mut bus, 1);
    assert!(cpu.pending.is_none());
    assert_eq!(cpu.regs[2], 0xfeed_f00d);
}

#[test]
fn test_mapped_store_and_odd_page() {
    let (mut cpu, mut bus) = test_rig();
    map_pages(&mut cpu, 3, 0x40, 0x10, 0x11);
    cpu.regs[8] = 0x0008_1000; // odd half
    cpu.regs[9] = 0xc0de_cafe;
    load_boot(&mut bus, &[sw(9, 8, 0)]);

    run(&mut cpu, &mut bus, 1);
    assert!(cpu.pending.is_none());
    assert_eq!(bus.mem.load32(0x0001_1000), 0xc0de_cafe);
}

#[test]
fn test_refill_and_invalid_vectors_differ() {
    // A missing entry routes through the refill vector at offset 0x000,
    // an invalid entry through the general vector at 0x180; both report
    // the TLBLoad code.
    let (mut cpu, mut bus) = test_rig();
    cpu.cp0.regs[cp0::STATUS] = 0x1000_0000;
    cpu.regs[8] = 0x0008_0000;
    load_boot(&mut bus, &[lw(2, 8, 0)]);
    run(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.cp0.cause_exc_code(), Exception::TlbLoad.code());
    assert_eq!(cpu.regs[PC], 0x8000_0004, "refill vector");
    assert_eq!(cpu.cp0.regs[cp0::BAD_VADDR], 0x0008_0000);
    // Context.BadVPN2 holds vaddr[31:13] >> 9.
    assert_eq!(cpu.cp0.regs[cp0::CONTEXT] & 0x007f_fff0, 0x0008_0000 >> 9);

    // Same access with a valid=0 entry installed.
    let (mut cpu, mut bus) = test_rig();
    cpu.cp0.regs[cp0::STATUS] = 0x1000_0000;
    cpu.cp0.regs[cp0::ENTRY_HI] = 0x40 << 13;
    cpu.cp0.regs[cp0::ENTRY_LO0] = (0x10 << 6) | 0x5; // D, G, not V
    cpu.cp0.regs[cp0::ENTRY_LO1] = 0x1;
    cpu.cp0.regs[cp0::INDEX] = 0;
    cpu.cp0.tlb_write_indexed();
    cpu.regs[8] = 0x0008_0000;
    load_boot(&mut bus, &[lw(2, 8, 0)]);
    run(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.cp0.cause_exc_code(), Exception::TlbLoad.code());
    assert_eq!(cpu.regs[PC], 0x8000_0184, "general vector");
}

#[test]
fn test_tlb_modification_on_clean_store() {
    let (mut cpu, mut bus) = test_rig();
    cpu.cp0.regs[cp0::STATUS] = 0x1000_0000;
    cpu.cp0.regs[cp0::ENTRY_HI] = 0x40 << 13;
    cpu.cp0.regs[cp0::ENTRY_LO0] = (0x10 << 6) | 0x3; // V, G, not D
    cpu.cp0.regs[cp0::ENTRY_LO1] = 0x1;
    cpu.cp0.regs[cp0::INDEX] = 0;
    cpu.cp0.tlb_write_indexed();
    cpu.regs[8] = 0x0008_0000;
    cpu.regs[9] = 1;
    load_boot(&mut bus, &[sw(9, 8, 0)]);

    run(&mut cpu, &mut bus, 2);
    assert_eq!(cpu.cp0.cause_exc_code(), Exception::TlbModification.code());
    assert_eq!(cpu.regs[PC], 0x8000_0184, "general vector");
}

#[test]
fn test_tlbwi_tlbp_tlbr_instructions() {
    let (mut cpu, mut bus) = test_rig();
    // Program EntryHi/EntryLo through MTC0, write entry 2, then probe
    // for it and read it back.
    cpu.regs[8] = (0x55 << 13) | 0x10; // EntryHi: VPN2 0x55, ASID 0x10
    cpu.regs[9] = (0x123 << 6) | 0x7; // EntryLo0
    cpu.regs[10] = (0x124 << 6) | 0x7; // EntryLo1
    cpu.regs[11] = 2; // Index
    load_boot(
        &mut bus,
        &[
            mtc0(8, cp0::ENTRY_HI),
            mtc0(9, cp0::ENTRY_LO0),
            mtc0(10, cp0::ENTRY_LO1),
            mtc0(11, cp0::INDEX),
            cop0_funct(0x02), // tlbwi
            mtc0(0, cp0::ENTRY_HI),
            mtc0(8, cp0::ENTRY_HI),
            cop0_funct(0x08), // tlbp
        ],
    );
    run(&mut cpu, &mut bus, 8);
    assert_eq!(cpu.cp0.regs[cp0::INDEX], 2, "probe found the entry");
    assert_eq!(cpu.cp0.tlb[2].vpn2(), 0x55);
    assert_eq!(cpu.cp0.tlb[2].asid(), 0x10);

    // TLBR reconstructs the registers.
    cpu.cp0.regs[cp0::ENTRY_HI] = 0;
    cpu.cp0.regs[cp0::ENTRY_LO0] = 0;
    load_boot(&mut bus, &[cop0_funct(0x01)]);
    cpu.set_pc(0x8001_0000);
    run(&mut cpu, &mut bus, 1);
    assert_eq!(cpu.cp0.regs[cp0::ENTRY_HI], (0x55 << 13) | 0x10);
    assert_eq!(cpu.cp0.regs[cp0::ENTRY_LO0], (0x123 << 6) | 0x7);
}

#[test]
fn test_tlbwr_uses_random() {
    let (mut cpu, mut bus) = test_rig();
    cpu.regs[8] = 0x77 << 13;
    cpu.regs[9] = (0x200 << 6) | 0x7;
    let random = cpu.cp0.regs[cp0::RANDOM] as usize;
    load_boot(
        &mut bus,
        &[
            mtc0(8, cp0::ENTRY_HI),
            mtc0(9, cp0::ENTRY_LO0),
            mtc0(9, cp0::ENTRY_LO1),
            cop0_funct(0x06), // tlbwr
        ],
    );
    run(&mut cpu, &mut bus, 4);
    assert_eq!(cpu.cp0.tlb[random].vpn2(), 0x77);
    assert_eq!(cpu.cp0.regs[cp0::RANDOM] as usize, random - 1);
}

#[test]
fn test_asid_mismatch_faults() {
    let (mut cpu, mut bus) = test_rig();
    cpu.cp0.regs[cp0::STATUS] = 0x1000_0000;
    // Non-global entry for ASID 5.
    cpu.cp0.regs[cp0::ENTRY_HI] = (0x40 << 13) | 5;
    cpu.cp0.regs[cp0::ENTRY_LO0] = (0x10 << 6) | 0x6; // D, V, not G
    cpu.cp0.regs[cp0::ENTRY_LO1] = 0x6;
    cpu.cp0.regs[cp0::INDEX] = 0;
    cpu.cp0.tlb_write_indexed();

    // Running as ASID 6: miss.
    cpu.cp0.regs[cp0::ENTRY_HI] = (0x40 << 13) | 6;
    assert_eq!(
        cpu.cp0.tlb_translate(0x0008_0000, RefType::Load),
        Err(Exception::TlbLoad)
    );

    // Back to ASID 5 it hits, through a real load.
    cpu.cp0.regs[cp0::ENTRY_HI] = (0x40 << 13) | 5;
    bus.mem.store32(0x0001_0000, 0x600d_f00d);
    cpu.regs[8] = 0x0008_0000;
    load_boot(&mut bus, &[lw(2, 8, 0)]);
    run(&mut cpu, &mut bus, 1);
    assert_eq!(cpu.regs[2], 0x600d_f00d);
}

#[test]
fn test_kseg2_requires_kernel_but_translates() {
    let (mut cpu, mut bus) = test_rig();
    // Map VPN2 of 0xC0000000: 0xC0000000 >> 13 = 0x60000.
    map_pages(&mut cpu, 0, 0x60000, 0x30, 0x31);
    bus.mem.store32(0x0003_0000, 0x1bad_b002);
    cpu.regs[8] = 0xc000_0000;
    load_boot(&mut bus, &[lw(2, 8, 0)]);
    run(&mut cpu, &mut bus, 1);
    assert_eq!(cpu.regs[2], 0x1bad_b002);
}
