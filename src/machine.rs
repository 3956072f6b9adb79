//! The hardware root: CPUs, bus, devices and the run loop.
//!
//! One `Machine` owns the entire simulated computer. A tick advances
//! every CPU by one instruction in index order, latches input readiness,
//! gives the GDB stub a chance to take over, updates every device in
//! insertion order and finally bumps the cycle counter. Nothing inside a
//! tick suspends; the only blocking calls are plugin request/reply
//! round-trips, which count as instantaneous in simulated time.
//!
//! LL/SC bookkeeping lives here: the store address each CPU reports from
//! its step is used to break every CPU's reservation before the next CPU
//! runs, so a lower-numbered CPU's store in the same tick is observed.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::async_input::{AsyncInput, Backend};
use crate::bits::Endianness;
use crate::bus::{Bus, MmapRegion, RunState, Width};
use crate::cpu::cp0::STATUS;
use crate::cpu::{Cpu, Exception};
use crate::devices::plugio::PlugConnection;
use crate::devices::sock::Stream;
use crate::devices::trivial::{CpuInfo, MemInfo, Rtc, Shutdown};
use crate::devices::{Device, DeviceInfo, DeviceKind, TickCtx};
use crate::gdb::GdbStub;
use crate::memory::{Memory, PAGE_SIZE};

static SIGINT_CAUGHT: AtomicBool = AtomicBool::new(false);

extern "C" fn sigint_handler(_signum: libc::c_int) {
    SIGINT_CAUGHT.store(true, Ordering::SeqCst);
}

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("not enough I/O memory left for memory mapped I/O area")]
    MmapOverflow,
}

pub struct Machine {
    pub cpus: Vec<Cpu>,
    pub bus: Bus,
    pub input: AsyncInput,
}

impl Machine {
    /// Build a machine with its metadevices (shutdown, RTC, meminfo and
    /// one cpuinfo per CPU). Configured devices are added afterwards and
    /// [`Machine::init`] freezes the I/O map.
    pub fn new(
        mem_pages: u32,
        num_cpus: u32,
        clockspeed: u32,
        cpu_irq: u32,
        endian: Endianness,
    ) -> Self {
        let mem = Memory::new(mem_pages, endian);
        let mut machine = Self {
            cpus: (0..num_cpus)
                .map(|id| Cpu::new(id, endian.is_big()))
                .collect(),
            bus: Bus::new(mem, clockspeed, num_cpus as usize),
            input: AsyncInput::new(Backend::from_env()),
        };

        machine.add_device(Shutdown::device());
        machine.add_device(Rtc::device());
        machine.add_device(MemInfo::device());
        for cpu in 0..num_cpus as usize {
            machine.add_device(CpuInfo::device(cpu, cpu_irq));
        }
        machine
    }

    pub fn add_device(&mut self, dev: Device) {
        self.bus.add_device(dev);
    }

    /// Attach a plugin process: run the INIT handshake and add one device
    /// per DEVICE reply. MMAP windows are placed later, in `init`.
    pub fn add_plug_connection(
        &mut self,
        stream: Stream,
        async_events: bool,
        options: &str,
        irq: Option<u32>,
    ) {
        let mut conn = PlugConnection::new(stream);
        if async_events {
            if self.input.register(conn.poll_fd()).is_err() {
                tracing::warn!("PLUGIO: cannot register socket for async input");
            }
        }

        let announced = conn.init(
            async_events,
            options,
            self.cpus.len() as u32,
            self.bus.mem.size(),
            irq,
            self.bus.endian().is_big(),
        );
        let conn_index = self.bus.plugs.len();
        self.bus.plugs.push(conn);

        for new in announced {
            let mut info =
                DeviceInfo::new(new.typecode, b"????????", new.irq, new.io_length);
            info.vendor = new.vendor;
            self.add_device(Device {
                info,
                kind: DeviceKind::Plug(crate::devices::plugio::PlugPort {
                    conn: conn_index,
                    tag: new.tag,
                }),
            });
        }
    }

    /// Register a device socket with the input helper. Must run before
    /// `init`.
    pub fn register_input_fd(&mut self, fd: i32) {
        if self.input.register(fd).is_err() {
            tracing::warn!("cannot register fd {fd} for async input");
        }
    }

    /// Freeze the I/O map: build the port lookup, place MMAP windows,
    /// publish the descriptor page and start the input subsystem.
    pub fn init(&mut self) -> Result<(), MachineError> {
        self.bus.init_io();

        // MMAP areas follow the port window, page aligned.
        let mut base = self.bus.io_base + self.bus.io_length;
        for conn in 0..self.bus.plugs.len() {
            for unit in 0..self.bus.plugs[conn].units.len() {
                let (tag, size) = {
                    let u = &self.bus.plugs[conn].units[unit];
                    (u.tag, u.mmap_size)
                };
                if size == 0 {
                    continue;
                }
                base = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
                if base.checked_add(size).map_or(true, |end| end >= 0xc000_0000) {
                    return Err(MachineError::MmapOverflow);
                }
                self.bus.mmaps.push(MmapRegion {
                    conn,
                    tag,
                    base,
                    size,
                });
                self.bus.plugs[conn].send_mmap(tag, base);
                base += size;
            }
        }

        self.write_descriptor_page();
        self.input.start();
        self.print_hw_info();
        Ok(())
    }

    /// Publish one 32-byte record per device: typecode, port base, port
    /// length, IRQ, vendor tag, eight reserved bytes.
    fn write_descriptor_page(&mut self) {
        let endian = self.bus.endian();
        let mut offset = 0;
        let mut record = [0u8; 32];
        for index in 0..self.bus.devices.len() {
            let info = self.bus.devices[index].info.clone();
            record[0..4].copy_from_slice(&crate::bits::write32(endian, info.typecode));
            record[4..8].copy_from_slice(&crate::bits::write32(endian, info.io_base));
            record[8..12].copy_from_slice(&crate::bits::write32(endian, info.io_length));
            record[12..16].copy_from_slice(&crate::bits::write32(
                endian,
                info.irq.unwrap_or(0xffff_ffff),
            ));
            record[16..24].copy_from_slice(&info.vendor);
            record[24..32].fill(0);
            self.bus.mem.descr_store(offset, &record);
            offset += 32;
        }
    }

    fn print_hw_info(&self) {
        println!("Simulated hardware:");
        println!(
            " {} CPU(s) with virtual clock rate {} Hz",
            self.cpus.len(),
            self.bus.clockspeed
        );
        println!(
            " {} kilobytes of main memory ({} x {})",
            self.bus.mem.size() / 1024,
            self.bus.mem.num_pages(),
            PAGE_SIZE
        );
        println!(" {} other virtual device(s):", self.bus.devices.len());
        for dev in &self.bus.devices {
            let vendor = String::from_utf8_lossy(&dev.info.vendor);
            let irq = match dev.info.irq {
                Some(line) => line.to_string(),
                None => "NONE".into(),
            };
            println!(
                "   - '{}' Type: #{:08x} IOBASE: #{:08x} IRQ: {}",
                vendor, dev.info.typecode, dev.info.io_base, irq
            );
        }
        if !self.bus.mmaps.is_empty() {
            println!(
                " {} additional memory mapped I/O area(s):",
                self.bus.mmaps.len()
            );
            for region in &self.bus.mmaps {
                println!(
                    "   - Base: #{:08x} Size: #{:08x}",
                    region.base, region.size
                );
            }
        }
        println!();
    }

    /// Advance one full tick: CPUs, input latch, GDB hook, devices,
    /// cycle counter.
    pub fn tick(&mut self, gdb: &mut Option<&mut GdbStub>) {
        for index in 0..self.cpus.len() {
            let store = self.cpus[index].step(&mut self.bus);
            self.cpus[index].timer_tick();
            if let Some(paddr) = store {
                // Break LL/SC reservations on the stored word, this CPU's
                // included, before the next CPU gets to run.
                for cpu in &mut self.cpus {
                    cpu.invalidate_reservation(paddr);
                }
            }
        }

        self.input.lock();

        if let Some(stub) = gdb.as_deref_mut() {
            if !stub.check_and_run(self) {
                self.bus.run = RunState::Exit;
            }
        }

        let Machine { cpus, bus, input } = self;
        let Bus {
            mem,
            devices,
            plugs,
            cycle,
            clockspeed,
            run,
            irq,
            ..
        } = bus;
        for dev in devices.iter_mut() {
            let mut ctx = TickCtx {
                cpus: cpus.as_mut_slice(),
                mem: &mut *mem,
                plugs: plugs.as_mut_slice(),
                input: &mut *input,
                cycle: *cycle,
                clockspeed: *clockspeed,
                run: &mut *run,
                irq: &mut *irq,
            };
            dev.update(&mut ctx);
        }

        self.input.unlock();
        self.bus.cycle += 1;
    }

    /// Run until something stops the machine: the stop cycle, a
    /// breakpoint, a shutdown, SIGINT or the GDB stub.
    pub fn run(&mut self, stop_at_cycle: u64, mut gdb: Option<&mut GdbStub>) {
        SIGINT_CAUGHT.store(false, Ordering::SeqCst);
        self.bus.run = RunState::Running;

        let old_handler = unsafe {
            libc::signal(libc::SIGINT, sigint_handler as usize as libc::sighandler_t)
        };

        while self.bus.run == RunState::Running
            && self.bus.cycle != stop_at_cycle
            && !SIGINT_CAUGHT.load(Ordering::SeqCst)
        {
            self.tick(&mut gdb);
        }

        unsafe {
            libc::signal(libc::SIGINT, old_handler);
        }
    }

    /// Run `count` more ticks.
    pub fn step(&mut self, count: u64, gdb: Option<&mut GdbStub>) {
        self.run(self.bus.cycle.wrapping_add(count), gdb);
    }

    /// Run without a stop cycle (the stop value can never be reached).
    pub fn start(&mut self, gdb: Option<&mut GdbStub>) {
        self.run(self.bus.cycle.wrapping_sub(1), gdb);
    }

    /// Point every CPU at the boot entry.
    pub fn set_boot_entry(&mut self, entry: u32) {
        for cpu in &mut self.cpus {
            cpu.set_pc(entry);
        }
    }

    /// Translated read on CPU 0 with kernel mode forced, for the console
    /// and the debugger. Virtual TLB codes are rewritten for reporting.
    pub fn debug_read(&mut self, addr: u32, width: Width) -> Result<u32, Exception> {
        let saved = self.cpus[0].cp0.regs[STATUS];
        self.cpus[0].cp0.regs[STATUS] = 6;
        let result = self.bus.read(&self.cpus[0].cp0, addr, width);
        self.cpus[0].cp0.regs[STATUS] = saved;
        result.map_err(demote_virtual)
    }

    /// Translated write on CPU 0 with kernel mode forced. Note that a
    /// write landing in the port window commits real device state.
    pub fn debug_write(&mut self, addr: u32, width: Width, value: u32) -> Result<(), Exception> {
        let saved = self.cpus[0].cp0.regs[STATUS];
        self.cpus[0].cp0.regs[STATUS] = 6;
        let result = self.bus.write(&self.cpus[0].cp0, addr, width, value);
        self.cpus[0].cp0.regs[STATUS] = saved;
        result.map_err(demote_virtual)
    }
}

fn demote_virtual(exc: Exception) -> Exception {
    match exc {
        Exception::TlbLoadInvalid => Exception::TlbLoad,
        Exception::TlbStoreInvalid => Exception::TlbStore,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::map;

    fn machine() -> Machine {
        let mut machine = Machine::new(256, 1, 100_000, 4, Endianness::Big);
        machine.bus.init_io();
        machine.write_descriptor_page();
        machine
    }

    /// Assemble-and-poke helper: place instruction words at a physical
    /// address.
    fn load_words(machine: &mut Machine, paddr: u32, words: &[u32]) {
        for (index, &word) in words.iter().enumerate() {
            machine.bus.mem.store32(paddr + 4 * index as u32, word);
        }
    }

    fn ori(rt: u32, rs: u32, imm: u32) -> u32 {
        (0x0d << 26) | (rs << 21) | (rt << 16) | imm
    }

    #[test]
    fn test_single_step_executes_one_instruction() {
        let mut machine = machine();
        load_words(&mut machine, 0x0001_0000, &[ori(2, 0, 0x1234)]);
        machine.step(1, None);
        assert_eq!(machine.cpus[0].regs[2], 0x1234);
        assert_eq!(machine.cpus[0].regs[crate::cpu::PC], map::STARTUP_PC + 4);
        assert_eq!(machine.bus.cycle, 1);
    }

    #[test]
    fn test_metadevices_present_in_descriptor_page() {
        let machine = machine();
        // shutdown, rtc, meminfo, cpuinfo
        assert_eq!(machine.bus.devices.len(), 4);
        // First record is the shutdown device.
        assert_eq!(machine.bus.mem.descr_load32(0), 0x103);
        assert_eq!(machine.bus.mem.descr_load32(4), map::IO_AREA_BASE);
        // Tail of the page reads zero.
        assert_eq!(machine.bus.mem.descr_load32(4 * 32), 0);
    }

    #[test]
    fn test_breakpoint_stops_run() {
        let mut machine = machine();
        load_words(
            &mut machine,
            0x0001_0000,
            &[ori(2, 0, 1), ori(3, 0, 2), ori(4, 0, 3)],
        );
        machine.bus.breakpoint = map::STARTUP_PC + 8;
        machine.start(None);
        assert_eq!(machine.bus.run, RunState::Console);
        assert_eq!(machine.cpus[0].regs[crate::cpu::PC], map::STARTUP_PC + 8);
        // The breakpoint instruction itself has not executed.
        assert_eq!(machine.cpus[0].regs[4], 0);
    }

    #[test]
    fn test_rtc_visible_through_the_bus() {
        let mut machine = machine();
        // RTC is the second device.
        let base = machine.bus.devices[1].info.io_base;
        machine.step(200_000, None);
        let ms = machine.debug_read(base, Width::Word).unwrap();
        // 200k cycles at 100 kHz is 2000 ms.
        assert_eq!(ms, 2000);
        let hz = machine.debug_read(base + 4, Width::Word).unwrap();
        assert_eq!(hz, 100_000);
    }

    #[test]
    fn test_debug_write_reports_exception() {
        let mut machine = machine();
        // Unmapped user address with an empty TLB.
        assert_eq!(
            machine.debug_write(0x0000_4000, Width::Word, 1),
            Err(Exception::TlbStore)
        );
    }

    #[test]
    fn test_ll_sc_broken_by_other_cpu_store() {
        let mut machine = Machine::new(64, 2, 100_000, 4, Endianness::Big);
        machine.bus.init_io();

        const P: u32 = 0x0000_2000;
        // CPU0: LL t0, 0(t1); SC t2, 0(t1)  with t1 = 0x80002000
        // CPU1: SW t3, 0(t1)
        let ll = (0x30 << 26) | (9 << 21) | (8 << 16);
        let sc = (0x38 << 26) | (9 << 21) | (10 << 16);
        let sw = (0x2b << 26) | (9 << 21) | (11 << 16);
        let nop = 0;

        machine.bus.mem.store32(0x0001_0000, ll);
        machine.bus.mem.store32(0x0001_0004, sc);
        machine.bus.mem.store32(0x0001_0008, nop);

        machine.cpus[0].regs[9] = 0x8000_0000 + P;
        machine.cpus[0].regs[10] = 0xaaaa_aaaa;
        machine.cpus[1].regs[9] = 0x8000_0000 + P;
        machine.cpus[1].regs[11] = 0xbbbb_bbbb;

        // CPU1 executes its SW in the same tick as CPU0's LL, and NOPs
        // afterwards.
        machine.bus.mem.store32(0x0001_1004, sw);
        machine.bus.mem.store32(0x0001_1008, nop);
        machine.cpus[1].set_pc(0x8001_1004);

        machine.step(1, None); // CPU0: LL takes a reservation; CPU1: SW breaks it
        machine.step(1, None); // CPU0: SC fails
        assert_eq!(machine.cpus[0].regs[10], 0, "SC must fail");
        assert_eq!(machine.bus.mem.load32(P), 0xbbbb_bbbb);
    }

    #[test]
    fn test_ll_sc_succeeds_without_interference() {
        let mut machine = machine();
        const P: u32 = 0x0000_2000;
        let ll = (0x30 << 26) | (9 << 21) | (8 << 16);
        let sc = (0x38 << 26) | (9 << 21) | (10 << 16);
        machine.bus.mem.store32(0x0001_0000, ll);
        machine.bus.mem.store32(0x0001_0004, sc);
        machine.cpus[0].regs[9] = 0x8000_0000 + P;
        machine.cpus[0].regs[10] = 0x1234_5678;

        machine.step(2, None);
        assert_eq!(machine.cpus[0].regs[10], 1, "SC must succeed");
        assert_eq!(machine.bus.mem.load32(P), 0x1234_5678);
    }

    #[test]
    fn test_register_zero_stays_zero() {
        let mut machine = machine();
        // ORI r0, r0, 0xffff
        load_words(&mut machine, 0x0001_0000, &[ori(0, 0, 0xffff)]);
        machine.step(1, None);
        assert_eq!(machine.cpus[0].regs[0], 0);
    }
}
