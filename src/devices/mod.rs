//! Virtual peripherals.
//!
//! Every device exposes the same three entry points: `io_read(port)`,
//! `io_write(port, word)` and `update()`. Ports are 4-byte aligned
//! offsets inside the device's window; `update` runs exactly once per
//! simulated tick after all CPUs have advanced, under the async-input
//! lock, and is where IRQ lines are asserted and timed state machines
//! move.
//!
//! Concrete devices:
//! - `trivial`: RTC, meminfo, per-CPU cpuinfo, software shutdown
//! - `tty`: serial terminal over a stream socket
//! - `disk`: sector-addressed disk with a seek/rotation timing model
//! - `nic`: network interface over UDP multicast or unix datagram sockets
//! - `plugio`: bridge to external device processes

pub mod disk;
pub mod nic;
pub mod plugio;
pub mod sock;
pub mod trivial;
pub mod tty;

use crate::async_input::AsyncInput;
use crate::bus::RunState;
use crate::cpu::Cpu;
use crate::memory::Memory;

use disk::Disk;
use nic::Nic;
use plugio::{PlugConnection, PlugPort};
use trivial::{CpuInfo, MemInfo, Rtc, Shutdown};
use tty::Tty;

// Device type codes, as published in the descriptor page.
pub const TYPECODE_MEMINFO: u32 = 0x101;
pub const TYPECODE_RTC: u32 = 0x102;
pub const TYPECODE_SHUTDOWN: u32 = 0x103;
pub const TYPECODE_TTY: u32 = 0x201;
pub const TYPECODE_DISK: u32 = 0x301;
pub const TYPECODE_NIC: u32 = 0x401;
pub const TYPECODE_CPUINFO: u32 = 0xC00;

/// Descriptor fields common to every device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub typecode: u32,
    pub vendor: [u8; 8],
    /// IRQ line 0..5, or none for devices that never interrupt.
    pub irq: Option<u32>,
    /// Assigned by the bus when the device is attached.
    pub io_base: u32,
    pub io_length: u32,
}

impl DeviceInfo {
    pub fn new(typecode: u32, vendor: &[u8; 8], irq: Option<u32>, io_length: u32) -> Self {
        Self {
            typecode,
            vendor: *vendor,
            irq,
            io_base: 0,
            io_length,
        }
    }

    /// Replace the vendor tag, space-padding or truncating to 8 bytes.
    pub fn set_vendor(&mut self, vendor: &str) {
        let mut tag = [b' '; 8];
        for (slot, byte) in tag.iter_mut().zip(vendor.bytes()) {
            *slot = byte;
        }
        self.vendor = tag;
    }
}

/// Round-robin selection of the CPU that sees the next device IRQ.
///
/// The CPU is chosen once, when an IRQ first becomes pending; re-raising
/// while still pending keeps the original target.
pub struct IrqRouter {
    next: usize,
    pub num_cpus: usize,
}

impl IrqRouter {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            next: num_cpus - 1,
            num_cpus,
        }
    }

    pub fn select(&mut self) -> usize {
        self.next = (self.next + 1) % self.num_cpus;
        self.next
    }
}

/// What a device may touch while handling a port access.
pub struct IoCtx<'a> {
    pub mem: &'a mut Memory,
    pub plugs: &'a mut [PlugConnection],
    pub cycle: u64,
    pub clockspeed: u32,
    pub run: &'a mut RunState,
    pub irq: &'a mut IrqRouter,
}

/// What a device may touch during its per-tick update.
pub struct TickCtx<'a> {
    pub cpus: &'a mut [Cpu],
    pub mem: &'a mut Memory,
    pub plugs: &'a mut [PlugConnection],
    pub input: &'a mut AsyncInput,
    pub cycle: u64,
    pub clockspeed: u32,
    pub run: &'a mut RunState,
    pub irq: &'a mut IrqRouter,
}

impl TickCtx<'_> {
    /// Assert hardware interrupt `line` (0..5) on `cpu` for this tick.
    pub fn raise_hw_irq(&mut self, cpu: usize, line: u32) {
        self.cpus[cpu].cp0.raise_hw_irq(line);
    }
}

/// A device: shared descriptor plus kind-specific state and behavior.
pub struct Device {
    pub info: DeviceInfo,
    pub kind: DeviceKind,
}

pub enum DeviceKind {
    Rtc(Rtc),
    MemInfo(MemInfo),
    CpuInfo(CpuInfo),
    Shutdown(Shutdown),
    Tty(Tty),
    Disk(Disk),
    Nic(Nic),
    Plug(PlugPort),
}

impl Device {
    /// Word read from `port` (4-byte aligned, inside the window).
    pub fn io_read(&mut self, port: u32, ctx: &mut IoCtx) -> u32 {
        match &mut self.kind {
            DeviceKind::Rtc(dev) => dev.io_read(port, ctx),
            DeviceKind::MemInfo(dev) => dev.io_read(port, ctx),
            DeviceKind::CpuInfo(dev) => dev.io_read(port, ctx),
            DeviceKind::Shutdown(dev) => dev.io_read(port),
            DeviceKind::Tty(dev) => dev.io_read(port),
            DeviceKind::Disk(dev) => dev.io_read(port),
            DeviceKind::Nic(dev) => dev.io_read(port),
            DeviceKind::Plug(plug) => plug.io_read(port, ctx),
        }
    }

    /// Word write to `port`.
    pub fn io_write(&mut self, port: u32, word: u32, ctx: &mut IoCtx) {
        match &mut self.kind {
            DeviceKind::Rtc(dev) => dev.io_write(port, word),
            DeviceKind::MemInfo(dev) => dev.io_write(port, word),
            DeviceKind::CpuInfo(dev) => dev.io_write(port, word),
            DeviceKind::Shutdown(dev) => dev.io_write(port, word, ctx),
            DeviceKind::Tty(dev) => dev.io_write(port, word),
            DeviceKind::Disk(dev) => dev.io_write(port, word, ctx),
            DeviceKind::Nic(dev) => dev.io_write(port, word, ctx),
            DeviceKind::Plug(plug) => plug.io_write(port, word, ctx),
        }
    }

    /// Advance the device by one tick.
    pub fn update(&mut self, ctx: &mut TickCtx) {
        let Device { info, kind } = self;
        match kind {
            DeviceKind::Rtc(_) | DeviceKind::MemInfo(_) | DeviceKind::Shutdown(_) => {}
            DeviceKind::CpuInfo(dev) => dev.update(info, ctx),
            DeviceKind::Tty(dev) => dev.update(info, ctx),
            DeviceKind::Disk(dev) => dev.update(info, ctx),
            DeviceKind::Nic(dev) => dev.update(info, ctx),
            DeviceKind::Plug(plug) => plug.update(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_router_round_robin() {
        let mut irq = IrqRouter::new(3);
        assert_eq!(irq.select(), 0);
        assert_eq!(irq.select(), 1);
        assert_eq!(irq.select(), 2);
        assert_eq!(irq.select(), 0);
    }

    #[test]
    fn test_vendor_padding() {
        let mut info = DeviceInfo::new(TYPECODE_TTY, b"TTY-FAKE", Some(2), 12);
        info.set_vendor("abc");
        assert_eq!(&info.vendor, b"abc     ");
        info.set_vendor("longvendorname");
        assert_eq!(&info.vendor, b"longvend");
    }
}
