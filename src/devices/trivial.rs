//! The trivial metadevices: RTC, meminfo, per-CPU cpuinfo and software
//! shutdown. All four are created automatically at machine setup, before
//! any configured device.

use crate::bus::RunState;

use super::{
    Device, DeviceInfo, DeviceKind, IoCtx, TickCtx, TYPECODE_CPUINFO, TYPECODE_MEMINFO,
    TYPECODE_RTC, TYPECODE_SHUTDOWN,
};

/// Writing this magic to the shutdown port exits the simulator.
pub const SHUTDOWN_MAGIC: u32 = 0x0bad_f00d;
/// Writing this magic drops to the command console instead.
pub const CONSOLE_MAGIC: u32 = 0xdead_c0de;

const PORT_STATUS: u32 = 0x00;
const PORT_COMMAND: u32 = 0x04;

const CPU_COMMAND_GENERATE_IRQ: u32 = 0x00;
const CPU_COMMAND_CLEAR_IRQ: u32 = 0x01;

const CPU_STATUS_RUNNING: u32 = 1 << 0;
const CPU_STATUS_IRQ: u32 = 1 << 1;
const CPU_STATUS_ICOMM: u32 = 1 << 31;

/// Real-time clock: port 0 is milliseconds since start, port 4 the clock
/// speed in Hz.
pub struct Rtc;

impl Rtc {
    pub fn device() -> Device {
        Device {
            info: DeviceInfo::new(TYPECODE_RTC, b"SYS-RTC ", None, 8),
            kind: DeviceKind::Rtc(Rtc),
        }
    }

    pub fn io_read(&self, port: u32, ctx: &mut IoCtx) -> u32 {
        match port {
            0 => ((1000 * ctx.cycle) / ctx.clockspeed as u64) as u32,
            4 => ctx.clockspeed,
            _ => 0,
        }
    }

    pub fn io_write(&mut self, _port: u32, _word: u32) {}
}

/// Memory information: port 0 reads the number of physical pages.
pub struct MemInfo;

impl MemInfo {
    pub fn device() -> Device {
        Device {
            info: DeviceInfo::new(TYPECODE_MEMINFO, b"MEMINFO ", None, 4),
            kind: DeviceKind::MemInfo(MemInfo),
        }
    }

    pub fn io_read(&self, port: u32, ctx: &mut IoCtx) -> u32 {
        match port {
            0 => ctx.mem.num_pages(),
            _ => 0,
        }
    }

    pub fn io_write(&mut self, _port: u32, _word: u32) {}
}

/// Per-CPU information and inter-CPU interrupt generator.
///
/// One instance exists per simulated CPU; the type code carries the CPU
/// number in its low byte. Writing GENERATE_IRQ to the command port
/// raises the configured inter-CPU line on that CPU every tick until
/// CLEAR_IRQ.
pub struct CpuInfo {
    cpu: usize,
    irq_pending: bool,
    error: bool,
}

impl CpuInfo {
    pub fn device(cpu: usize, cpu_irq: u32) -> Device {
        Device {
            info: DeviceInfo::new(
                TYPECODE_CPUINFO + cpu as u32,
                b"CPUINFO ",
                Some(cpu_irq),
                8,
            ),
            kind: DeviceKind::CpuInfo(CpuInfo {
                cpu,
                irq_pending: false,
                error: false,
            }),
        }
    }

    pub fn io_read(&self, port: u32, ctx: &mut IoCtx) -> u32 {
        match port {
            PORT_STATUS => {
                let mut status = if self.error { CPU_STATUS_ICOMM } else { 0 };
                if self.cpu < ctx.irq.num_cpus {
                    status |= CPU_STATUS_RUNNING;
                }
                if self.irq_pending {
                    status |= CPU_STATUS_IRQ;
                }
                status
            }
            _ => 0,
        }
    }

    pub fn io_write(&mut self, port: u32, word: u32) {
        if port != PORT_COMMAND {
            return;
        }
        match word {
            CPU_COMMAND_GENERATE_IRQ => {
                self.error = false;
                self.irq_pending = true;
            }
            CPU_COMMAND_CLEAR_IRQ => {
                self.error = false;
                self.irq_pending = false;
            }
            _ => self.error = true,
        }
    }

    pub fn update(&mut self, info: &DeviceInfo, ctx: &mut TickCtx) {
        if self.irq_pending {
            if let Some(line) = info.irq {
                ctx.raise_hw_irq(self.cpu, line);
            }
        }
    }
}

/// Software shutdown: a single write-only port taking the two magic
/// words.
pub struct Shutdown;

impl Shutdown {
    pub fn device() -> Device {
        Device {
            info: DeviceInfo::new(TYPECODE_SHUTDOWN, b"SHUTDOWN", None, 4),
            kind: DeviceKind::Shutdown(Shutdown),
        }
    }

    pub fn io_read(&self, _port: u32) -> u32 {
        0
    }

    pub fn io_write(&mut self, port: u32, word: u32, ctx: &mut IoCtx) {
        if port != 0 {
            return;
        }
        if word == SHUTDOWN_MAGIC {
            println!("Shutting down by software request");
            *ctx.run = RunState::Exit;
        } else if word == CONSOLE_MAGIC {
            println!("Dropping to command console by software request");
            *ctx.run = RunState::Console;
        }
    }
}
