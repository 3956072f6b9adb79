//! Sector-addressed disk with a seek and rotation timing model.
//!
//! Commands stage a target sector and DMA address, then READ/WRITE
//! commits them, computes the mechanical latency and walks a small state
//! machine driven by an absolute wake-up cycle:
//!
//! ```text
//! IDLE --READ/WRITE--> READING1/WRITING1   (seeking)
//!      --wakeup------> READING2/WRITING2   (sector passing the head,
//!                                           data moved against the image)
//!      --wakeup------> IDLE                (busy cleared, IRQ raised)
//! ```
//!
//! The image file backs the sectors directly; a missing file is created
//! and zero-filled at configuration time.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{Device, DeviceInfo, DeviceKind, IoCtx, TickCtx, TYPECODE_DISK};

pub const PORT_STATUS: u32 = 0;
pub const PORT_COMMAND: u32 = 4;
pub const PORT_DATA: u32 = 8;
pub const PORT_TSECTOR: u32 = 12;
pub const PORT_DMAADDR: u32 = 16;

pub const STATUS_RBUSY: u32 = 1 << 0;
pub const STATUS_WBUSY: u32 = 1 << 1;
pub const STATUS_RIRQ: u32 = 1 << 2;
pub const STATUS_WIRQ: u32 = 1 << 3;
const STATUS_MASK: u32 = 0x0f;
const STATUS_IRQ_MASK: u32 = STATUS_RIRQ | STATUS_WIRQ;

pub const ERROR_ISECT: u32 = 0x0800_0000;
pub const ERROR_IADDR: u32 = 0x1000_0000;
pub const ERROR_ICOMM: u32 = 0x2000_0000;
pub const ERROR_EBUSY: u32 = 0x4000_0000;
const ERROR_MASK: u32 = 0xf800_0000;

pub const COMMAND_READ: u32 = 1;
pub const COMMAND_WRITE: u32 = 2;
pub const COMMAND_RESET_RIRQ: u32 = 3;
pub const COMMAND_RESET_WIRQ: u32 = 4;
pub const COMMAND_GET_SECTORS: u32 = 5;
pub const COMMAND_GET_SECTOR_SIZE: u32 = 6;
pub const COMMAND_GET_SECTORS_PER_CYL: u32 = 7;
pub const COMMAND_GET_ROT_TIME: u32 = 8;
pub const COMMAND_GET_SEEK_TIME: u32 = 9;

/// Default IRQ line when the configuration names none.
pub const IRQ_DISK: u32 = 3;

const IO_LENGTH: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Reading1,
    Reading2,
    Writing1,
    Writing2,
}

pub struct Disk {
    image: File,
    num_sectors: u32,
    sector_size: u32,
    num_cylinders: u32,
    current_cylinder: u32,
    /// Full rotation and full-stroke seek times, in clock cycles.
    time_rot: u64,
    time_fullseek: u64,

    status: u32,
    data_port: u32,
    transfer_sector: u32,
    transfer_addr: u32,
    staged_sector: u32,
    staged_addr: u32,
    next_interest: u64,
    mode: Mode,
    irq_cpu: usize,
}

/// Errors surfaced while creating the disk from its configuration.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("invalid sector size {0} (must be a power of two in 128..65536)")]
    BadSectorSize(u32),
    #[error("disk needs at least 10 sectors, got {0}")]
    TooFewSectors(u32),
    #[error("number of cylinders {0} does not divide number of sectors {1}")]
    BadCylinders(u32, u32),
    #[error("image file too small to hold the disk")]
    ImageTooSmall,
    #[error("cannot open or create image file: {0}")]
    Image(#[from] std::io::Error),
}

impl Disk {
    /// Open (or create zero-filled) the image and build the device.
    /// Rotation and seek times are given in milliseconds.
    #[allow(clippy::too_many_arguments)]
    pub fn device(
        path: &Path,
        sector_size: u32,
        num_sectors: u32,
        num_cylinders: u32,
        rot_time_ms: u32,
        seek_time_ms: u32,
        clockspeed: u32,
    ) -> Result<Device, DiskError> {
        if num_sectors < 10 {
            return Err(DiskError::TooFewSectors(num_sectors));
        }
        if !sector_size.is_power_of_two() || !(128..=65536).contains(&sector_size) {
            return Err(DiskError::BadSectorSize(sector_size));
        }
        if num_cylinders == 0 || num_sectors % num_cylinders != 0 {
            return Err(DiskError::BadCylinders(num_cylinders, num_sectors));
        }

        let image = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => {
                let len = file.metadata()?.len();
                if len < sector_size as u64 * num_sectors as u64 {
                    return Err(DiskError::ImageTooSmall);
                }
                file
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?;
                let zeros = vec![0u8; sector_size as usize];
                for _ in 0..num_sectors {
                    file.write_all(&zeros)?;
                }
                file.flush()?;
                file
            }
            Err(err) => return Err(err.into()),
        };

        let ms_to_cycles = |ms: u32| ms as u64 * clockspeed as u64 / 1000;

        Ok(Device {
            info: DeviceInfo::new(TYPECODE_DISK, b"<NONAME>", Some(IRQ_DISK), IO_LENGTH),
            kind: DeviceKind::Disk(Disk {
                image,
                num_sectors,
                sector_size,
                num_cylinders,
                current_cylinder: 0,
                time_rot: ms_to_cycles(rot_time_ms),
                time_fullseek: ms_to_cycles(seek_time_ms),
                status: 0,
                data_port: 0,
                transfer_sector: 0xffff_ffff,
                transfer_addr: 0xffff_ffff,
                staged_sector: 0xffff_ffff,
                staged_addr: 0xffff_ffff,
                next_interest: 0,
                mode: Mode::Idle,
                irq_cpu: 0,
            }),
        })
    }

    fn sectors_per_cylinder(&self) -> u32 {
        self.num_sectors / self.num_cylinders
    }

    /// Mechanical latency for reaching the committed target sector: seek
    /// time to the cylinder plus rotational latency to the sector start.
    /// There is no cylinder cache.
    fn seek_time(&self, now: u64) -> u64 {
        let target_cyl = self.transfer_sector / self.sectors_per_cylinder();
        let cylinder_distance = self.current_cylinder.abs_diff(target_cyl) as u64;
        let seek = cylinder_distance * self.time_fullseek / self.num_cylinders as u64;

        if self.time_rot == 0 {
            return seek;
        }

        let rotation = |at: u64| -> u64 {
            let current_sector = (at % self.time_rot) as f64
                * self.sectors_per_cylinder() as f64
                / self.time_rot as f64;
            let mut target_sector = (self.transfer_sector % self.sectors_per_cylinder()) as f64;
            if current_sector > target_sector {
                // Already past it; catch it on the next rotation.
                target_sector += self.sectors_per_cylinder() as f64;
            }
            ((target_sector - current_sector) * self.time_rot as f64) as u64
                / self.sectors_per_cylinder() as u64
        };

        let rot = rotation(now);
        if seek <= rot {
            rot
        } else {
            // The platter keeps turning while we seek; recompute at the
            // post-seek time.
            seek + rotation(now + seek)
        }
    }

    fn start_transfer(&mut self, write: bool, ctx: &mut IoCtx) {
        self.transfer_sector = self.staged_sector;
        self.transfer_addr = self.staged_addr;

        if self.transfer_sector >= self.num_sectors {
            self.status |= ERROR_ISECT;
        }
        if self.transfer_addr.wrapping_add(self.sector_size) > ctx.mem.size() {
            self.status |= ERROR_IADDR;
        }
        if self.mode != Mode::Idle || self.status & STATUS_IRQ_MASK != 0 {
            self.status |= ERROR_EBUSY;
        }
        if self.status & ERROR_MASK != 0 {
            return;
        }

        if write {
            self.status |= STATUS_WBUSY;
            self.mode = Mode::Writing1;
        } else {
            self.status |= STATUS_RBUSY;
            self.mode = Mode::Reading1;
        }
        self.next_interest = ctx.cycle + self.seek_time(ctx.cycle);
        self.current_cylinder = self.transfer_sector / self.sectors_per_cylinder();
    }

    pub fn io_read(&mut self, port: u32) -> u32 {
        match port {
            PORT_STATUS => self.status,
            PORT_COMMAND => 0,
            PORT_DATA => self.data_port,
            PORT_TSECTOR => self.staged_sector,
            PORT_DMAADDR => self.staged_addr,
            _ => {
                tracing::warn!("disk: read from nonexistent port {port:#x}");
                0
            }
        }
    }

    pub fn io_write(&mut self, port: u32, word: u32, ctx: &mut IoCtx) {
        match port {
            PORT_STATUS | PORT_DATA => {} // read-only
            PORT_COMMAND => {
                self.status &= STATUS_MASK; // reset errors
                let clockspeed = ctx.clockspeed;
                let cycles_to_ms = move |cycles: u64| ((1000 * cycles) / clockspeed as u64) as u32;
                match word {
                    COMMAND_READ => self.start_transfer(false, ctx),
                    COMMAND_WRITE => self.start_transfer(true, ctx),
                    COMMAND_RESET_RIRQ => self.status &= !STATUS_RIRQ,
                    COMMAND_RESET_WIRQ => self.status &= !STATUS_WIRQ,
                    COMMAND_GET_SECTORS => self.data_port = self.num_sectors,
                    COMMAND_GET_SECTOR_SIZE => self.data_port = self.sector_size,
                    COMMAND_GET_SECTORS_PER_CYL => {
                        self.data_port = self.sectors_per_cylinder()
                    }
                    COMMAND_GET_ROT_TIME => self.data_port = cycles_to_ms(self.time_rot),
                    COMMAND_GET_SEEK_TIME => {
                        self.data_port = cycles_to_ms(self.time_fullseek)
                    }
                    _ => self.status |= ERROR_ICOMM,
                }
            }
            PORT_TSECTOR => self.staged_sector = word,
            PORT_DMAADDR => self.staged_addr = word,
            _ => {
                tracing::warn!("disk: write to nonexistent port {port:#x}");
            }
        }
    }

    /// One sector's pass-through time under the head.
    fn sector_time(&self) -> u64 {
        self.time_rot / self.sectors_per_cylinder() as u64
    }

    fn finish_transfer(&mut self, busy: u32, irq: u32, ctx: &mut TickCtx) {
        self.status &= !busy;
        // Pick a CPU for the IRQ, unless one is already being yelled at.
        if self.status & STATUS_MASK == 0 {
            self.irq_cpu = ctx.irq.select();
        }
        self.status |= irq;
        self.mode = Mode::Idle;
        self.next_interest = 0;
    }

    pub fn update(&mut self, info: &DeviceInfo, ctx: &mut TickCtx) {
        if self.status & STATUS_IRQ_MASK != 0 {
            if let Some(line) = info.irq {
                ctx.raise_hw_irq(self.irq_cpu, line);
            }
        }

        if self.next_interest != ctx.cycle || self.mode == Mode::Idle {
            return;
        }

        match self.mode {
            Mode::Reading1 => {
                let mut buf = vec![0u8; self.sector_size as usize];
                let offset = self.sector_size as u64 * self.transfer_sector as u64;
                if let Err(err) = self
                    .image
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| self.image.read_exact(&mut buf))
                {
                    tracing::error!("disk: error reading from image: {err}");
                }
                if ctx.mem.store_direct(self.transfer_addr, &buf).is_err() {
                    tracing::error!("disk: DMA write outside physical memory");
                }
                self.next_interest = ctx.cycle + self.sector_time();
                if self.next_interest == ctx.cycle {
                    self.next_interest += 1;
                }
                self.mode = Mode::Reading2;
            }
            Mode::Reading2 => self.finish_transfer(STATUS_RBUSY, STATUS_RIRQ, ctx),
            Mode::Writing1 => {
                let mut buf = vec![0u8; self.sector_size as usize];
                if ctx.mem.read_direct(self.transfer_addr, &mut buf).is_err() {
                    tracing::error!("disk: DMA read outside physical memory");
                }
                let offset = self.sector_size as u64 * self.transfer_sector as u64;
                if let Err(err) = self
                    .image
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| self.image.write_all(&buf))
                    .and_then(|_| self.image.flush())
                {
                    tracing::error!("disk: error writing to image: {err}");
                }
                self.next_interest = ctx.cycle + self.sector_time();
                if self.next_interest == ctx.cycle {
                    self.next_interest += 1;
                }
                self.mode = Mode::Writing2;
            }
            Mode::Writing2 => self.finish_transfer(STATUS_WBUSY, STATUS_WIRQ, ctx),
            Mode::Idle => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_input::AsyncInput;
    use crate::bits::Endianness;
    use crate::bus::RunState;
    use crate::cpu::Cpu;
    use crate::devices::IrqRouter;
    use crate::memory::Memory;

    const CLOCK: u32 = 100_000;

    fn make_disk(dir: &tempfile::TempDir, rot_ms: u32, seek_ms: u32) -> (Device, Memory) {
        let path = dir.path().join("disk.img");
        let dev = Disk::device(&path, 512, 16, 1, rot_ms, seek_ms, CLOCK).unwrap();
        // Stamp sector 3 with a recognizable pattern.
        let mut image = OpenOptions::new().write(true).open(&path).unwrap();
        image.seek(SeekFrom::Start(3 * 512)).unwrap();
        image.write_all(&[0xAB; 512]).unwrap();
        (dev, Memory::new(64, Endianness::Big))
    }

    fn disk_of(dev: &mut Device) -> &mut Disk {
        match &mut dev.kind {
            DeviceKind::Disk(disk) => disk,
            _ => unreachable!(),
        }
    }

    fn run_ticks(dev: &mut Device, mem: &mut Memory, cpus: &mut [Cpu], start: u64, n: u64) {
        let mut input = AsyncInput::disabled();
        let mut run = RunState::Running;
        let mut irq = IrqRouter::new(cpus.len());
        let mut plugs = Vec::new();
        for cycle in start..start + n {
            let mut ctx = TickCtx {
                cpus: &mut *cpus,
                mem: &mut *mem,
                plugs: &mut plugs,
                input: &mut input,
                cycle,
                clockspeed: CLOCK,
                run: &mut run,
                irq: &mut irq,
            };
            dev.update(&mut ctx);
        }
    }

    #[test]
    fn test_geometry_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dev, mut mem) = make_disk(&dir, 20, 40);
        let mut run = RunState::Running;
        let mut irq = IrqRouter::new(1);
        let mut plugs = Vec::new();
        let mut ctx = IoCtx {
            mem: &mut mem,
            plugs: &mut plugs,
            cycle: 0,
            clockspeed: CLOCK,
            run: &mut run,
            irq: &mut irq,
        };
        let disk = disk_of(&mut dev);

        disk.io_write(PORT_COMMAND, COMMAND_GET_SECTORS, &mut ctx);
        assert_eq!(disk.io_read(PORT_DATA), 16);
        disk.io_write(PORT_COMMAND, COMMAND_GET_SECTOR_SIZE, &mut ctx);
        assert_eq!(disk.io_read(PORT_DATA), 512);
        disk.io_write(PORT_COMMAND, COMMAND_GET_SECTORS_PER_CYL, &mut ctx);
        assert_eq!(disk.io_read(PORT_DATA), 16);
        disk.io_write(PORT_COMMAND, COMMAND_GET_ROT_TIME, &mut ctx);
        assert_eq!(disk.io_read(PORT_DATA), 20);
        disk.io_write(PORT_COMMAND, COMMAND_GET_SEEK_TIME, &mut ctx);
        assert_eq!(disk.io_read(PORT_DATA), 40);
    }

    #[test]
    fn test_read_completes_in_two_transitions_without_rotation() {
        // With one cylinder and no rotation time the seek time is zero
        // and the transfer finishes after exactly two wake-ups.
        let dir = tempfile::tempdir().unwrap();
        let (mut dev, mut mem) = make_disk(&dir, 0, 0);
        let mut cpus = vec![Cpu::new(0, true)];

        {
            let mut run = RunState::Running;
            let mut irq = IrqRouter::new(1);
            let mut plugs = Vec::new();
            let mut ctx = IoCtx {
                mem: &mut mem,
                plugs: &mut plugs,
                cycle: 0,
                clockspeed: CLOCK,
                run: &mut run,
                irq: &mut irq,
            };
            let disk = disk_of(&mut dev);
            disk.io_write(PORT_TSECTOR, 3, &mut ctx);
            disk.io_write(PORT_DMAADDR, 0x0001_0000, &mut ctx);
            disk.io_write(PORT_COMMAND, COMMAND_READ, &mut ctx);
            assert_eq!(disk.io_read(PORT_STATUS) & STATUS_RBUSY, STATUS_RBUSY);
        }

        run_ticks(&mut dev, &mut mem, &mut cpus, 0, 2);

        let disk = disk_of(&mut dev);
        let status = disk.io_read(PORT_STATUS);
        assert_eq!(status & STATUS_RIRQ, STATUS_RIRQ);
        assert_eq!(status & STATUS_RBUSY, 0);
        assert_eq!(mem.load8(0x0001_0000), 0xAB);
        assert_eq!(mem.load8(0x0001_0000 + 511), 0xAB);
    }

    #[test]
    fn test_write_transfers_memory_to_image() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dev, mut mem) = make_disk(&dir, 0, 0);
        let mut cpus = vec![Cpu::new(0, true)];
        mem.store_direct(0x2000, &[0x5A; 512]).unwrap();

        {
            let mut run = RunState::Running;
            let mut irq = IrqRouter::new(1);
            let mut plugs = Vec::new();
            let mut ctx = IoCtx {
                mem: &mut mem,
                plugs: &mut plugs,
                cycle: 0,
                clockspeed: CLOCK,
                run: &mut run,
                irq: &mut irq,
            };
            let disk = disk_of(&mut dev);
            disk.io_write(PORT_TSECTOR, 5, &mut ctx);
            disk.io_write(PORT_DMAADDR, 0x2000, &mut ctx);
            disk.io_write(PORT_COMMAND, COMMAND_WRITE, &mut ctx);
        }

        run_ticks(&mut dev, &mut mem, &mut cpus, 0, 2);

        let disk = disk_of(&mut dev);
        assert_eq!(disk.io_read(PORT_STATUS) & STATUS_WIRQ, STATUS_WIRQ);
        let mut sector = vec![0u8; 512];
        disk.image.seek(SeekFrom::Start(5 * 512)).unwrap();
        disk.image.read_exact(&mut sector).unwrap();
        assert!(sector.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_invalid_parameters_set_error_bits() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dev, mut mem) = make_disk(&dir, 0, 0);
        let mut run = RunState::Running;
        let mut irq = IrqRouter::new(1);
        let mut plugs = Vec::new();
        let mut ctx = IoCtx {
            mem: &mut mem,
            plugs: &mut plugs,
            cycle: 0,
            clockspeed: CLOCK,
            run: &mut run,
            irq: &mut irq,
        };
        let disk = disk_of(&mut dev);

        // Sector out of range.
        disk.io_write(PORT_TSECTOR, 99, &mut ctx);
        disk.io_write(PORT_DMAADDR, 0, &mut ctx);
        disk.io_write(PORT_COMMAND, COMMAND_READ, &mut ctx);
        assert_eq!(disk.io_read(PORT_STATUS) & ERROR_ISECT, ERROR_ISECT);
        assert_eq!(disk.mode, Mode::Idle);

        // DMA address past the end of memory.
        disk.io_write(PORT_TSECTOR, 3, &mut ctx);
        disk.io_write(PORT_DMAADDR, 0xffff_0000, &mut ctx);
        disk.io_write(PORT_COMMAND, COMMAND_READ, &mut ctx);
        assert_eq!(disk.io_read(PORT_STATUS) & ERROR_IADDR, ERROR_IADDR);

        // Unknown command.
        disk.io_write(PORT_COMMAND, 0x7f, &mut ctx);
        assert_eq!(disk.io_read(PORT_STATUS) & ERROR_ICOMM, ERROR_ICOMM);
    }

    #[test]
    fn test_busy_rejects_second_command() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dev, mut mem) = make_disk(&dir, 10, 10);
        let mut run = RunState::Running;
        let mut irq = IrqRouter::new(1);
        let mut plugs = Vec::new();
        let mut ctx = IoCtx {
            mem: &mut mem,
            plugs: &mut plugs,
            cycle: 0,
            clockspeed: CLOCK,
            run: &mut run,
            irq: &mut irq,
        };
        let disk = disk_of(&mut dev);

        disk.io_write(PORT_TSECTOR, 3, &mut ctx);
        disk.io_write(PORT_DMAADDR, 0x1000, &mut ctx);
        disk.io_write(PORT_COMMAND, COMMAND_READ, &mut ctx);
        assert_ne!(disk.mode, Mode::Idle);

        disk.io_write(PORT_COMMAND, COMMAND_READ, &mut ctx);
        assert_eq!(disk.io_read(PORT_STATUS) & ERROR_EBUSY, ERROR_EBUSY);
    }

    #[test]
    fn test_seek_time_zero_on_same_cylinder() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dev, _mem) = make_disk(&dir, 0, 100);
        let disk = disk_of(&mut dev);
        disk.transfer_sector = 7;
        assert_eq!(disk.seek_time(12345), 0);
    }

    #[test]
    fn test_rotational_latency_waits_for_sector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut dev = Disk::device(&path, 512, 16, 1, 16, 0, 1_000_000).unwrap();
        let disk = disk_of(&mut dev);
        // One rotation is 16000 cycles, 1000 per sector. At cycle 0 the
        // head is at sector 0; sector 4 starts 4000 cycles later.
        disk.transfer_sector = 4;
        assert_eq!(disk.seek_time(0), 4000);
        // At cycle 4500 the head is inside sector 4; wait a full turn.
        disk.transfer_sector = 4;
        assert_eq!(disk.seek_time(4500), 15500);
    }
}
