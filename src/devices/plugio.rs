//! Bridge to external device processes ("pluggable I/O").
//!
//! A plugin is a separate process on the far end of a stream socket that
//! implements one or more devices. The wire protocol is length-prefixed
//! big-endian words; each message starts with a command word
//! `flags | tag << 16 | cmd << 8 | cpu`. The tag names the device on a
//! shared connection, LAST marks the end of a reply batch, ASYNC marks an
//! event the plugin sent on its own and WORDSLE (sent once at INIT) tells
//! the plugin the guest is little-endian.
//!
//! The core is the protocol master: PORTR/PORTW for port access, DATAR/
//! DATAW for MMAP windows, ADELAY/ALARM when a plugin-requested delay or
//! timer expires. Plugins answer with OK/WORD/DATA and may interleave
//! DELAY, TIMER, IRQ, CPUIRQ, CLIRQ and DMA traffic. A protocol violation
//! or lost connection is unrecoverable and terminates the simulator.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

use crate::async_input::AsyncInput;
use crate::memory::Memory;

use super::sock::Stream;
use super::{IoCtx, IrqRouter, TickCtx};

pub const FLAG_LAST: u32 = 0x8000_0000;
pub const FLAG_ASYNC: u32 = 0x4000_0000;
pub const FLAG_WORDS_LE: u32 = 0x2000_0000;

pub const CMD_INIT: u32 = 1;
pub const REPLY_DEVICE: u32 = 2;
pub const CMD_MMAP: u32 = 3;
pub const CMD_PORTR: u32 = 10;
pub const CMD_PORTW: u32 = 11;
pub const CMD_DATAR: u32 = 12;
pub const CMD_DATAW: u32 = 13;
pub const CMD_ADELAY: u32 = 14;
pub const CMD_ALARM: u32 = 15;

pub const REPLY_OK: u32 = 100;
pub const REPLY_WORD: u32 = 101;
pub const REPLY_DATA: u32 = 102;
pub const REPLY_DELAY: u32 = 103;
pub const REPLY_IRQ: u32 = 104;
pub const REPLY_CPUIRQ: u32 = 105;
pub const REPLY_CLIRQ: u32 = 106;
pub const REPLY_DMAW: u32 = 107;
pub const REPLY_DMAR: u32 = 108;
pub const REPLY_TIMER: u32 = 109;

/// "Never" marker for the delayed-effect and timer cycles.
const NEVER: u64 = u64::MAX;

pub fn make_cmd(flags: u32, tag: u8, cmd: u32, cpu: u32) -> u32 {
    flags | ((tag as u32) << 16) | (cmd << 8) | cpu
}

fn cmd_of(word: u32) -> u32 {
    (word & 0xff00) >> 8
}

fn tag_of(word: u32) -> u8 {
    ((word & 0xff_0000) >> 16) as u8
}

/// There is no recovering from a confused plugin.
fn connection_lost() -> ! {
    eprintln!("PLUGIO: protocol error or connection lost, shutting down.");
    std::process::exit(1);
}

/// What the caller wants out of a synchronous reply batch.
enum Expect<'a> {
    Nothing,
    Word(&'a mut u32),
    Data(&'a mut [u8]),
}

/// Per-device state on a plugin connection.
pub struct PlugUnit {
    pub tag: u8,
    pub async_events: bool,
    /// Pending IRQ line, asserted every tick until CLIRQ.
    pub irq_pending: Option<u32>,
    pub irq_cpu: usize,
    /// Absolute cycles of the plugin-requested wake-ups, or never.
    pub delayed_effect: u64,
    pub timer: u64,
    pub mmap_base: u32,
    pub mmap_size: u32,
}

/// A device announced by the plugin during the INIT handshake.
pub struct NewPlugDevice {
    pub typecode: u32,
    pub vendor: [u8; 8],
    pub irq: Option<u32>,
    pub io_length: u32,
    pub mmap_size: u32,
    pub tag: u8,
}

/// What a plugin may touch while its replies are processed.
pub struct PlugCtx<'a> {
    pub mem: &'a mut Memory,
    pub irq: &'a mut IrqRouter,
    pub cycle: u64,
    pub clockspeed: u32,
}

/// One plugin process: the socket plus every device it announced.
pub struct PlugConnection {
    stream: Stream,
    pub units: Vec<PlugUnit>,
}

impl PlugConnection {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            units: Vec::new(),
        }
    }

    pub fn poll_fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }

    fn read_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        if self.stream.read_exact(&mut buf).is_err() {
            connection_lost();
        }
        u32::from_be_bytes(buf)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) {
        if self.stream.read_exact(buf).is_err() {
            connection_lost();
        }
    }

    fn write_u32(&mut self, value: u32) {
        if self.stream.write_all(&value.to_be_bytes()).is_err() {
            connection_lost();
        }
    }

    fn write_bytes(&mut self, data: &[u8]) {
        if self.stream.write_all(data).is_err() {
            connection_lost();
        }
    }

    fn unit_index(&self, tag: u8) -> Option<usize> {
        self.units.iter().position(|unit| unit.tag == tag)
    }

    /// INIT handshake: announce the machine, collect DEVICE replies.
    pub fn init(
        &mut self,
        async_events: bool,
        options: &str,
        num_cpus: u32,
        memsize: u32,
        irq: Option<u32>,
        big_endian: bool,
    ) -> Vec<NewPlugDevice> {
        let mut flags = 0;
        if async_events {
            flags |= FLAG_ASYNC;
        }
        if !big_endian {
            flags |= FLAG_WORDS_LE;
        }
        self.write_u32(make_cmd(flags, 0, CMD_INIT, 0));
        self.write_u32(num_cpus);
        self.write_u32(memsize);
        self.write_u32(irq.map_or(0xffff_ffff, |line| line));
        self.write_u32(options.len() as u32);
        if !options.is_empty() {
            self.write_bytes(options.as_bytes());
        }

        let mut devices = Vec::new();
        loop {
            let cmd_word = self.read_u32();
            let typecode = self.read_u32();
            let nports = self.read_u32();
            let irq = self.read_u32();
            let mut vendor = [0u8; 8];
            self.read_bytes(&mut vendor);
            let mmap_size = self.read_u32();

            if cmd_of(cmd_word) != REPLY_DEVICE {
                connection_lost();
            }

            let tag = tag_of(cmd_word);
            self.units.push(PlugUnit {
                tag,
                async_events: async_events && cmd_word & FLAG_ASYNC != 0,
                irq_pending: None,
                irq_cpu: 0,
                delayed_effect: NEVER,
                timer: NEVER,
                mmap_base: 0,
                mmap_size,
            });
            devices.push(NewPlugDevice {
                typecode,
                vendor,
                irq: (irq <= 5).then_some(irq),
                io_length: 4 * nports,
                mmap_size,
                tag,
            });

            if cmd_word & FLAG_LAST != 0 {
                break;
            }
        }
        devices
    }

    /// Tell the plugin where its MMAP window landed.
    pub fn send_mmap(&mut self, tag: u8, base: u32) {
        if let Some(index) = self.unit_index(tag) {
            self.units[index].mmap_base = base;
        }
        self.write_u32(make_cmd(0, tag, CMD_MMAP, 0));
        self.write_u32(base);
    }

    pub fn port_read(&mut self, tag: u8, port: u32, ctx: &mut PlugCtx) -> u32 {
        self.write_u32(make_cmd(0, tag, CMD_PORTR, 0));
        self.write_u32(port >> 2);
        let mut word = 0;
        self.handle_replies(tag, Expect::Word(&mut word), false, ctx);
        word
    }

    pub fn port_write(&mut self, tag: u8, port: u32, data: u32, ctx: &mut PlugCtx) {
        self.write_u32(make_cmd(0, tag, CMD_PORTW, 0));
        self.write_u32(port >> 2);
        self.write_u32(data);
        self.handle_replies(tag, Expect::Nothing, false, ctx);
    }

    /// Read up to four guest-order bytes from the MMAP window.
    pub fn mmap_read(&mut self, tag: u8, offset: u32, size: u32, ctx: &mut PlugCtx) -> [u8; 4] {
        self.write_u32(make_cmd(0, tag, CMD_DATAR, 0));
        self.write_u32(offset);
        self.write_u32(size);
        let mut data = [0u8; 4];
        self.handle_replies(tag, Expect::Data(&mut data[..size as usize]), false, ctx);
        data
    }

    pub fn mmap_write(&mut self, tag: u8, offset: u32, data: &[u8], ctx: &mut PlugCtx) {
        self.write_u32(make_cmd(0, tag, CMD_DATAW, 0));
        self.write_u32(offset);
        self.write_u32(data.len() as u32);
        self.write_bytes(data);
        self.handle_replies(tag, Expect::Nothing, false, ctx);
    }

    /// A relative delay in either encoding: a zero first word means the
    /// second is milliseconds, a nonzero first word is already cycles and
    /// the second word is read but ignored.
    fn read_delay(&mut self, ctx: &PlugCtx) -> u64 {
        let first = self.read_u32();
        if first == 0 {
            let ms = self.read_u32();
            ctx.cycle + ms as u64 * ctx.clockspeed as u64 / 1000
        } else {
            let _ = self.read_u32();
            ctx.cycle + first as u64
        }
    }

    /// Process a reply batch until LAST. Asynchronous replies carry their
    /// own tag and may target any device on this connection; in
    /// synchronous mode they do not end the batch.
    fn handle_replies(&mut self, for_tag: u8, mut expect: Expect, async_mode: bool, ctx: &mut PlugCtx) {
        loop {
            let cmd_word = self.read_u32();
            let mut last = cmd_word & FLAG_LAST != 0;
            if !async_mode && cmd_word & FLAG_ASYNC != 0 {
                last = false;
            }

            // Replies to a device this connection never announced, or
            // synchronous replies tagged for someone else, are fatal.
            let reply_tag = tag_of(cmd_word);
            if cmd_word & FLAG_ASYNC == 0 && reply_tag != for_tag {
                connection_lost();
            }
            let Some(unit) = self.unit_index(reply_tag) else {
                connection_lost();
            };

            match cmd_of(cmd_word) {
                REPLY_OK => {}
                REPLY_WORD => {
                    let value = self.read_u32();
                    if let Expect::Word(out) = &mut expect {
                        **out = value;
                    }
                }
                REPLY_DATA => {
                    let len = self.read_u32() as usize;
                    match &mut expect {
                        Expect::Data(out) if out.len() == len => self.read_bytes(out),
                        _ => connection_lost(),
                    }
                }
                REPLY_DELAY => {
                    self.units[unit].delayed_effect = self.read_delay(ctx);
                }
                REPLY_TIMER => {
                    self.units[unit].timer = self.read_delay(ctx);
                }
                REPLY_IRQ => {
                    let line = self.read_u32();
                    if self.units[unit].irq_pending.is_some() {
                        connection_lost();
                    }
                    self.units[unit].irq_pending = (line <= 5).then_some(line);
                    self.units[unit].irq_cpu = ctx.irq.select();
                }
                REPLY_CPUIRQ => {
                    let cpu = self.read_u32();
                    if self.units[unit].irq_pending.is_some() {
                        connection_lost();
                    }
                    let line = self.read_u32();
                    self.units[unit].irq_cpu = cpu as usize;
                    self.units[unit].irq_pending = (line <= 5).then_some(line);
                }
                REPLY_CLIRQ => {
                    self.units[unit].irq_pending = None;
                }
                REPLY_DMAW => {
                    let addr = self.read_u32();
                    let len = self.read_u32();
                    if addr.wrapping_add(len) > ctx.mem.size() {
                        eprintln!("PLUGIO: memory write out of bounds.");
                        connection_lost();
                    }
                    let mut buf = vec![0u8; len as usize];
                    self.read_bytes(&mut buf);
                    let _ = ctx.mem.store_direct(addr, &buf);
                }
                REPLY_DMAR => {
                    let addr = self.read_u32();
                    let len = self.read_u32();
                    if addr.wrapping_add(len) > ctx.mem.size() {
                        eprintln!("PLUGIO: memory read out of bounds.");
                        connection_lost();
                    }
                    let mut buf = vec![0u8; len as usize];
                    let _ = ctx.mem.read_direct(addr, &mut buf);
                    self.write_u32(make_cmd(0, reply_tag, REPLY_DATA, 0));
                    self.write_u32(len);
                    self.write_bytes(&buf);
                }
                _ => connection_lost(),
            }

            if last {
                break;
            }
        }
    }

    /// Per-tick work for one unit: fire expired delays and alarms, drain
    /// asynchronous traffic.
    pub fn tick_unit(&mut self, tag: u8, input: &mut AsyncInput, ctx: &mut PlugCtx) {
        let Some(unit) = self.unit_index(tag) else {
            return;
        };

        if self.units[unit].delayed_effect == ctx.cycle {
            self.units[unit].delayed_effect = NEVER;
            self.write_u32(make_cmd(0, tag, CMD_ADELAY, 0));
            self.handle_replies(tag, Expect::Nothing, false, ctx);
        }

        if self.units[unit].timer == ctx.cycle {
            self.units[unit].timer = NEVER;
            self.write_u32(make_cmd(0, tag, CMD_ALARM, 0));
            self.handle_replies(tag, Expect::Nothing, false, ctx);
        }

        let fd = self.stream.as_raw_fd();
        if self.units[unit].async_events && input.check(fd) && input.verify(fd) {
            self.handle_replies(tag, Expect::Nothing, true, ctx);
        }
    }
}

/// The bus-facing face of one plugin device: a connection index plus the
/// device tag on that connection.
pub struct PlugPort {
    pub conn: usize,
    pub tag: u8,
}

impl PlugPort {
    pub fn io_read(&self, port: u32, ctx: &mut IoCtx) -> u32 {
        let mut pctx = PlugCtx {
            mem: &mut *ctx.mem,
            irq: &mut *ctx.irq,
            cycle: ctx.cycle,
            clockspeed: ctx.clockspeed,
        };
        ctx.plugs[self.conn].port_read(self.tag, port, &mut pctx)
    }

    pub fn io_write(&self, port: u32, word: u32, ctx: &mut IoCtx) {
        let mut pctx = PlugCtx {
            mem: &mut *ctx.mem,
            irq: &mut *ctx.irq,
            cycle: ctx.cycle,
            clockspeed: ctx.clockspeed,
        };
        ctx.plugs[self.conn].port_write(self.tag, port, word, &mut pctx)
    }

    pub fn update(&self, ctx: &mut TickCtx) {
        {
            let mut pctx = PlugCtx {
                mem: &mut *ctx.mem,
                irq: &mut *ctx.irq,
                cycle: ctx.cycle,
                clockspeed: ctx.clockspeed,
            };
            ctx.plugs[self.conn].tick_unit(self.tag, &mut *ctx.input, &mut pctx);
        }

        let conn = &ctx.plugs[self.conn];
        if let Some(index) = conn.unit_index(self.tag) {
            let unit = &conn.units[index];
            if let Some(line) = unit.irq_pending {
                let cpu = unit.irq_cpu;
                ctx.raise_hw_irq(cpu, line);
            }
        }
    }
}
