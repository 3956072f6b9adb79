//! GDB remote-serial-protocol stub.
//!
//! The stub listens on TCP, accepts a single debugger and hooks into the
//! simulation loop: once per tick, under the input lock, the machine asks
//! [`GdbStub::check_and_run`] whether the debugger wants control. That
//! happens when the debugger sent something (a packet or a break) or when
//! the machine just stopped at a breakpoint. Inside the packet loop the
//! stub owns the machine: `s` steps one tick, `c` resumes the run loop,
//! `k` kills the simulator.
//!
//! The register packet layout is the classic 73-register MIPS set:
//! 32 general registers, sr, lo, hi, bad, cause, pc, then the floating
//! point registers, which read as zero here.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::bus::{RunState, Width};
use crate::cpu::cp0::{BAD_VADDR, CAUSE, STATUS};
use crate::cpu::{HI, LO, PC};
use crate::machine::Machine;

const NUM_GDB_REGS: usize = 73;

pub struct GdbStub {
    stream: TcpStream,
    connected: bool,
    debug_packets: bool,
}

impl GdbStub {
    /// Listen on `port` and block until a debugger connects.
    pub fn open(port: u16) -> std::io::Result<GdbStub> {
        println!("gdb interface listening on port {port}");
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let (stream, peer) = listener.accept()?;
        println!("Connect from host {}, port {}.", peer.ip(), peer.port());
        Ok(GdbStub {
            stream,
            connected: true,
            debug_packets: false,
        })
    }

    /// The socket to register with the async-input helper.
    pub fn poll_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Per-tick hook. Returns false when the simulator should die.
    pub fn check_and_run(&mut self, machine: &mut Machine) -> bool {
        if self.connected
            && (machine.input.check(self.stream.as_raw_fd())
                || machine.bus.run == RunState::Console)
        {
            return self.process(machine);
        }
        true
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }

    /// Read one `$data#xx` packet, acknowledging good checksums.
    fn get_packet(&mut self) -> Option<String> {
        loop {
            // Hunt for the packet start.
            loop {
                match self.read_byte()? {
                    b'$' => break,
                    0x03 => return Some("\x03".into()), // break request
                    _ => {}
                }
            }

            let mut data = Vec::new();
            let mut checksum = 0u8;
            loop {
                let byte = self.read_byte()?;
                if byte == b'#' {
                    break;
                }
                checksum = checksum.wrapping_add(byte);
                data.push(byte);
            }
            let mut digits = [0u8; 2];
            digits[0] = self.read_byte()?;
            digits[1] = self.read_byte()?;
            let sent = u8::from_str_radix(std::str::from_utf8(&digits).ok()?, 16).ok()?;

            if sent == checksum {
                let _ = self.stream.write_all(b"+");
                return String::from_utf8(data).ok();
            }
            let _ = self.stream.write_all(b"-");
        }
    }

    fn put_packet(&mut self, data: &str) {
        let checksum: u8 = data.bytes().fold(0, |sum, byte| sum.wrapping_add(byte));
        let packet = format!("${data}#{checksum:02x}");
        loop {
            if self.stream.write_all(packet.as_bytes()).is_err() {
                self.close();
                return;
            }
            match self.read_byte() {
                Some(b'+') => return,
                Some(b'-') => continue,
                _ => {
                    self.close();
                    return;
                }
            }
        }
    }

    fn close(&mut self) {
        self.connected = false;
        println!("gdb connection closed");
    }

    /// The packet loop. Returns false to kill the simulator.
    fn process(&mut self, machine: &mut Machine) -> bool {
        // If the machine was running we got here because the user hit
        // break in gdb; tell it we stopped.
        if machine.bus.run == RunState::Running {
            machine.bus.run = RunState::Console;
            self.put_packet("S05");
        }

        let mut step_cpu = 0usize;
        let mut other_cpu = 0usize;

        loop {
            let Some(packet) = self.get_packet() else {
                // No valid packet: assume the connection died.
                self.close();
                return true;
            };
            if self.debug_packets {
                println!("from gdb: {packet}");
            }

            let mut reply = String::new();
            let mut rest = packet.as_str();
            let command = take_byte(&mut rest);

            match command {
                Some('\x03') | Some('?') => reply = "S01".into(),
                Some('c') => {
                    if let Some(addr) = take_hex(&mut rest) {
                        machine.cpus[step_cpu].set_pc(addr);
                    }
                    machine.bus.run = RunState::Running;
                    return true;
                }
                Some('d') => {
                    self.debug_packets = !self.debug_packets;
                }
                Some('g') => {
                    for regnum in 0..NUM_GDB_REGS {
                        let value = read_register(machine, other_cpu, regnum);
                        reply.push_str(&format!("{value:08x}"));
                    }
                }
                Some('G') => {
                    for regnum in 0..NUM_GDB_REGS {
                        match take_hex_digits(&mut rest, 8) {
                            Some(value) => {
                                write_register(machine, other_cpu, regnum, value)
                            }
                            None => break,
                        }
                    }
                    reply = "OK".into();
                }
                Some('H') => {
                    let kind = take_byte(&mut rest);
                    match take_signed_hex(&mut rest) {
                        Some(id) => {
                            // gdb threads start at 1, CPUs at 0; "any"
                            // (-1 or 0) means CPU 0.
                            let cpu = if id <= 0 {
                                0
                            } else {
                                (id as usize - 1).min(machine.cpus.len() - 1)
                            };
                            match kind {
                                Some('c') => {
                                    step_cpu = cpu;
                                    reply = "OK".into();
                                }
                                Some('g') => {
                                    other_cpu = cpu;
                                    reply = "OK".into();
                                }
                                _ => reply = "E01".into(),
                            }
                        }
                        None => reply = "E01".into(),
                    }
                }
                Some('k') => return false,
                Some('m') => {
                    match (take_hex(&mut rest), take_byte(&mut rest), take_hex(&mut rest)) {
                        (Some(addr), Some(','), Some(length)) => {
                            for offset in 0..length {
                                let byte = machine
                                    .debug_read(addr.wrapping_add(offset), Width::Byte)
                                    .unwrap_or(0);
                                reply.push_str(&format!("{byte:02x}"));
                            }
                        }
                        _ => reply = "E01".into(),
                    }
                }
                Some('M') => {
                    match (take_hex(&mut rest), take_byte(&mut rest), take_hex(&mut rest)) {
                        (Some(addr), Some(','), Some(length)) => {
                            if take_byte(&mut rest) == Some(':') {
                                for offset in 0..length {
                                    match take_hex_digits(&mut rest, 2) {
                                        Some(byte) => {
                                            let _ = machine.debug_write(
                                                addr.wrapping_add(offset),
                                                Width::Byte,
                                                byte,
                                            );
                                        }
                                        None => break,
                                    }
                                }
                                reply = "OK".into();
                            } else {
                                reply = "E02".into();
                            }
                        }
                        _ => reply = "E02".into(),
                    }
                }
                Some('p') => match take_hex(&mut rest) {
                    Some(regnum) if regnum < NUM_GDB_REGS as u32 => {
                        let value = read_register(machine, other_cpu, regnum as usize);
                        reply = format!("{value:08x}");
                    }
                    _ => reply = "E01".into(),
                },
                Some('P') => {
                    match (take_hex(&mut rest), take_byte(&mut rest), take_hex(&mut rest)) {
                        (Some(regnum), Some('='), Some(value)) => {
                            write_register(machine, other_cpu, regnum as usize, value);
                            reply = "OK".into();
                        }
                        _ => reply = "E01".into(),
                    }
                }
                Some('q') => {
                    if rest == "fThreadInfo" {
                        reply.push_str("m01");
                        for cpu in 1..machine.cpus.len() {
                            reply.push_str(&format!(",{:02x}", cpu + 1));
                        }
                        reply.push('l');
                    }
                }
                Some('s') => {
                    machine.step(1, None);
                    reply = "S01".into();
                }
                Some('T') => match take_hex(&mut rest) {
                    Some(id) if (id as usize).wrapping_sub(1) < machine.cpus.len() => {
                        reply = "OK".into();
                    }
                    _ => reply = "E01".into(),
                },
                Some('z') | Some('Z') => {
                    let insert = command == Some('Z');
                    let kind = take_byte(&mut rest);
                    let args = (take_byte(&mut rest), take_hex(&mut rest));
                    match (kind, args) {
                        // Only the single hardware breakpoint exists.
                        (Some('1'), (Some(','), Some(addr))) => {
                            machine.bus.breakpoint =
                                if insert { addr } else { 0xffff_ffff };
                            reply = "OK".into();
                        }
                        (Some(_), (Some(','), Some(_))) => reply = "E01".into(),
                        _ => reply = "E02".into(),
                    }
                }
                _ => {}
            }

            self.put_packet(&reply);
            if self.debug_packets {
                println!("to gdb: {reply}");
            }
            if !self.connected {
                return true;
            }
        }
    }
}

/// The 73-register gdb view of one CPU.
fn read_register(machine: &Machine, cpu: usize, regnum: usize) -> u32 {
    let cpu = &machine.cpus[cpu.min(machine.cpus.len() - 1)];
    match regnum {
        0..=31 => cpu.regs[regnum],
        32 => cpu.cp0.regs[STATUS],
        33 => cpu.regs[LO],
        34 => cpu.regs[HI],
        35 => cpu.cp0.regs[BAD_VADDR],
        36 => cpu.cp0.regs[CAUSE],
        37 => cpu.regs[PC],
        _ => 0, // floating point registers
    }
}

fn write_register(machine: &mut Machine, cpu: usize, regnum: usize, value: u32) {
    let index = cpu.min(machine.cpus.len() - 1);
    let cpu = &mut machine.cpus[index];
    match regnum {
        0 => {}
        1..=31 => cpu.regs[regnum] = value,
        32 => cpu.cp0.regs[STATUS] = value,
        33 => cpu.regs[LO] = value,
        34 => cpu.regs[HI] = value,
        35 => cpu.cp0.regs[BAD_VADDR] = value,
        36 => cpu.cp0.regs[CAUSE] = value,
        37 => cpu.regs[PC] = value,
        _ => {}
    }
}

fn take_byte(rest: &mut &str) -> Option<char> {
    let mut chars = rest.chars();
    let first = chars.next()?;
    *rest = chars.as_str();
    Some(first)
}

/// Consume a hex number of any length.
fn take_hex(rest: &mut &str) -> Option<u32> {
    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_hexdigit()).len();
    if digits == 0 {
        return None;
    }
    let value = u32::from_str_radix(&rest[..digits.min(8)], 16).ok()?;
    *rest = &rest[digits..];
    Some(value)
}

/// Consume exactly `count` hex digits.
fn take_hex_digits(rest: &mut &str, count: usize) -> Option<u32> {
    if rest.len() < count || !rest[..count].bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let value = u32::from_str_radix(&rest[..count], 16).ok()?;
    *rest = &rest[count..];
    Some(value)
}

/// Consume a hex number with an optional leading minus.
fn take_signed_hex(rest: &mut &str) -> Option<i64> {
    let negative = rest.starts_with('-');
    if negative {
        *rest = &rest[1..];
    }
    let value = take_hex(rest)? as i64;
    Some(if negative { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_hex() {
        let mut rest = "10,4:aabb";
        assert_eq!(take_hex(&mut rest), Some(0x10));
        assert_eq!(take_byte(&mut rest), Some(','));
        assert_eq!(take_hex(&mut rest), Some(4));
        assert_eq!(take_byte(&mut rest), Some(':'));
        assert_eq!(take_hex_digits(&mut rest, 2), Some(0xaa));
        assert_eq!(take_hex_digits(&mut rest, 2), Some(0xbb));
        assert_eq!(take_hex(&mut rest), None);
    }

    #[test]
    fn test_take_signed_hex() {
        let mut rest = "-1";
        assert_eq!(take_signed_hex(&mut rest), Some(-1));
        let mut rest = "1f";
        assert_eq!(take_signed_hex(&mut rest), Some(0x1f));
    }

    #[test]
    fn test_checksum_format() {
        let data = "OK";
        let checksum: u8 = data.bytes().fold(0, |sum, byte| sum.wrapping_add(byte));
        assert_eq!(format!("{checksum:02x}"), "9a");
    }
}
