//! Virtual terminal over a stream socket.
//!
//! Three word ports: STATUS (read-only), COMMAND (write-only) and DATA.
//! Reading DATA consumes the one-byte input slot; writing DATA stages the
//! one-byte output slot, which is flushed to the socket on the device's
//! send-delay schedule. Incoming bytes are only looked for when the
//! async-input helper reports the socket readable, so an idle terminal
//! costs nothing.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

use super::sock::Stream;
use super::{Device, DeviceInfo, DeviceKind, TickCtx, TYPECODE_TTY};

pub const PORT_STATUS: u32 = 0x00;
pub const PORT_COMMAND: u32 = 0x04;
pub const PORT_DATA: u32 = 0x08;

pub const COMMAND_RESET_READ_IRQ: u32 = 0x01;
pub const COMMAND_RESET_WRITE_IRQ: u32 = 0x02;
pub const COMMAND_ENABLE_WIRQ: u32 = 0x03;
pub const COMMAND_DISABLE_WIRQ: u32 = 0x04;

pub const STATUS_RAVAIL: u32 = 1 << 0;
pub const STATUS_WBUSY: u32 = 1 << 1;
pub const STATUS_RIRQ: u32 = 1 << 2;
pub const STATUS_WIRQ: u32 = 1 << 3;
pub const STATUS_WIRQ_ENABLED: u32 = 1 << 4;
pub const ERROR_ICOMM: u32 = 0x2000_0000;

/// Default IRQ line when the configuration names none.
pub const IRQ_TTY: u32 = 2;

const IO_LENGTH: u32 = 12;

pub struct Tty {
    stream: Stream,
    /// Output flush interval in milliseconds.
    send_delay: u32,
    inbuf: Option<u8>,
    outbuf: Option<u8>,
    rirq_pending: bool,
    wirq_pending: bool,
    wirq_enabled: bool,
    error: u32,
    irq_cpu: usize,
}

impl Tty {
    /// Wrap a connected stream as a TTY device and greet the peer.
    pub fn device(mut stream: Stream, send_delay: u32) -> Device {
        let welcome = "Welcome. This is a yams virtual terminal.\n\n";
        if let Err(err) = stream.write_all(welcome.as_bytes()) {
            tracing::warn!("TTY: could not send welcome banner: {err}");
        }
        Device {
            info: DeviceInfo::new(TYPECODE_TTY, b"TTY-FAKE", Some(IRQ_TTY), IO_LENGTH),
            kind: DeviceKind::Tty(Tty {
                stream,
                send_delay,
                inbuf: None,
                outbuf: None,
                rirq_pending: false,
                wirq_pending: false,
                wirq_enabled: true,
                error: 0,
                irq_cpu: 0,
            }),
        }
    }

    /// The socket fd to register with the async-input helper.
    pub fn poll_fd(&self) -> i32 {
        self.stream.as_raw_fd()
    }

    pub fn io_read(&mut self, port: u32) -> u32 {
        match port {
            PORT_STATUS => {
                let mut status = self.error;
                if self.inbuf.is_some() {
                    status |= STATUS_RAVAIL;
                }
                if self.outbuf.is_some() {
                    status |= STATUS_WBUSY;
                }
                if self.rirq_pending {
                    status |= STATUS_RIRQ;
                }
                if self.wirq_pending {
                    status |= STATUS_WIRQ;
                }
                if self.wirq_enabled {
                    status |= STATUS_WIRQ_ENABLED;
                }
                status
            }
            PORT_COMMAND => 0,
            PORT_DATA => match self.inbuf.take() {
                Some(byte) => byte as u32,
                None => 0,
            },
            _ => {
                tracing::warn!("TTY: read from nonexistent port {port:#x}");
                0
            }
        }
    }

    pub fn io_write(&mut self, port: u32, word: u32) {
        match port {
            PORT_STATUS => {} // read-only
            PORT_COMMAND => {
                self.error = ERROR_ICOMM;
                match word {
                    COMMAND_RESET_READ_IRQ => {
                        self.error = 0;
                        self.rirq_pending = false;
                    }
                    COMMAND_RESET_WRITE_IRQ => {
                        self.error = 0;
                        self.wirq_pending = false;
                    }
                    COMMAND_ENABLE_WIRQ => {
                        self.error = 0;
                        self.wirq_enabled = true;
                    }
                    COMMAND_DISABLE_WIRQ => {
                        self.error = 0;
                        self.wirq_enabled = false;
                    }
                    _ => {}
                }
            }
            PORT_DATA => {
                // Staging while full drops the byte on the floor.
                if self.outbuf.is_none() {
                    self.outbuf = Some(word as u8);
                }
            }
            _ => {
                tracing::warn!("TTY: write to nonexistent port {port:#x}");
            }
        }
    }

    fn raise_read_interrupt(&mut self, ctx: &mut TickCtx) {
        if !self.wirq_pending && !self.rirq_pending {
            self.irq_cpu = ctx.irq.select();
        }
        self.rirq_pending = true;
    }

    fn raise_write_interrupt(&mut self, ctx: &mut TickCtx) {
        if !self.wirq_pending && !self.rirq_pending {
            self.irq_cpu = ctx.irq.select();
        }
        self.wirq_pending = true;
    }

    pub fn update(&mut self, info: &DeviceInfo, ctx: &mut TickCtx) {
        let delay = self.send_delay as u64 * ctx.clockspeed as u64 / 1000 + 1;

        if (ctx.cycle & 0x0ff_ffff) % delay == 0 {
            if let Some(byte) = self.outbuf {
                match self.stream.write(&[byte]) {
                    Ok(1) => {
                        self.outbuf = None;
                        self.raise_write_interrupt(ctx);
                    }
                    Ok(_) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => tracing::warn!("TTY: write to console stream failed: {err}"),
                }
            }
        }

        if self.inbuf.is_none() && ctx.input.check(self.stream.as_raw_fd()) {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(1) => {
                    self.inbuf = Some(byte[0]);
                    self.raise_read_interrupt(ctx);
                }
                Ok(_) => {} // peer closed, keep polling
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => tracing::warn!("TTY: read from console stream failed: {err}"),
            }
        }

        if self.rirq_pending || (self.wirq_pending && self.wirq_enabled) {
            if let Some(line) = info.irq {
                ctx.raise_hw_irq(self.irq_cpu, line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn test_tty() -> (Tty, UnixStream) {
        let (near, far) = UnixStream::pair().unwrap();
        let tty = Tty {
            stream: Stream::Unix(near),
            send_delay: 0,
            inbuf: None,
            outbuf: None,
            rirq_pending: false,
            wirq_pending: false,
            wirq_enabled: true,
            error: 0,
            irq_cpu: 0,
        };
        (tty, far)
    }

    #[test]
    fn test_status_reflects_buffers() {
        let (mut tty, _far) = test_tty();
        assert_eq!(tty.io_read(PORT_STATUS), STATUS_WIRQ_ENABLED);

        tty.inbuf = Some(b'x');
        tty.io_write(PORT_DATA, b'y' as u32);
        let status = tty.io_read(PORT_STATUS);
        assert_eq!(status & STATUS_RAVAIL, STATUS_RAVAIL);
        assert_eq!(status & STATUS_WBUSY, STATUS_WBUSY);
    }

    #[test]
    fn test_data_read_consumes_input() {
        let (mut tty, _far) = test_tty();
        tty.inbuf = Some(0x41);
        assert_eq!(tty.io_read(PORT_DATA), 0x41);
        assert_eq!(tty.io_read(PORT_DATA), 0);
        assert_eq!(tty.io_read(PORT_STATUS) & STATUS_RAVAIL, 0);
    }

    #[test]
    fn test_full_output_slot_drops_writes() {
        let (mut tty, _far) = test_tty();
        tty.io_write(PORT_DATA, b'a' as u32);
        tty.io_write(PORT_DATA, b'b' as u32);
        assert_eq!(tty.outbuf, Some(b'a'));
    }

    #[test]
    fn test_commands() {
        let (mut tty, _far) = test_tty();
        tty.rirq_pending = true;
        tty.wirq_pending = true;

        tty.io_write(PORT_COMMAND, COMMAND_RESET_READ_IRQ);
        assert!(!tty.rirq_pending);
        tty.io_write(PORT_COMMAND, COMMAND_RESET_WRITE_IRQ);
        assert!(!tty.wirq_pending);
        tty.io_write(PORT_COMMAND, COMMAND_DISABLE_WIRQ);
        assert!(!tty.wirq_enabled);
        tty.io_write(PORT_COMMAND, COMMAND_ENABLE_WIRQ);
        assert!(tty.wirq_enabled);
        assert_eq!(tty.error, 0);

        tty.io_write(PORT_COMMAND, 0x99);
        assert_eq!(tty.io_read(PORT_STATUS) & ERROR_ICOMM, ERROR_ICOMM);
    }
}
