//! Network interface over UDP multicast or unix-domain datagram sockets.
//!
//! The simulated network is a broadcast medium: every frame is MTU bytes,
//! the first word is the destination hardware address and the second the
//! source, both in network byte order. On PF_INET the medium is a
//! multicast group; on PF_UNIX it is a directory of datagram sockets, and
//! sending enumerates every socket file in the directory.
//!
//! Frames are accepted when promiscuous mode is on, the destination
//! matches our address, or it is the broadcast address `0xffffffff`.
//! Socket polling and event completion are gated to every 4096th cycle.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use rand::Rng;

use super::{Device, DeviceInfo, DeviceKind, IoCtx, TickCtx, TYPECODE_NIC};

pub const PORT_STATUS: u32 = 0x00;
pub const PORT_COMMAND: u32 = 0x04;
pub const PORT_HWADDR: u32 = 0x08;
pub const PORT_MTU: u32 = 0x0c;
pub const PORT_DMAADDR: u32 = 0x10;

pub const COMMAND_RECEIVE: u32 = 0x01;
pub const COMMAND_SEND: u32 = 0x02;
pub const COMMAND_CLEAR_RXIRQ: u32 = 0x03;
pub const COMMAND_CLEAR_RIRQ: u32 = 0x04;
pub const COMMAND_CLEAR_SIRQ: u32 = 0x05;
pub const COMMAND_CLEAR_RXBUSY: u32 = 0x06;
pub const COMMAND_ENTER_PROMISC: u32 = 0x07;
pub const COMMAND_EXIT_PROMISC: u32 = 0x08;

pub const STATUS_RXBUSY: u32 = 1 << 0;
pub const STATUS_RBUSY: u32 = 1 << 1;
pub const STATUS_SBUSY: u32 = 1 << 2;
pub const STATUS_RXIRQ: u32 = 1 << 3;
pub const STATUS_RIRQ: u32 = 1 << 4;
pub const STATUS_SIRQ: u32 = 1 << 5;
pub const STATUS_PROMISC: u32 = 1 << 6;
pub const STATUS_NOFRAME: u32 = 0x0800_0000;
pub const STATUS_IADDR: u32 = 0x1000_0000;
pub const STATUS_ICOMM: u32 = 0x2000_0000;
pub const STATUS_EBUSY: u32 = 0x4000_0000;
pub const STATUS_ERROR: u32 = 0x8000_0000;

const STATUS_IRQ_MASK: u32 = STATUS_RXIRQ | STATUS_RIRQ | STATUS_SIRQ;

/// Default IRQ line when the configuration names none.
pub const IRQ_NIC: u32 = 3;

const IO_LENGTH: u32 = 20;

/// "Never" marker for the absolute event cycles.
const NEVER: u64 = u64::MAX;

/// Cycle-count gate for socket polling: only when the low 12 bits of the
/// counter are zero.
const POLL_GATE: u64 = 0xfff;

/// The broadcast socket under the NIC.
pub enum NicSocket {
    Inet {
        sock: UdpSocket,
        multicast: SocketAddrV4,
    },
    Unix {
        sock: UnixDatagram,
        dir: PathBuf,
    },
}

impl NicSocket {
    /// Join an IPv4 multicast group on `port` and listen non-blocking.
    pub fn open_inet(group: Ipv4Addr, port: u16) -> io::Result<NicSocket> {
        let sock = udp_socket_reuseaddr(port)?;
        sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        sock.set_nonblocking(true)?;
        Ok(NicSocket::Inet {
            sock,
            multicast: SocketAddrV4::new(group, port),
        })
    }

    /// Bind a unix datagram socket; the network is the socket's directory.
    pub fn open_unix(path: &str) -> io::Result<NicSocket> {
        let _ = std::fs::remove_file(path);
        let sock = UnixDatagram::bind(path)?;
        sock.set_nonblocking(true)?;
        let dir = PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(NicSocket::Unix { sock, dir })
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NicSocket::Inet { sock, .. } => sock.recv(buf),
            NicSocket::Unix { sock, .. } => sock.recv(buf),
        }
    }

    /// Broadcast one frame to the medium.
    fn send(&self, buf: &[u8]) -> io::Result<()> {
        match self {
            NicSocket::Inet { sock, multicast } => {
                sock.send_to(buf, *multicast).map(|_| ())
            }
            NicSocket::Unix { sock, dir } => {
                for entry in std::fs::read_dir(dir)? {
                    let entry = entry?;
                    let is_socket = entry
                        .file_type()
                        .map(|t| t.is_socket())
                        .unwrap_or(false);
                    if is_socket {
                        // Dead peers and TTY sockets may live here too.
                        if let Err(err) = sock.send_to(buf, entry.path()) {
                            tracing::debug!(
                                "NIC: send to {:?} failed: {err}",
                                entry.path()
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

/// SO_REUSEADDR must be set before bind so several simulators can share
/// one multicast port; std's UdpSocket cannot, so build the socket raw.
fn udp_socket_reuseaddr(port: u16) -> io::Result<UdpSocket> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let yes: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &yes as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(UdpSocket::from_raw_fd(fd))
    }
}

pub struct Nic {
    sock: NicSocket,
    mtu: u32,
    /// Hardware address in network byte order, as it appears on the wire.
    hwaddr: [u8; 4],
    /// Delivery probability in percent.
    reliability: u32,
    /// DMA and send latencies in cycles.
    dma_delay: u64,
    send_delay: u64,

    dma_addr: u32,
    status: u32,
    recv_buffer: Vec<u8>,
    send_buffer: Vec<u8>,
    /// Absolute completion cycles, or NEVER.
    send_event: u64,
    recv_event: u64,
    irq_cpu: usize,
}

/// Errors surfaced while creating the NIC from its configuration.
#[derive(Debug, thiserror::Error)]
pub enum NicError {
    #[error("MTU {0} is too small (minimum 10)")]
    BadMtu(u32),
    #[error("hardware address {0:#010x} is reserved")]
    ReservedHwAddr(u32),
    #[error("reliability {0} is not a percentage")]
    BadReliability(u32),
    #[error("socket setup failed: {0}")]
    Socket(#[from] io::Error),
}

impl Nic {
    /// Build the device. `hwaddr` 0 and `0xffffffff` are reserved for the
    /// network itself and broadcast; delays are in milliseconds.
    pub fn device(
        sock: NicSocket,
        mtu: u32,
        hwaddr: u32,
        reliability: u32,
        dma_delay_ms: u32,
        send_delay_ms: u32,
        clockspeed: u32,
    ) -> Result<Device, NicError> {
        if mtu < 10 {
            return Err(NicError::BadMtu(mtu));
        }
        if hwaddr == 0 || hwaddr == 0xffff_ffff {
            return Err(NicError::ReservedHwAddr(hwaddr));
        }
        if reliability > 100 {
            return Err(NicError::BadReliability(reliability));
        }
        let ms_to_cycles = |ms: u32| clockspeed as u64 / 1000 * ms as u64;
        Ok(Device {
            info: DeviceInfo::new(TYPECODE_NIC, b"NIC-FAKE", Some(IRQ_NIC), IO_LENGTH),
            kind: DeviceKind::Nic(Nic {
                sock,
                mtu,
                hwaddr: hwaddr.to_be_bytes(),
                reliability,
                dma_delay: ms_to_cycles(dma_delay_ms),
                send_delay: ms_to_cycles(send_delay_ms),
                dma_addr: 0xffff_ffff,
                status: 0,
                recv_buffer: vec![0; mtu as usize],
                send_buffer: vec![0; mtu as usize],
                send_event: NEVER,
                recv_event: NEVER,
                irq_cpu: 0,
            }),
        })
    }

    fn dma_range_ok(&self, ctx: &IoCtx) -> bool {
        self.dma_addr.wrapping_add(self.mtu) < ctx.mem.size()
    }

    fn select_irq_cpu(status: u32, irq_cpu: &mut usize, ctx: &mut TickCtx) {
        if status & STATUS_IRQ_MASK == 0 {
            *irq_cpu = ctx.irq.select();
        }
    }

    pub fn io_read(&mut self, port: u32) -> u32 {
        match port {
            PORT_STATUS => self.status,
            PORT_HWADDR => u32::from_be_bytes(self.hwaddr),
            PORT_MTU => self.mtu,
            _ => 0,
        }
    }

    pub fn io_write(&mut self, port: u32, word: u32, ctx: &mut IoCtx) {
        match port {
            PORT_COMMAND => {
                // Clear errors from previous commands; ERROR is sticky.
                self.status &= 0x87ff_ffff;
                match word {
                    COMMAND_RECEIVE => {
                        if !self.dma_range_ok(ctx) {
                            self.status |= STATUS_IADDR;
                            return;
                        }
                        if self.status & STATUS_RXBUSY == 0 {
                            self.status |= STATUS_NOFRAME;
                            return;
                        }
                        if self.status & STATUS_RBUSY != 0 {
                            self.status |= STATUS_EBUSY;
                            return;
                        }
                        self.status |= STATUS_RBUSY;
                        // dma_range_ok bounds-checked the transfer.
                        let _ = ctx.mem.store_direct(self.dma_addr, &self.recv_buffer);
                        self.recv_event = ctx.cycle + self.dma_delay;
                    }
                    COMMAND_SEND => {
                        if !self.dma_range_ok(ctx) {
                            self.status |= STATUS_IADDR;
                            return;
                        }
                        if self.status & STATUS_SBUSY != 0 {
                            self.status |= STATUS_EBUSY;
                            return;
                        }
                        self.status |= STATUS_SBUSY;
                        let _ = ctx.mem.read_direct(self.dma_addr, &mut self.send_buffer);
                        // A still-pending send pushes this one out.
                        if self.send_event != NEVER {
                            self.send_event += self.dma_delay;
                        } else {
                            self.send_event = ctx.cycle + self.dma_delay;
                        }
                    }
                    COMMAND_CLEAR_RXIRQ => self.status &= !STATUS_RXIRQ,
                    COMMAND_CLEAR_RIRQ => self.status &= !STATUS_RIRQ,
                    COMMAND_CLEAR_SIRQ => self.status &= !STATUS_SIRQ,
                    COMMAND_CLEAR_RXBUSY => self.status &= !STATUS_RXBUSY,
                    COMMAND_ENTER_PROMISC => self.status |= STATUS_PROMISC,
                    COMMAND_EXIT_PROMISC => self.status &= !STATUS_PROMISC,
                    _ => self.status |= STATUS_ICOMM,
                }
            }
            PORT_DMAADDR => self.dma_addr = word,
            _ => {}
        }
    }

    /// Does the frame sitting in `recv_buffer` belong to us?
    fn frame_accepted(&self) -> bool {
        if self.status & STATUS_PROMISC != 0 {
            return true;
        }
        let dest = &self.recv_buffer[0..4];
        dest == self.hwaddr || dest == [0xff, 0xff, 0xff, 0xff]
    }

    pub fn update(&mut self, info: &DeviceInfo, ctx: &mut TickCtx) {
        if ctx.cycle & POLL_GATE == 0 {
            if self.status & STATUS_RXBUSY == 0 {
                match self.sock.recv(&mut self.recv_buffer) {
                    Ok(_) => {
                        if self.frame_accepted() {
                            self.status |= STATUS_RXBUSY;
                            Self::select_irq_cpu(self.status, &mut self.irq_cpu, ctx);
                            self.status |= STATUS_RXIRQ;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => tracing::debug!("NIC: receive poll failed: {err}"),
                }
            }

            if self.recv_event <= ctx.cycle {
                // DMA from the receive buffer has completed.
                self.status &= !STATUS_RBUSY;
                Self::select_irq_cpu(self.status, &mut self.irq_cpu, ctx);
                self.status |= STATUS_RIRQ;
                self.recv_event = NEVER;
            }

            if self.send_event <= ctx.cycle {
                if self.status & STATUS_SBUSY != 0 {
                    // DMA into the send buffer done: put the frame on the
                    // wire, minus the configured unreliability.
                    self.send_buffer[4..8].copy_from_slice(&self.hwaddr);
                    if rand::thread_rng().gen_range(0..100) <= self.reliability {
                        if let Err(err) = self.sock.send(&self.send_buffer) {
                            tracing::warn!("NIC: send failed: {err}");
                            self.status |= STATUS_ERROR;
                        }
                    }
                    self.status &= !STATUS_SBUSY;
                    Self::select_irq_cpu(self.status, &mut self.irq_cpu, ctx);
                    self.status |= STATUS_SIRQ;
                    self.send_event = ctx.cycle + self.send_delay;
                } else {
                    // Send-delay tail elapsed.
                    self.send_event = NEVER;
                }
            }
        }

        if self.status & STATUS_IRQ_MASK != 0 {
            if let Some(line) = info.irq {
                ctx.raise_hw_irq(self.irq_cpu, line);
            }
        }
    }
}
