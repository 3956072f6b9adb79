//! Configuration file reader and machine builder.
//!
//! The configuration is declarative: a `[Simulator]` section fixes the
//! clock rate (kHz), memory size (4 KiB pages), CPU count, inter-CPU IRQ
//! line and byte order, and one section per device attaches peripherals:
//!
//! ```text
//! [Simulator]
//! clockspeed 100000
//! memory 1024
//! cpus 1
//! cpuirq 4
//! bigendian
//!
//! [TTY]
//! vendor "TTYCON"
//! irq 2
//! socket unixsocket "/tmp/yams.tty" listen
//!
//! [Disk]
//! vendor "DISK"
//! irq 3
//! filename "store.img"
//! sectorsize 512
//! numsectors 2048
//! numcylinders 128
//! rottime 15
//! seektime 50
//! ```
//!
//! Socket specifications are one of `unixsocket "path" [listen]`,
//! `tcphost "host" port [listen]` and `udphost "addr" port` (NIC
//! multicast). `#` starts a comment. The file is searched for as
//! `--config FILE`, then `./yams.conf`, `$HOME/.yams.conf` and
//! `/etc/yams.conf`.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::bits::Endianness;
use crate::devices::disk::{Disk, DiskError};
use crate::devices::nic::{Nic, NicError, NicSocket};
use crate::devices::sock::Stream;
use crate::devices::tty::Tty;
use crate::devices::DeviceKind;
use crate::machine::Machine;

pub const DEFAULT_CPU_IRQ: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("section \"Simulator\" is missing required option {0}")]
    MissingSimOption(&'static str),
    #[error("[{section}] is missing required option {option}")]
    MissingDeviceOption {
        section: &'static str,
        option: &'static str,
    },
    #[error("invalid IRQ line {0} (must be 0..5)")]
    BadIrq(u32),
}

/// Errors surfaced while turning a parsed configuration into hardware.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("unable to create disk device: {0}")]
    Disk(#[from] DiskError),
    #[error("unable to create nic device: {0}")]
    Nic(#[from] NicError),
    #[error("socket setup failed: {0}")]
    Socket(#[from] std::io::Error),
    #[error("bad multicast address '{0}'")]
    BadMulticastAddr(String),
}

#[derive(Debug, Clone)]
pub struct SimCfg {
    /// Simulated clock rate in kHz.
    pub clockspeed: u32,
    /// Memory size in 4 KiB pages.
    pub memory: u32,
    pub cpus: u32,
    pub cpuirq: u32,
    pub big_endian: bool,
}

#[derive(Debug, Clone)]
pub enum SocketSpec {
    Unix { path: String, listen: bool },
    Tcp { host: String, port: u16, listen: bool },
    Udp { addr: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct DiskCfg {
    pub vendor: Option<String>,
    pub irq: Option<u32>,
    pub filename: String,
    pub sectorsize: u32,
    pub numsectors: u32,
    pub numcylinders: u32,
    pub rottime: u32,
    pub seektime: u32,
}

#[derive(Debug, Clone)]
pub struct TtyCfg {
    pub vendor: Option<String>,
    pub irq: Option<u32>,
    pub socket: SocketSpec,
    pub senddelay: u32,
}

#[derive(Debug, Clone)]
pub struct NicCfg {
    pub vendor: Option<String>,
    pub irq: Option<u32>,
    pub mtu: u32,
    pub mac: u32,
    pub reliability: u32,
    pub dmadelay: u32,
    pub senddelay: u32,
    pub socket: SocketSpec,
}

#[derive(Debug, Clone)]
pub struct PlugCfg {
    pub irq: Option<u32>,
    pub socket: SocketSpec,
    pub async_events: bool,
    pub options: String,
}

#[derive(Debug, Clone)]
pub enum DeviceCfg {
    Disk(DiskCfg),
    Tty(TtyCfg),
    Nic(NicCfg),
    Plugin(PlugCfg),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sim: SimCfg,
    pub devices: Vec<DeviceCfg>,
}

/// Search order: explicit file, `./yams.conf`, `$HOME/.yams.conf`,
/// `/etc/yams.conf`.
pub fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let cwd = PathBuf::from("yams.conf");
    if cwd.exists() {
        return Some(cwd);
    }
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home).join(".yams.conf");
        if home.exists() {
            return Some(home);
        }
    }
    let etc = PathBuf::from("/etc/yams.conf");
    etc.exists().then_some(etc)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Section(String),
    Word(String),
    Str(String),
    Int(u32),
}

struct Lexer {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
}

impl Lexer {
    fn new(text: &str) -> Result<Self, ConfigError> {
        let mut tokens = Vec::new();
        for (number, raw_line) in text.lines().enumerate() {
            let line = number + 1;
            let content = raw_line.split('#').next().unwrap_or("");
            let mut rest = content.trim();
            while !rest.is_empty() {
                if let Some(after) = rest.strip_prefix('[') {
                    let Some(end) = after.find(']') else {
                        return Err(ConfigError::Parse {
                            line,
                            message: "unterminated section header".into(),
                        });
                    };
                    tokens.push((line, Token::Section(after[..end].to_string())));
                    rest = after[end + 1..].trim_start();
                } else if let Some(after) = rest.strip_prefix('"') {
                    let Some(end) = after.find('"') else {
                        return Err(ConfigError::Parse {
                            line,
                            message: "unterminated string".into(),
                        });
                    };
                    tokens.push((line, Token::Str(after[..end].to_string())));
                    rest = after[end + 1..].trim_start();
                } else {
                    let end = rest
                        .find(char::is_whitespace)
                        .unwrap_or(rest.len());
                    let word = &rest[..end];
                    let token = parse_int(word)
                        .map(Token::Int)
                        .unwrap_or_else(|| Token::Word(word.to_ascii_lowercase()));
                    tokens.push((line, token));
                    rest = rest[end..].trim_start();
                }
            }
        }
        Ok(Self { tokens, cursor: 0 })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, token)| token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.cursor.min(self.tokens.len().saturating_sub(1)))
            .map_or(0, |(line, _)| *line)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|(_, token)| token.clone());
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect_int(&mut self, what: &str) -> Result<u32, ConfigError> {
        match self.next() {
            Some(Token::Int(value)) => Ok(value),
            _ => Err(self.error(format!("expected a number for {what}"))),
        }
    }

    fn expect_str(&mut self, what: &str) -> Result<String, ConfigError> {
        match self.next() {
            Some(Token::Str(value)) => Ok(value),
            _ => Err(self.error(format!("expected a quoted string for {what}"))),
        }
    }

    /// Consume `listen` if it is next.
    fn eat_listen(&mut self) -> bool {
        if matches!(self.peek(), Some(Token::Word(word)) if word == "listen") {
            self.cursor += 1;
            true
        } else {
            false
        }
    }
}

/// Numbers are decimal or `0x` hex; `#` is reserved for comments.
fn parse_int(word: &str) -> Option<u32> {
    if let Some(hex) = word.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        word.parse().ok()
    }
}

fn parse_socket(lexer: &mut Lexer) -> Result<SocketSpec, ConfigError> {
    match lexer.next() {
        Some(Token::Word(kind)) if kind == "unixsocket" => {
            let path = lexer.expect_str("unixsocket path")?;
            let listen = lexer.eat_listen();
            Ok(SocketSpec::Unix { path, listen })
        }
        Some(Token::Word(kind)) if kind == "tcphost" => {
            let host = lexer.expect_str("tcphost host")?;
            let port = lexer.expect_int("tcphost port")? as u16;
            let listen = lexer.eat_listen();
            Ok(SocketSpec::Tcp { host, port, listen })
        }
        Some(Token::Word(kind)) if kind == "udphost" => {
            let addr = lexer.expect_str("udphost address")?;
            let port = lexer.expect_int("udphost port")? as u16;
            Ok(SocketSpec::Udp { addr, port })
        }
        _ => Err(lexer.error("expected unixsocket, tcphost or udphost")),
    }
}

fn check_irq(irq: u32) -> Result<u32, ConfigError> {
    if irq > 5 {
        return Err(ConfigError::BadIrq(irq));
    }
    Ok(irq)
}

/// Parse a configuration file.
pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let mut lexer = Lexer::new(text)?;

    let mut clockspeed = None;
    let mut memory = None;
    let mut cpus = None;
    let mut cpuirq = DEFAULT_CPU_IRQ;
    let mut big_endian = true;
    let mut devices = Vec::new();

    while let Some(token) = lexer.next() {
        let Token::Section(section) = token else {
            return Err(lexer.error("expected a [Section] header"));
        };
        match section.to_ascii_lowercase().as_str() {
            "simulator" => {
                while let Some(Token::Word(option)) = lexer.peek().cloned() {
                    lexer.next();
                    match option.as_str() {
                        "clockspeed" => clockspeed = Some(lexer.expect_int("clockspeed")?),
                        "memory" => memory = Some(lexer.expect_int("memory")?),
                        "cpus" => cpus = Some(lexer.expect_int("cpus")?),
                        "cpuirq" => cpuirq = check_irq(lexer.expect_int("cpuirq")?)?,
                        "bigendian" => big_endian = true,
                        "littleendian" => big_endian = false,
                        _ => return Err(lexer.error(format!("unknown option '{option}'"))),
                    }
                }
            }
            "disk" => devices.push(DeviceCfg::Disk(parse_disk(&mut lexer)?)),
            "tty" => devices.push(DeviceCfg::Tty(parse_tty(&mut lexer)?)),
            "nic" => devices.push(DeviceCfg::Nic(parse_nic(&mut lexer)?)),
            "plugin" => devices.push(DeviceCfg::Plugin(parse_plugin(&mut lexer)?)),
            other => {
                return Err(lexer.error(format!("unknown section [{other}]")));
            }
        }
    }

    Ok(Config {
        sim: SimCfg {
            clockspeed: clockspeed.ok_or(ConfigError::MissingSimOption("clockspeed"))?,
            memory: memory.ok_or(ConfigError::MissingSimOption("memory"))?,
            cpus: cpus.ok_or(ConfigError::MissingSimOption("cpus"))?,
            cpuirq,
            big_endian,
        },
        devices,
    })
}

fn parse_disk(lexer: &mut Lexer) -> Result<DiskCfg, ConfigError> {
    let mut vendor = None;
    let mut irq = None;
    let mut filename = None;
    let mut sectorsize = None;
    let mut numsectors = None;
    let mut numcylinders = 1;
    let mut rottime = 0;
    let mut seektime = 0;

    while let Some(Token::Word(option)) = lexer.peek().cloned() {
        lexer.next();
        match option.as_str() {
            "vendor" => vendor = Some(lexer.expect_str("vendor")?),
            "irq" => irq = Some(check_irq(lexer.expect_int("irq")?)?),
            "filename" => filename = Some(lexer.expect_str("filename")?),
            "sectorsize" => sectorsize = Some(lexer.expect_int("sectorsize")?),
            "numsectors" => numsectors = Some(lexer.expect_int("numsectors")?),
            "numcylinders" => numcylinders = lexer.expect_int("numcylinders")?,
            "rottime" => rottime = lexer.expect_int("rottime")?,
            "seektime" => seektime = lexer.expect_int("seektime")?,
            _ => return Err(lexer.error(format!("unknown disk option '{option}'"))),
        }
    }

    Ok(DiskCfg {
        vendor,
        irq,
        filename: filename.ok_or(ConfigError::MissingDeviceOption {
            section: "Disk",
            option: "filename",
        })?,
        sectorsize: sectorsize.ok_or(ConfigError::MissingDeviceOption {
            section: "Disk",
            option: "sectorsize",
        })?,
        numsectors: numsectors.ok_or(ConfigError::MissingDeviceOption {
            section: "Disk",
            option: "numsectors",
        })?,
        numcylinders,
        rottime,
        seektime,
    })
}

fn parse_tty(lexer: &mut Lexer) -> Result<TtyCfg, ConfigError> {
    let mut vendor = None;
    let mut irq = None;
    let mut socket = None;
    let mut senddelay = 0;

    while let Some(Token::Word(option)) = lexer.peek().cloned() {
        lexer.next();
        match option.as_str() {
            "vendor" => vendor = Some(lexer.expect_str("vendor")?),
            "irq" => irq = Some(check_irq(lexer.expect_int("irq")?)?),
            "socket" => socket = Some(parse_socket(lexer)?),
            "senddelay" => senddelay = lexer.expect_int("senddelay")?,
            _ => return Err(lexer.error(format!("unknown tty option '{option}'"))),
        }
    }

    Ok(TtyCfg {
        vendor,
        irq,
        socket: socket.ok_or(ConfigError::MissingDeviceOption {
            section: "TTY",
            option: "socket",
        })?,
        senddelay,
    })
}

fn parse_nic(lexer: &mut Lexer) -> Result<NicCfg, ConfigError> {
    let mut vendor = None;
    let mut irq = None;
    let mut mtu = None;
    let mut mac = None;
    let mut reliability = 100;
    let mut dmadelay = 0;
    let mut senddelay = 0;
    let mut socket = None;

    while let Some(Token::Word(option)) = lexer.peek().cloned() {
        lexer.next();
        match option.as_str() {
            "vendor" => vendor = Some(lexer.expect_str("vendor")?),
            "irq" => irq = Some(check_irq(lexer.expect_int("irq")?)?),
            "mtu" => mtu = Some(lexer.expect_int("mtu")?),
            "mac" => mac = Some(lexer.expect_int("mac")?),
            "reliability" => reliability = lexer.expect_int("reliability")?,
            "dmadelay" => dmadelay = lexer.expect_int("dmadelay")?,
            "senddelay" => senddelay = lexer.expect_int("senddelay")?,
            "socket" => socket = Some(parse_socket(lexer)?),
            _ => return Err(lexer.error(format!("unknown nic option '{option}'"))),
        }
    }

    Ok(NicCfg {
        vendor,
        irq,
        mtu: mtu.ok_or(ConfigError::MissingDeviceOption {
            section: "NIC",
            option: "mtu",
        })?,
        mac: mac.ok_or(ConfigError::MissingDeviceOption {
            section: "NIC",
            option: "mac",
        })?,
        reliability,
        dmadelay,
        senddelay,
        socket: socket.ok_or(ConfigError::MissingDeviceOption {
            section: "NIC",
            option: "socket",
        })?,
    })
}

fn parse_plugin(lexer: &mut Lexer) -> Result<PlugCfg, ConfigError> {
    let mut irq = None;
    let mut socket = None;
    let mut async_events = false;
    let mut options = String::new();

    while let Some(Token::Word(option)) = lexer.peek().cloned() {
        lexer.next();
        match option.as_str() {
            "irq" => irq = Some(check_irq(lexer.expect_int("irq")?)?),
            "socket" => socket = Some(parse_socket(lexer)?),
            "async" => async_events = true,
            "options" => options = lexer.expect_str("options")?,
            "vendor" => {
                // Plugins announce their own vendor tags at INIT.
                let _ = lexer.expect_str("vendor")?;
            }
            _ => return Err(lexer.error(format!("unknown plugin option '{option}'"))),
        }
    }

    Ok(PlugCfg {
        irq,
        socket: socket.ok_or(ConfigError::MissingDeviceOption {
            section: "Plugin",
            option: "socket",
        })?,
        async_events,
        options,
    })
}

/// Create the machine a configuration describes: allocate memory and
/// CPUs, connect every device socket, open disk images and run plugin
/// handshakes. The caller finishes setup with [`Machine::init`] once all
/// extra input descriptors (such as the GDB socket) are registered.
pub fn build_machine(config: &Config) -> Result<Machine, BuildError> {
    let endian = if config.sim.big_endian {
        Endianness::Big
    } else {
        Endianness::Little
    };
    let clockspeed = config.sim.clockspeed * 1000;
    let mut machine = Machine::new(
        config.sim.memory,
        config.sim.cpus,
        clockspeed,
        config.sim.cpuirq,
        endian,
    );

    for device in &config.devices {
        match device {
            DeviceCfg::Disk(cfg) => {
                let mut dev = Disk::device(
                    Path::new(&cfg.filename),
                    cfg.sectorsize,
                    cfg.numsectors,
                    cfg.numcylinders,
                    cfg.rottime,
                    cfg.seektime,
                    clockspeed,
                )?;
                apply_overrides(&mut dev, &cfg.vendor, cfg.irq);
                machine.add_device(dev);
            }
            DeviceCfg::Tty(cfg) => {
                let stream = open_stream("TTY", &cfg.socket)?;
                let mut dev = Tty::device(stream, cfg.senddelay);
                apply_overrides(&mut dev, &cfg.vendor, cfg.irq);
                if let DeviceKind::Tty(tty) = &dev.kind {
                    machine.register_input_fd(tty.poll_fd());
                }
                machine.add_device(dev);
            }
            DeviceCfg::Nic(cfg) => {
                let sock = match &cfg.socket {
                    SocketSpec::Udp { addr, port } => {
                        let group: Ipv4Addr = addr
                            .parse()
                            .map_err(|_| BuildError::BadMulticastAddr(addr.clone()))?;
                        NicSocket::open_inet(group, *port)?
                    }
                    SocketSpec::Unix { path, .. } => NicSocket::open_unix(path)?,
                    SocketSpec::Tcp { .. } => {
                        return Err(BuildError::BadMulticastAddr(
                            "NIC needs udphost or unixsocket".into(),
                        ))
                    }
                };
                let mut dev = Nic::device(
                    sock,
                    cfg.mtu,
                    cfg.mac,
                    cfg.reliability,
                    cfg.dmadelay,
                    cfg.senddelay,
                    clockspeed,
                )?;
                apply_overrides(&mut dev, &cfg.vendor, cfg.irq);
                machine.add_device(dev);
            }
            DeviceCfg::Plugin(cfg) => {
                let stream = open_stream("PLUGIO", &cfg.socket)?;
                machine.add_plug_connection(
                    stream,
                    cfg.async_events,
                    &cfg.options,
                    cfg.irq,
                );
            }
        }
    }

    Ok(machine)
}

fn apply_overrides(dev: &mut crate::devices::Device, vendor: &Option<String>, irq: Option<u32>) {
    if let Some(vendor) = vendor {
        dev.info.set_vendor(vendor);
    }
    if let Some(irq) = irq {
        dev.info.irq = Some(irq);
    }
}

fn open_stream(label: &str, spec: &SocketSpec) -> Result<Stream, BuildError> {
    match spec {
        SocketSpec::Unix { path, listen } => Ok(Stream::open_unix(label, path, *listen)?),
        SocketSpec::Tcp { host, port, listen } => {
            Ok(Stream::open_tcp(label, host, *port, *listen)?)
        }
        SocketSpec::Udp { .. } => Err(BuildError::BadMulticastAddr(
            format!("{label} cannot use udphost"),
        )),
    }
}
