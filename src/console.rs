//! Interactive hardware console.
//!
//! The console owns the machine between runs: it boots kernels, starts
//! and steps the clock, inspects registers, the TLB and memory, plants
//! the hardware breakpoint and raises interrupt lines by hand. Every
//! command has a one-letter alias; numbers are decimal, `0x` hex or
//! `#` hex; file names are quoted. Scripts are just files of console
//! commands executed line by line.

use std::io::{BufRead, Read, Write};
use std::path::Path;
use std::time::Instant;

use crate::bus::{RunState, Width};
use crate::cpu::{self, cp0, disasm};
use crate::gdb::GdbStub;
use crate::loader;
use crate::machine::Machine;
use crate::memory::{map, PAGE_SIZE};

/// Outcome of running a script file.
pub enum SourceOutcome {
    /// The script ran to completion; keep going.
    Continue,
    /// The script could not be read.
    NotFound,
    /// A command asked the simulator to exit with this code.
    Exit(i32),
}

struct HelpEntry {
    command: &'static str,
    alias: &'static str,
    one_line: &'static str,
    long: &'static str,
}

const HELP: &[HelpEntry] = &[
    HelpEntry {
        command: "help [command]",
        alias: "h",
        one_line: "Print help [for command]",
        long: "Prints a summary of available commands.\n\n\
               If a command name is given as an argument, prints help for\n\
               that command.",
    },
    HelpEntry {
        command: "start",
        alias: "s",
        one_line: "Start simulation",
        long: "Starts the simulation loop. While running, the console takes\n\
               no commands; send an interrupt signal (usually CTRL-C) to\n\
               stop the simulation and return to the console. A stopped\n\
               simulation continues with a new start command.",
    },
    HelpEntry {
        command: "step [n]",
        alias: "t",
        one_line: "Step one [or n] clock cycles",
        long: "Runs the simulator for one clock cycle, or for n cycles if a\n\
               numeric argument is given, then drops back to the console.\n\
               CTRL-C forces an early return.",
    },
    HelpEntry {
        command: "break addr",
        alias: "b",
        one_line: "Set breakpoint at addr",
        long: "Sets the hardware breakpoint. When any CPU is about to\n\
               execute the instruction at the given address, the simulator\n\
               drops to the console. Only one breakpoint can be active.",
    },
    HelpEntry {
        command: "unbreak",
        alias: "u",
        one_line: "Unset breakpoint",
        long: "Clears the hardware breakpoint.",
    },
    HelpEntry {
        command: "quit [exitcode]",
        alias: "q",
        one_line: "Quit, optionally with an exit code",
        long: "Exits the simulator. The default exit code is 0; scripted\n\
               tests can pass a code in the range [0,255].",
    },
    HelpEntry {
        command: "interrupt n [cpu]",
        alias: "i",
        one_line: "Raise interrupt line n [on CPU cpu]",
        long: "Raises an interrupt line for one clock cycle; the CPU clears\n\
               it again as part of its timer step. Lines 0 and 1 are the\n\
               software interrupt bits, lines 2..7 the hardware bits. The\n\
               interrupt goes to CPU 0 unless another CPU is named.",
    },
    HelpEntry {
        command: "regdump [cpu]",
        alias: "r",
        one_line: "Print register contents [for CPU n]",
        long: "Prints the CPU and CP0 registers of CPU 0, or of the CPU\n\
               named by the argument.",
    },
    HelpEntry {
        command: "tlbdump [cpu]",
        alias: "",
        one_line: "Print contents of TLB [for CPU n]",
        long: "Prints the translation lookaside buffer of CPU 0, or of the\n\
               CPU named by the argument.",
    },
    HelpEntry {
        command: "regwrite [cpu:]reg v",
        alias: "w",
        one_line: "Write v to register reg [on CPU cpu]",
        long: "Writes a CPU or CP0 register. Register names are the ones\n\
               regdump shows, or rN / cp0rN numeric forms. Prefix the name\n\
               with a CPU number and a colon for CPUs other than 0, e.g.\n\
               regwrite 1:sp 0x00030000",
    },
    HelpEntry {
        command: "memwrite addr \"file\"",
        alias: "l",
        one_line: "Load file into address addr",
        long: "Reads a file and writes it into simulator memory. The\n\
               address is a physical address (relative to 0, not a\n\
               segmented address).",
    },
    HelpEntry {
        command: "memread addr l \"file\"",
        alias: "m",
        one_line: "Write l bytes from addr to file",
        long: "Reads part of simulator memory and writes it to a file. The\n\
               address is a physical address (relative to 0, not a\n\
               segmented address).",
    },
    HelpEntry {
        command: "dump [a|[c:]reg] [w]",
        alias: "d",
        one_line: "Dump memory [start addr] [w words]",
        long: "Prints words of memory with a disassembly. By default 11\n\
               words surrounding CPU 0's program counter are shown, which\n\
               is useful when stepping. The start can be an address or a\n\
               register name (optionally CPU-prefixed) whose contents are\n\
               used as the address.",
    },
    HelpEntry {
        command: "poke addr w",
        alias: "p",
        one_line: "Write word w at address addr",
        long: "Writes one word through address translation in forced\n\
               kernel mode. A poke into the device port window commits\n\
               real device state, exactly as a kernel store would.",
    },
    HelpEntry {
        command: "boot \"file\" [\"args\"]",
        alias: "",
        one_line: "Boot kernel from file [with arguments]",
        long: "Boots a kernel image: loads the file (ELF or flat binary at\n\
               physical 0x00010000), points every CPU at the entry point,\n\
               copies the argument string into the kernel parameter page\n\
               and starts the simulation.",
    },
    HelpEntry {
        command: "source \"file\"",
        alias: "",
        one_line: "Execute console commands from file",
        long: "Runs a script of console commands, one per line.",
    },
    HelpEntry {
        command: "gdb port",
        alias: "",
        one_line: "Wait for a GDB connection on a TCP port",
        long: "Opens the GDB remote serial interface and blocks until a\n\
               debugger connects.",
    },
];

/// One parsed console word.
#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Number(u32),
    Word(String),
    Str(String),
}

fn parse_number(word: &str) -> Option<u32> {
    if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix('#')) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        word.parse().ok()
    }
}

/// Split a command line into words, quoted strings and numbers.
fn tokenize(line: &str) -> Result<Vec<Arg>, String> {
    let mut args = Vec::new();
    let mut rest = line.trim();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('"') {
            let Some(end) = after.find('"') else {
                return Err("unterminated string".into());
            };
            args.push(Arg::Str(after[..end].to_string()));
            rest = after[end + 1..].trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let word = &rest[..end];
            match parse_number(word) {
                Some(number) => args.push(Arg::Number(number)),
                None => args.push(Arg::Word(word.to_string())),
            }
            rest = rest[end..].trim_start();
        }
    }
    Ok(args)
}

/// A register reference, `[cpu:]name`.
enum RegRef {
    Cpu(usize, usize),
    Cp0(usize, usize),
}

fn parse_regref(word: &str) -> Option<RegRef> {
    let (cpu, name) = match word.split_once(':') {
        Some((cpu, name)) => (cpu.parse::<usize>().ok()?, name),
        None => (0, word),
    };
    if let Some(reg) = cpu::register_number(name) {
        return Some(RegRef::Cpu(cpu, reg as usize));
    }
    if let Some(reg) = cp0::register_number(name) {
        return Some(RegRef::Cp0(cpu, reg as usize));
    }
    None
}

pub struct Console {
    pub machine: Machine,
    pub gdb: Option<GdbStub>,
    exit_code: i32,
}

impl Console {
    pub fn new(machine: Machine, gdb: Option<GdbStub>) -> Self {
        Self {
            machine,
            gdb,
            exit_code: 0,
        }
    }

    /// The exit code set by `quit` (or zero).
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Interactive loop; returns the process exit code.
    pub fn run_interactive(&mut self) -> i32 {
        let stdin = std::io::stdin();
        while self.machine.bus.run != RunState::Exit {
            print!("YAMS [{}]> ", self.machine.bus.cycle);
            let _ = std::io::stdout().flush();

            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break, // quit at EOF
                Ok(_) => {}
            }
            self.handle_line(&line);

            if self.machine.bus.run == RunState::Exit {
                break;
            }
        }
        self.exit_code
    }

    /// Run a script of console commands.
    pub fn source(&mut self, path: &Path) -> SourceOutcome {
        let Ok(file) = std::fs::File::open(path) else {
            println!("Can't read file '{}'.", path.display());
            return SourceOutcome::NotFound;
        };
        for line in std::io::BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            self.handle_line(&line);
            if self.machine.bus.run == RunState::Exit {
                return SourceOutcome::Exit(self.exit_code);
            }
        }
        SourceOutcome::Continue
    }

    pub fn handle_line(&mut self, line: &str) {
        let args = match tokenize(line) {
            Ok(args) => args,
            Err(message) => {
                println!("Parse error: {message}");
                return;
            }
        };
        let Some(Arg::Word(command)) = args.first() else {
            if args.first().is_some() {
                println!("Parse error: expected a command");
            }
            return;
        };

        match (command.as_str(), &args[1..]) {
            ("help" | "h", rest) => self.cmd_help(rest),
            ("start" | "s", []) => self.cmd_start(),
            ("step" | "t", []) => self.cmd_step(1),
            ("step" | "t", [Arg::Number(count)]) => self.cmd_step((*count).into()),
            ("break" | "b", [Arg::Number(addr)]) => {
                println!("command_breakpoint: {addr:#010x}");
                self.machine.bus.breakpoint = *addr;
            }
            ("unbreak" | "u", []) => self.machine.bus.breakpoint = 0xffff_ffff,
            ("quit" | "q", []) => self.cmd_quit(0),
            ("quit" | "q", [Arg::Number(code)]) => self.cmd_quit(*code),
            ("interrupt" | "i", [Arg::Number(line)]) => self.cmd_interrupt(*line, 0),
            ("interrupt" | "i", [Arg::Number(line), Arg::Number(cpu)]) => {
                self.cmd_interrupt(*line, *cpu as usize)
            }
            ("regdump" | "r", []) => self.cmd_regdump(0),
            ("regdump" | "r", [Arg::Number(cpu)]) => self.cmd_regdump(*cpu as usize),
            ("tlbdump", []) => self.cmd_tlbdump(0),
            ("tlbdump", [Arg::Number(cpu)]) => self.cmd_tlbdump(*cpu as usize),
            ("regwrite" | "w", [Arg::Word(reg), Arg::Number(value)]) => {
                self.cmd_regwrite(reg, *value)
            }
            ("memwrite" | "l", [Arg::Number(addr), Arg::Str(file)]) => {
                let _ = self.cmd_memwrite(*addr, Path::new(file));
            }
            ("memread" | "m", [Arg::Number(addr), Arg::Number(length), Arg::Str(file)]) => {
                self.cmd_memread(*addr, *length, Path::new(file))
            }
            ("dump" | "d", rest) => self.cmd_dump(rest),
            ("poke" | "p", [Arg::Number(addr), Arg::Number(word)]) => {
                self.cmd_poke(*addr, *word)
            }
            ("boot", [Arg::Str(file)]) => self.cmd_boot(Path::new(file), ""),
            ("boot", [Arg::Str(file), Arg::Str(boot_args)]) => {
                let boot_args = boot_args.clone();
                self.cmd_boot(Path::new(file), &boot_args)
            }
            ("source", [Arg::Str(file)]) => {
                let file = file.clone();
                let _ = self.source(Path::new(&file));
            }
            ("gdb", [Arg::Number(port)]) => match GdbStub::open(*port as u16) {
                Ok(stub) => self.gdb = Some(stub),
                Err(err) => println!("gdb: {err}"),
            },
            _ => println!("Unknown or malformed command; try 'help'."),
        }
    }

    fn cmd_help(&self, args: &[Arg]) {
        match args.first() {
            None => {
                for entry in HELP {
                    println!(
                        "{:<21}  ({:<1})  {}",
                        entry.command, entry.alias, entry.one_line
                    );
                }
            }
            Some(Arg::Word(topic)) => {
                for entry in HELP {
                    if entry.command.starts_with(topic.as_str()) {
                        println!("{}:\n\n{}\n", entry.command, entry.long);
                        return;
                    }
                }
                println!("No help available for '{topic}'");
            }
            Some(_) => println!("No help available"),
        }
    }

    fn cmd_start(&mut self) {
        println!("YAMS running...");
        let _ = std::io::stdout().flush();

        let start_cycle = self.machine.bus.cycle;
        let wall_start = Instant::now();
        self.machine.start(self.gdb.as_mut());
        println!();

        let seconds = wall_start.elapsed().as_secs_f64();
        let cycles = (self.machine.bus.cycle - start_cycle) as f64;
        if seconds > 0.0 && cycles > 0.0 {
            let hz = cycles / seconds;
            println!("    Running time: {seconds:.2} s");
            println!("    Actual performance (average): {:.0} kHz", hz / 1000.0);
            println!(
                "    Simulated second length (average): {:.2} s",
                self.machine.bus.clockspeed as f64 / hz
            );
        }
    }

    fn cmd_step(&mut self, count: u64) {
        self.machine.step(count, self.gdb.as_mut());
    }

    fn cmd_quit(&mut self, code: u32) {
        if code > 255 {
            println!("Exit code out of range [0,255]");
            return;
        }
        self.exit_code = code as i32;
        self.machine.bus.run = RunState::Exit;
    }

    fn cmd_interrupt(&mut self, line: u32, cpu: usize) {
        if line > 7 {
            println!("Interrupt number must be between [0,7]");
            return;
        }
        if cpu >= self.machine.cpus.len() {
            println!("No such processor (CPU {cpu})");
            return;
        }
        self.machine.cpus[cpu].cp0.raise_ip(line);
        if line <= 1 {
            println!("Raised software interrupt line {line}");
        } else {
            println!("Raised hardware interrupt line {}", line - 2);
        }
    }

    fn cmd_regdump(&self, cpu_index: usize) {
        let Some(cpu) = self.machine.cpus.get(cpu_index) else {
            println!("No such processor (CPU {cpu_index})");
            return;
        };

        print!("CPU {cpu_index} - ");
        if cpu.cp0.kernel_mode() {
            print!("In Kernel Mode");
        } else {
            print!("In User Mode");
        }

        // Four columns, walking the register file column-major.
        for i in 0..cpu::NUM_REGS {
            if i % 4 == 0 {
                println!();
            }
            let reg = (i % 4) * (cpu::NUM_REGS / 4 + 1) + i / 4;
            if reg >= 32 {
                print!("   {:<5} = {:08x} ", cpu::REGISTER_NAMES[reg], cpu.regs[reg]);
            } else {
                print!(
                    "{reg:2} {:<5} = {:08x} ",
                    cpu::REGISTER_NAMES[reg], cpu.regs[reg]
                );
            }
        }
        println!("\n");

        print!("CPU {cpu_index} Co-processor 0 registers:");
        for i in 0..cp0::NUM_CP0_REGS {
            if i % 4 == 0 {
                println!();
            }
            let reg = (i % 4) * (cp0::NUM_CP0_REGS / 4) + i / 4;
            print!(
                "{reg:2} {:<6}= {:08x} ",
                cp0::REGISTER_NAMES[reg], cpu.cp0.regs[reg]
            );
        }
        println!();
    }

    fn cmd_tlbdump(&self, cpu_index: usize) {
        let Some(cpu) = self.machine.cpus.get(cpu_index) else {
            println!("No such processor (CPU {cpu_index})");
            return;
        };

        println!("TLB of CPU {cpu_index}:\n");
        println!("Row VADDR    VPN2  G ASID PFN0     C0 D0 V0 PFN1     C1 D1 V1");
        println!("=== ======== ===== = ==== ======== == == == ======== == == ==");
        for (row, entry) in cpu.cp0.tlb.iter().enumerate() {
            println!(
                "{row:2x}: {:08x} {:05x} {} {:04x} {:08x} {:02x} {}  {}  {:08x} {:02x} {}  {}",
                entry.vpn2() << 13,
                entry.vpn2(),
                entry.global() as u32,
                entry.asid(),
                entry.pfn(false),
                entry.cache_attr(false),
                entry.dirty(false) as u32,
                entry.valid(false) as u32,
                entry.pfn(true),
                entry.cache_attr(true),
                entry.dirty(true) as u32,
                entry.valid(true) as u32,
            );
        }
    }

    fn cmd_regwrite(&mut self, reg: &str, value: u32) {
        match parse_regref(reg) {
            Some(RegRef::Cpu(cpu, reg)) => {
                if cpu >= self.machine.cpus.len() {
                    println!("Invalid processor number.");
                    return;
                }
                self.machine.cpus[cpu].write_reg(reg, value);
                // Keep the delay-slot machinery consistent.
                if reg == cpu::PC {
                    self.machine.cpus[cpu].next_pc = value.wrapping_add(4);
                }
            }
            Some(RegRef::Cp0(cpu, reg)) => {
                if cpu >= self.machine.cpus.len() {
                    println!("Invalid processor number.");
                    return;
                }
                self.machine.cpus[cpu].cp0.regs[reg] = value;
            }
            None => println!("Invalid register '{reg}'."),
        }
    }

    fn cmd_memwrite(&mut self, addr: u32, path: &Path) -> Result<(), ()> {
        let Ok(mut file) = std::fs::File::open(path) else {
            println!("Couldn't open file [{}].", path.display());
            return Err(());
        };

        let mut buf = [0u8; PAGE_SIZE as usize];
        let mut addr = addr;
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => {
                    println!("File read error.");
                    return Err(());
                }
            };
            if self.machine.bus.mem.store_direct(addr, &buf[..n]).is_err() {
                println!("Attempt to write outside memory.");
                return Err(());
            }
            addr += n as u32;
        }
        Ok(())
    }

    fn cmd_memread(&mut self, addr: u32, length: u32, path: &Path) {
        let Ok(mut file) = std::fs::File::create(path) else {
            println!("Couldn't open file [{}].", path.display());
            return;
        };

        let mut buf = [0u8; PAGE_SIZE as usize];
        let mut from = addr;
        let end = addr + length;
        while from < end {
            let size = (end - from).min(PAGE_SIZE);
            if self
                .machine
                .bus
                .mem
                .read_direct(from, &mut buf[..size as usize])
                .is_err()
            {
                println!("Attempt to read outside memory.");
                return;
            }
            if file.write_all(&buf[..size as usize]).is_err() {
                println!("File write error.");
                return;
            }
            from += size;
        }
    }

    fn dump_word(&mut self, addr: u32) {
        match self.machine.debug_read(addr, Width::Word) {
            Ok(word) => {
                let ascii: String = word
                    .to_be_bytes()
                    .iter()
                    .map(|&byte| {
                        if (32..127).contains(&byte) {
                            byte as char
                        } else {
                            '.'
                        }
                    })
                    .collect();
                let text = disasm::disassemble(addr, word);

                // Mark the word if a CPU 0 register points at it.
                let marker = (0..=cpu::PC)
                    .rev()
                    .find(|&reg| self.machine.cpus[0].regs[reg] == addr);
                match marker {
                    Some(reg) => println!(
                        "{:>2}=> {addr:08x}: {ascii}  {word:08x}  {text}",
                        cpu::REGISTER_NAMES[reg]
                    ),
                    None => println!("     {addr:08x}: {ascii}  {word:08x}  {text}"),
                }
            }
            Err(exc) => {
                println!("     {addr:08x}: Exception {}", exc.name());
            }
        }
    }

    fn cmd_dump(&mut self, args: &[Arg]) {
        let mut addr = None;
        let mut words = 11u32;

        match args {
            [] => {}
            [Arg::Number(a)] => addr = Some(*a),
            [Arg::Number(a), Arg::Number(w)] => {
                addr = Some(*a);
                words = *w;
            }
            [Arg::Word(reg)] | [Arg::Word(reg), Arg::Number(_)] => {
                if let [_, Arg::Number(w)] = args {
                    words = *w;
                }
                match parse_regref(reg) {
                    Some(RegRef::Cpu(cpu, reg)) if cpu < self.machine.cpus.len() => {
                        addr = Some(self.machine.cpus[cpu].regs[reg]);
                    }
                    Some(RegRef::Cp0(cpu, reg)) if cpu < self.machine.cpus.len() => {
                        addr = Some(self.machine.cpus[cpu].cp0.regs[reg]);
                    }
                    _ => {
                        println!("Invalid CPU or register");
                        return;
                    }
                }
            }
            _ => {
                println!("Unknown or malformed command; try 'help'.");
                return;
            }
        }

        // Default view: the words surrounding CPU 0's program counter.
        let addr = addr.unwrap_or_else(|| {
            let pc = self.machine.cpus[0].regs[cpu::PC];
            if pc.wrapping_sub(20) < pc { pc - 20 } else { 0 }
        });

        for index in 0..words {
            self.dump_word(addr.wrapping_add(index * 4));
        }
    }

    fn cmd_poke(&mut self, addr: u32, word: u32) {
        if let Err(exc) = self.machine.debug_write(addr, Width::Word, word) {
            println!("mem_write() failed, exception {}", exc.name());
        }
    }

    fn cmd_boot(&mut self, path: &Path, args: &str) {
        if args.len() >= map::KERNEL_PARAM_LENGTH as usize - 1 {
            println!("Kernel parameter string too long");
            println!("Boot aborted");
            return;
        }

        println!("Loading image...");
        let entry = match loader::load_image(&mut self.machine, path) {
            Ok(entry) => entry,
            Err(err) => {
                println!("{err}");
                println!("Boot aborted");
                return;
            }
        };

        self.machine.set_boot_entry(entry);
        println!("Kernel boot arguments are: \"{args}\"");
        self.machine.bus.mem.set_kernel_params(args);
        println!(
            "Booting kernel \"{}\" at address #{entry:08x}",
            path.display()
        );
        self.cmd_start();
    }
}
