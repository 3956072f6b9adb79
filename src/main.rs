//! Command line entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use yams::config;
use yams::console::{Console, SourceOutcome};
use yams::gdb::GdbStub;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "yams",
    disable_version_flag = true,
    about = "Yet another machine simulator",
    after_help = "A binary file given after the options is booted \
                  immediately; anything after it becomes the kernel \
                  argument string."
)]
struct Cli {
    /// Read configuration from this file instead of the search path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Read a script of console commands before going to the prompt
    #[arg(short, long, value_name = "FILE")]
    script: Vec<PathBuf>,

    /// Start the GDB remote interface on a TCP port
    #[arg(short, long, value_name = "PORT")]
    gdb: Option<u16>,

    /// Print the version information
    #[arg(short, long)]
    version: bool,

    /// Kernel image to boot, with its arguments
    #[arg(value_name = "BINARY", trailing_var_arg = true)]
    binary: Vec<String>,
}

fn print_version() {
    println!("YAMS - Yet Another Machine Simulator {VERSION}");
    println!();
}

fn run() -> anyhow::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    print_version();
    if cli.version {
        return Ok(0);
    }

    let config_path = config::find_config(cli.config.as_deref())
        .context("unable to find a configuration file")?;
    println!("Reading configuration from '{}'", config_path.display());
    let text = std::fs::read_to_string(&config_path)
        .with_context(|| format!("unable to read {}", config_path.display()))?;
    let parsed = config::parse(&text)
        .with_context(|| format!("error in {}", config_path.display()))?;

    if parsed.sim.big_endian {
        println!("Simulating a big-endian machine.");
    } else {
        println!("Simulating a little-endian machine.");
    }

    // The GDB socket must exist before the input subsystem starts so it
    // can be polled with the device fds.
    let gdb = match cli.gdb {
        Some(port) => Some(GdbStub::open(port).context("cannot open the gdb interface")?),
        None => None,
    };

    let mut machine = config::build_machine(&parsed).context("cannot create the machine")?;
    if let Some(stub) = &gdb {
        machine.register_input_fd(stub.poll_fd());
    }
    machine.init().context("cannot initialize the machine")?;

    let mut console = Console::new(machine, gdb);

    if let Some((binary, args)) = cli.binary.split_first() {
        console.handle_line(&format!("boot \"{}\" \"{}\"", binary, args.join(" ")));
        if console.machine.bus.run == yams::RunState::Exit {
            return Ok(console.exit_code());
        }
    }

    for script in &cli.script {
        match console.source(script) {
            SourceOutcome::NotFound => return Ok(1),
            SourceOutcome::Exit(code) => return Ok(code),
            SourceOutcome::Continue => {}
        }
    }

    Ok(console.run_interactive())
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("yams: {err:#}");
            ExitCode::from(1)
        }
    }
}
