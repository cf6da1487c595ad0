use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use xbarctl::crossbar::{ActiveMap, Crossbar, CrossbarStatus};
use xbarctl::ipmi::{Ipmitool, TerminalMode, amc_slot_address};
use xbarctl::transport::{Exchange, RegisterTransport};
use xbarctl::txenable::parse_tx_flags;

const SERIAL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(
    name = "xbarctl",
    about = "Clock crosspoint crossbar configuration over IPMI"
)]
struct Args {
    #[command(flatten)]
    link: LinkArgs,

    /// Log every step and failed attempt
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct LinkArgs {
    /// Serial port of a BMC in IPMI terminal mode. Without it, ipmitool is used.
    #[arg(
        long,
        value_name = "PORT",
        env = "XBARCTL_SERIAL",
        conflicts_with_all = ["host", "user", "password", "interface", "slot", "target", "channel"]
    )]
    serial: Option<String>,

    /// Terminal mode baud rate
    #[arg(
        long,
        value_name = "BAUD",
        env = "XBARCTL_BAUD",
        default_value_t = 115_200u32
    )]
    baud: u32,

    /// Remote MCH/shelf manager host (ipmitool -H)
    #[arg(long, env = "XBARCTL_HOST")]
    host: Option<String>,

    /// IPMI user (ipmitool -U)
    #[arg(long, env = "XBARCTL_USER")]
    user: Option<String>,

    /// IPMI password, passed to ipmitool through its environment
    #[arg(long, env = "XBARCTL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// ipmitool interface (lan, lanplus, open, ...)
    #[arg(long, env = "XBARCTL_INTERFACE")]
    interface: Option<String>,

    /// AMC slot of the board (1..=12)
    #[arg(long, env = "XBARCTL_SLOT", conflicts_with = "target")]
    slot: Option<u8>,

    /// IPMB address of the board, for boards outside an AMC slot
    #[arg(long, value_parser = parse_byte, env = "XBARCTL_TARGET")]
    target: Option<u8>,

    /// Bridge channel (ipmitool -b)
    #[arg(long, env = "XBARCTL_CHANNEL")]
    channel: Option<u8>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reset the crossbar, load both maps, select one and enable outputs
    Configure {
        /// Output enable mask, bit i enables output i (hex, 0b binary or decimal)
        #[arg(long, value_parser = parse_tx_flags, default_value = "0xFFFF")]
        tx_enable: u16,

        /// Map 0: 16 hex digits, digit i selecting the input of output i
        #[arg(long, value_name = "HEX16")]
        map0: String,

        /// Map 1: 16 hex digits
        #[arg(long, value_name = "HEX16")]
        map1: String,

        /// Map driving the outputs after commit (0 or 1)
        #[arg(long, default_value_t = 0)]
        active_map: u8,
    },
    /// Read back both maps, the active map and the TX state of every output
    Status,
    /// Read one crossbar register
    Read {
        #[arg(value_parser = parse_byte)]
        register: u8,
    },
    /// Write one crossbar register
    Write {
        #[arg(value_parser = parse_byte)]
        register: u8,
        #[arg(value_parser = parse_byte)]
        value: u8,
    },
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or(s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("{s:?} is not a byte: {e}"))
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open_link(link: &LinkArgs) -> Result<Box<dyn Exchange>> {
    if let Some(path) = &link.serial {
        info!("Using IPMI terminal mode on {} at {} baud", path, link.baud);
        let term = TerminalMode::open(path, link.baud, SERIAL_TIMEOUT)
            .with_context(|| format!("Failed to open serial port {path}"))?;
        return Ok(Box::new(term));
    }

    let target = match (link.slot, link.target) {
        (Some(slot), _) => match amc_slot_address(slot) {
            Some(addr) => Some(addr),
            None => bail!("AMC slot must be 1..=12, got {slot}"),
        },
        (None, target) => target,
    };

    Ok(Box::new(Ipmitool {
        interface: link.interface.clone(),
        host: link.host.clone(),
        user: link.user.clone(),
        password: link.password.clone(),
        channel: link.channel,
        target,
        ..Ipmitool::new()
    }))
}

fn print_status(status: &CrossbarStatus) {
    let marker = |map: ActiveMap| if status.active_map == map { " (active)" } else { "" };
    println!("map 0: {}{}", status.map0, marker(ActiveMap::Map0));
    println!("map 1: {}{}", status.map1, marker(ActiveMap::Map1));
    if status.active_select > 1 {
        println!("active map register: 0x{:02X}", status.active_select);
    }
    println!();

    let active = match status.active_map {
        ActiveMap::Map0 => &status.map0,
        ActiveMap::Map1 => &status.map1,
    };
    println!("{:>6}  {:>5}  {}", "output", "input", "tx");
    for (output, state) in status.tx_states.iter().enumerate() {
        let input = active.input_for(output).unwrap_or_default();
        println!("{output:>6}  {input:>5}  {state}");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let exchange = open_link(&args.link)?;
    let mut crossbar = Crossbar::new(RegisterTransport::new(exchange));

    match args.command {
        Command::Configure {
            tx_enable,
            map0,
            map1,
            active_map,
        } => {
            crossbar
                .configure_from_hex(tx_enable, &map0, &map1, active_map)
                .context("Crossbar configuration failed")?;
            println!("Crossbar configured.");
        }
        Command::Status => {
            let status = crossbar
                .read_config()
                .context("Failed to read crossbar configuration")?;
            print_status(&status);
        }
        Command::Read { register } => {
            let value = crossbar
                .transport_mut()
                .read_register(register)
                .with_context(|| format!("Failed to read register 0x{register:02X}"))?;
            println!("0x{register:02X}: 0x{value:02X}");
        }
        Command::Write { register, value } => {
            crossbar
                .transport_mut()
                .write_register(register, value)
                .with_context(|| format!("Failed to write register 0x{register:02X}"))?;
            println!("0x{register:02X} <- 0x{value:02X}");
        }
    }

    Ok(())
}
