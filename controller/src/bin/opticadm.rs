// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use itertools::Itertools;
use optic_controller::server;
use optic_controller::sim::SimulatedBridge;
use optic_controller::ConfigBuilder;
use optic_controller::DeviceId;
use optic_controller::Family;
use optic_controller::ProtocolRouter;
use optic_messages::parse_hex_bytes;
use optic_messages::parse_hex_u8;
use optic_messages::GpioStatus;
use optic_messages::PageId;
use slog::info;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::net::SocketAddr;
use std::time::Duration;
use tabled::settings::Style;
use tabled::Table;
use tabled::Tabled;

fn parse_log_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|_| String::from("invalid log level"))
}

fn parse_table(s: &str) -> Result<u8, String> {
    parse_hex_u8("table", s).map_err(|e| e.to_string())
}

fn parse_offset(s: &str) -> Result<u8, String> {
    parse_hex_u8("offset", s).map_err(|e| e.to_string())
}

/// Read and write the memory of pluggable optical transceivers.
///
/// Modules are reached through USB bridges that carry I2C or MDIO. Accesses
/// of up to a page are split into transactions the bridge can carry, with the
/// bridge's settling delay observed between them.
#[derive(Parser)]
#[command(version, about, long_about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,

    /// The addressing family of the bridges to drive.
    #[arg(short, long, value_enum, default_value_t = Family::DirectAddress)]
    family: Family,

    /// The device to address, as "<adapter-name> <index>".
    ///
    /// The default is the first device with a module plugged in.
    #[arg(short, long)]
    device: Option<String>,

    /// The number of simulated bridges to attach.
    #[arg(long, default_value_t = 1)]
    sim_bridges: u32,

    /// The number of devices on each simulated bridge.
    #[arg(long, default_value_t = 1)]
    sim_devices: u32,

    /// The largest read transaction, in transfer units.
    #[arg(
        long,
        value_parser = clap::value_parser!(u16).range(1..=256)
    )]
    read_chunk: Option<u16>,

    /// The largest write transaction, in transfer units.
    #[arg(
        long,
        value_parser = clap::value_parser!(u16).range(1..=256)
    )]
    write_chunk: Option<u16>,

    /// The delay after each transaction, in milliseconds.
    ///
    /// The default is the delay the bridge declares.
    #[arg(long)]
    delay: Option<u64>,

    /// The bus clock, in Hz.
    #[arg(long)]
    bit_rate: Option<u32>,

    /// The log-level.
    #[arg(
        short,
        long,
        default_value_t = Level::Info,
        value_parser = parse_log_level
    )]
    log_level: Level,
}

#[derive(Subcommand)]
enum Cmd {
    /// List the devices on every bridge of the selected family.
    Search,

    /// Decode the identifier byte of the addressed module.
    Identify,

    /// Read bytes from a table of the addressed module.
    Read {
        /// The table address, in hex.
        #[arg(value_parser = parse_table)]
        table: u8,
        /// The starting offset, in hex.
        #[arg(value_parser = parse_offset)]
        offset: u8,
        /// The number of bytes to read.
        len: u16,
    },

    /// Read a whole page, such as "A0" or "A0_3T".
    Page {
        page: PageId,
        /// Select the upper page before reading it.
        #[arg(long)]
        paged: bool,
    },

    /// Write bytes to a table of the addressed module.
    Write {
        /// The table address, in hex.
        #[arg(value_parser = parse_table)]
        table: u8,
        /// The starting offset, in hex.
        #[arg(value_parser = parse_offset)]
        offset: u8,
        /// The bytes to write, in hex.
        data: String,
    },

    /// Report the module status lines of the addressed device.
    Gpio,

    /// Serve the HTTP interface.
    Serve {
        /// The address on which to listen.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, args.log_level).fuse();
    let log = Logger::root(drain, slog::o!());

    let mut builder = ConfigBuilder::new().family(args.family);
    if let Some(units) = args.read_chunk {
        builder = builder.read_chunk(units);
    }
    if let Some(units) = args.write_chunk {
        builder = builder.write_chunk(units);
    }
    if let Some(ms) = args.delay {
        builder = builder.settle_delay(Duration::from_millis(ms));
    }
    if let Some(bit_rate) = args.bit_rate {
        builder = builder.bit_rate(bit_rate);
    }
    if let Cmd::Serve {
        listen: Some(listen),
    } = &args.cmd
    {
        builder = builder.listen(*listen);
    }
    let config = builder.build()?;
    let listen = config.listen;

    let mut router = ProtocolRouter::new(config, log.clone());
    for i in 0..args.sim_bridges {
        router.register(
            SimulatedBridge::new(format!("SIM{i}"), args.family)
                .with_devices(args.sim_devices)
                .with_gpio(vec![0; 3]),
        );
    }

    match args.cmd {
        Cmd::Search => print_devices(router.search()),
        Cmd::Serve { .. } => serve(router, listen, &log).await?,
        Cmd::Identify => {
            let device = address(&mut router, args.device.as_deref(), &log)?;
            let ident = router.identify()?;
            match ident.part_type() {
                Some(part) => println!("{device}: {ident} ({part:?})"),
                None => println!("{device}: {ident}"),
            }
        }
        Cmd::Read { table, offset, len } => {
            address(&mut router, args.device.as_deref(), &log)?;
            let data = router.read_all(table, len, offset)?;
            print_read_data(table, offset, &data);
        }
        Cmd::Page { page, paged } => {
            address(&mut router, args.device.as_deref(), &log)?;
            let data = router.read_page(page, paged)?;
            print_read_data(page.address, 0, &data);
        }
        Cmd::Write {
            table,
            offset,
            data,
        } => {
            let data = parse_hex_bytes("data", &data)?;
            address(&mut router, args.device.as_deref(), &log)?;
            if !router.write(table, offset, &data)? {
                anyhow::bail!("no data to write");
            }
            println!("wrote {} bytes to 0x{table:02x} at 0x{offset:02x}", data.len());
        }
        Cmd::Gpio => {
            address(&mut router, args.device.as_deref(), &log)?;
            print_gpio(router.gpio()?);
        }
    }
    Ok(())
}

// Select the named device, or the first one with a module plugged in.
fn address(
    router: &mut ProtocolRouter,
    device: Option<&str>,
    log: &Logger,
) -> anyhow::Result<DeviceId> {
    let device = match device {
        Some(device) => {
            let id: DeviceId = device.parse()?;
            router.select_device(id.clone())?;
            id
        }
        None => router
            .deduce_device()?
            .context("no device with a module plugged in was found")?,
    };
    info!(log, "addressing device"; "device" => %device);
    Ok(device)
}

async fn serve(router: ProtocolRouter, listen: SocketAddr, log: &Logger) -> anyhow::Result<()> {
    let server = server::spawn(router, listen, log).await?;
    let interrupted = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to wait for interrupt")?;
            true
        }
        _ = server.stopped() => false,
    };
    if interrupted {
        info!(log, "interrupted, shutting down");
    }
    server.shutdown().await;
    Ok(())
}

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "Adapter")]
    adapter: String,
    #[tabled(rename = "Index")]
    index: u32,
    #[tabled(rename = "Device")]
    device: String,
}

fn print_devices(devices: Vec<DeviceId>) {
    let rows = devices.into_iter().map(|id| DeviceRow {
        device: id.to_string(),
        adapter: id.adapter,
        index: id.index,
    });
    println!("{}", Table::new(rows).with(Style::blank()));
}

// Bytes per line of a hex dump.
const WIDTH: usize = 16;

fn print_read_data(table: u8, offset: u8, data: &[u8]) {
    for (i, line) in data.chunks(WIDTH).enumerate() {
        let at = usize::from(offset) + i * WIDTH;
        let hex_data = line.iter().map(|byte| format!("{byte:02x}")).join(" ");
        println!("0x{table:02x}:0x{at:02x}  {hex_data}");
    }
}

#[derive(Tabled)]
struct GpioRow {
    #[tabled(rename = "Line")]
    line: &'static str,
    #[tabled(rename = "Asserted")]
    asserted: bool,
}

fn print_gpio(status: GpioStatus) {
    let rows = GpioStatus::all().iter_names().map(|(line, flag)| GpioRow {
        line,
        asserted: status.contains(flag),
    });
    println!("{}", Table::new(rows).with(Style::blank()));
}
