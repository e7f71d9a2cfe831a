/*
 * Board Discovery Tool
 *
 * Scans the configured device directory for serial devices that answer the
 * detect probe, and prints what was found: the addressable context (MCU or
 * SoC) and the board serial number.
 *
 * Probing writes a single byte to every matching device. Do not run this
 * while another process holds the board: a second reader desynchronizes the
 * half-duplex wire.
 */

use anyhow::{Context, Result};
use boardlink::{CommError, Communicator, SerialConnection, Settings};

fn main() -> Result<()> {
    env_logger::init();

    // Optional arguments: [serial-filter] [device-dir]
    let mut args = std::env::args().skip(1);
    let serial_filter: u32 = match args.next() {
        Some(raw) => parse_serial(&raw).context("Invalid serial filter")?,
        None => 0,
    };
    let mut settings = Settings::new(None).context("Failed to load settings")?;
    if let Some(dir) = args.next() {
        settings.device_dir = dir;
    }

    println!(
        "Scanning '{}' for devices matching /{}/ ...",
        settings.device_dir, settings.device_pattern
    );

    let mut comm = Communicator::new(SerialConnection::new(), settings);
    let found = comm.init(serial_filter).context("Device scan failed")?;

    if !found {
        return Err(CommError::NoBoardFound.into());
    }

    println!("Board found ({} context answered the probe).", comm.target());
    let serial = comm.read_serial().context("Failed to read serial number")?;
    let status = comm.read_status().context("Failed to read status flag")?;
    println!("  serial: {:#010x}", serial);
    println!(
        "  status: {:#04x} ({})",
        status,
        if status == 0 { "unconfigured" } else { "configured" }
    );
    Ok(())
}

fn parse_serial(raw: &str) -> Result<u32> {
    let value = if let Some(hex) = raw.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)?
    } else {
        raw.parse()?
    };
    Ok(value)
}
