pub mod actions;
pub mod config;

use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Command};

use crate::{api::utils::parse_bus_number, protocol::address::DeviceAddress};
use config::MasterConfig;

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    command().get_matches()
}

fn command() -> Command {
    Command::new("hbus")
        .about("HBUS fieldbus master")
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("Serial port the bus is attached to")
                .value_name("PORT")
                .conflicts_with("simulate"),
        )
        .arg(
            Arg::new("baud-rate")
                .long("baud-rate")
                .help("Serial port baud rate")
                .value_name("BAUD")
                .default_value("100000")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("bus")
                .long("bus")
                .short('b')
                .help("Bus number of this master")
                .value_name("BUS")
                .default_value("0"),
        )
        .arg(
            Arg::new("static")
                .long("static")
                .help("Pre-configured device that is never evicted, as bus:dev (repeatable)")
                .value_name("ADDR")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("search-round-ms")
                .long("search-round-ms")
                .help("Length of a discovery round in milliseconds")
                .value_name("MS")
                .default_value("5000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .help("Run against N simulated devices instead of a serial port")
                .value_name("N")
                .value_parser(clap::value_parser!(u8).range(1..=32)),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .short('l')
                .help("List all available serial ports and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-devices")
                .long("list-devices")
                .help("Wait until the bus is operational, print the devices as JSON and exit")
                .action(clap::ArgAction::SetTrue),
        )
}

/// Build the master configuration from parsed flags.
pub fn build_config(matches: &ArgMatches) -> Result<MasterConfig> {
    let mut config = MasterConfig::default();
    if let Some(port) = matches.get_one::<String>("port") {
        config.port_name = port.clone();
    }
    if let Some(&baud) = matches.get_one::<u32>("baud-rate") {
        config.baud_rate = baud;
    }
    if let Some(bus) = matches.get_one::<String>("bus") {
        config.bus_number = parse_bus_number(bus)?;
    }
    if let Some(&round) = matches.get_one::<u64>("search-round-ms") {
        config.search_round_ms = round;
    }
    if let Some(values) = matches.get_many::<String>("static") {
        for value in values {
            let address: DeviceAddress = value
                .parse()
                .map_err(|err| anyhow!("Invalid static device {value:?}: {err}"))?;
            config.static_devices.push(address);
        }
    }
    Ok(config)
}
