//! Application definition.

extern crate simplelog;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use phycom_net::{ComConfig, DeviceConnection, SimTime, DEFAULT_TMP_ROOT};

use crate::devices;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    let app = App::new("phycom")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Run example devices attached to a phy of a running simulation.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))
        // empty subcommand
        .subcommand(device_subcommand("empty")
            .display_order(10)
            .about("Connect to the phy and disconnect right away, using up one device slot"))
        // handbrake subcommand
        .subcommand(device_subcommand("handbrake")
            .display_order(11)
            .about("Keep the simulation from running faster than a given ratio of real time")
            .arg(Arg::with_name("poke-period")
                .long("poke-period")
                .takes_value(true)
                .value_name("us")
                .default_value("50000")
                .help("Simulated microseconds between checks of the real time"))
            .arg(Arg::with_name("ratio")
                .long("ratio")
                .short("r")
                .takes_value(true)
                .value_name("ratio")
                .default_value("1.0")
                .help("Maximum simulated time per unit of real time")))
        // time-monitor subcommand
        .subcommand(device_subcommand("time-monitor")
            .display_order(12)
            .about("Report the simulated time reached and the simulation speed")
            .arg(Arg::with_name("interval")
                .long("interval")
                .short("i")
                .takes_value(true)
                .value_name("us")
                .default_value("150000000")
                .help("Simulated microseconds between reports")))
        // pause subcommand
        .subcommand(device_subcommand("pause")
            .display_order(13)
            .about("Stall the simulation at given times until ENTER is pressed")
            .arg(Arg::with_name("times")
                .long("times")
                .short("t")
                .takes_value(true)
                .multiple(true)
                .required(true)
                .value_name("us")
                .help("Simulated times at which to stop, in increasing order")));

    app
}

/// Subcommand with the arguments shared by every device.
fn device_subcommand<'a, 'b>(name: &'a str) -> App<'a, 'b> {
    SubCommand::with_name(name)
        .setting(AppSettings::DisableHelpSubcommand)
        .arg(Arg::with_name("s_id")
            .long("s_id")
            .short("s")
            .takes_value(true)
            .required(true)
            .value_name("sim-id")
            .help("Identifier of the simulation to join"))
        .arg(Arg::with_name("p_id")
            .long("p_id")
            .short("p")
            .takes_value(true)
            .default_value("2G4")
            .value_name("phy-id")
            .help("Identifier of the phy to connect to"))
        .arg(Arg::with_name("device_number")
            .long("device_number")
            .short("d")
            .takes_value(true)
            .required(true)
            .value_name("number")
            .help("Device number as seen by the phy"))
        .arg(Arg::with_name("tmp-root")
            .long("tmp-root")
            .takes_value(true)
            .default_value(DEFAULT_TMP_ROOT)
            .value_name("path")
            .help("Directory under which the communication directory is created"))
}

pub fn init() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs based on specified subcommand.
pub fn start(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("empty", Some(m)) => start_empty(m),
        ("handbrake", Some(m)) => start_handbrake(m),
        ("time-monitor", Some(m)) => start_time_monitor(m),
        ("pause", Some(m)) => start_pause(m),
        _ => Ok(()),
    }
}

fn start_empty(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let mut device = DeviceArgs::from_matches(matches)?.connect()?;
    devices::empty::run(&mut device)
}

fn start_handbrake(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let poke_period: SimTime = parse_arg(matches, "poke-period")?;
    let ratio: f64 = parse_arg(matches, "ratio")?;
    if poke_period == 0 {
        anyhow::bail!("poke period must be greater than 0");
    }
    if !(ratio > 0.) {
        anyhow::bail!("ratio must be greater than 0 (got {})", ratio);
    }
    let mut device = DeviceArgs::from_matches(matches)?.connect()?;
    devices::handbrake::run(&mut device, poke_period, ratio)
}

fn start_time_monitor(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let interval: SimTime = parse_arg(matches, "interval")?;
    if interval == 0 {
        anyhow::bail!("interval must be greater than 0");
    }
    let mut device = DeviceArgs::from_matches(matches)?.connect()?;
    devices::time_monitor::run(&mut device, interval)
}

fn start_pause(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let times = parse_times(matches)?;
    devices::pause::check_ordered(&times)?;
    let mut device = DeviceArgs::from_matches(matches)?.connect()?;
    devices::pause::run(&mut device, &times)
}

/// Where a device connects to.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceArgs {
    pub simulation_id: String,
    pub phy_id: String,
    pub device_number: u32,
    pub tmp_root: PathBuf,
}

impl DeviceArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        Ok(Self {
            simulation_id: matches.value_of("s_id").unwrap_or_default().to_string(),
            phy_id: matches.value_of("p_id").unwrap_or("2G4").to_string(),
            device_number: parse_arg(matches, "device_number")?,
            tmp_root: PathBuf::from(matches.value_of("tmp-root").unwrap_or(DEFAULT_TMP_ROOT)),
        })
    }

    /// Connects to the phy. From here on ctrl-c makes blocking waits
    /// return as if the phy disconnected.
    pub fn connect(&self) -> Result<DeviceConnection> {
        let config = ComConfig::with_tmp_root(&self.tmp_root);
        let cancel = config.cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("failed setting ctrl-c handler")?;

        debug!("connecting...");
        let mut device = DeviceConnection::new_with_config(config);
        device
            .connect(&self.simulation_id, &self.phy_id, self.device_number)
            .with_context(|| {
                format!(
                    "device {} failed connecting to phy {} of simulation {}",
                    self.device_number, self.phy_id, self.simulation_id
                )
            })?;
        Ok(device)
    }
}

fn parse_arg<T>(matches: &ArgMatches, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = matches.value_of(name).unwrap_or_default();
    value
        .parse::<T>()
        .with_context(|| format!("invalid value for {}: {:?}", name, value))
}

fn parse_times(matches: &ArgMatches) -> Result<Vec<SimTime>> {
    let mut times = Vec::new();
    for value in matches.values_of("times").into_iter().flatten() {
        times.push(
            value
                .parse()
                .with_context(|| format!("could not parse time entry {:?}", value))?,
        );
    }
    Ok(times)
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Error)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    if let Err(e) = TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed) {
        debug!("terminal logger not installed: {}", e);
    }
}
