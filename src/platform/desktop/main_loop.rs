use std::{path::PathBuf, str::FromStr};

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use crate::{Simulation, SimulationError, SimulationParams};

use super::{
    headless::{HeadlessHost, RunLimits},
    snapshot::{SnapshotWriter, Viewport},
};

const CARGO_PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

fn config_args<'a, 'b>(subcommand: App<'a, 'b>) -> App<'a, 'b> {
    subcommand
        .arg(
            Arg::with_name("SIMULATION_CONFIG")
                .help("YAML file with simulation parameters, missing keys use the defaults")
                .required(false)
                .index(1),
        )
        .arg(
            Arg::with_name("OVERWRITE_CONFIG_FILE")
                .long("overwrite-config-file")
                .short("c")
                .required(false)
                .takes_value(true)
                .help("YAML file whose keys replace entries of the simulation config"),
        )
}

/// Parses the command line, runs the selected subcommand and returns the process exit code.
pub fn start() -> i32 {
    let matches = App::new("SPH 2D Simulation")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            config_args(SubCommand::with_name("run").about("Run simulation with given config"))
                .arg(
                    Arg::with_name("FRAMES")
                        .long("frames")
                        .short("f")
                        .takes_value(true)
                        .help("Stop simulation after the given number of frames"),
                )
                .arg(
                    Arg::with_name("MAX_SECONDS")
                        .long("max-seconds")
                        .short("s")
                        .takes_value(true)
                        .help("Stop simulation after the given amount of simulated seconds"),
                )
                .arg(
                    Arg::with_name("SNAPSHOT_DIR")
                        .long("snapshot-dir")
                        .short("o")
                        .takes_value(true)
                        .help("Write PNG snapshots of the particles into this directory"),
                )
                .arg(
                    Arg::with_name("SNAPSHOT_EVERY")
                        .long("snapshot-every")
                        .short("e")
                        .takes_value(true)
                        .default_value("100")
                        .help("Frames between two snapshots"),
                )
                .arg(
                    Arg::with_name("STATISTICS_ENABLED")
                        .help("Track performance of individual steps")
                        .short("p")
                        .long("statistics-enabled")
                        .takes_value(false),
                )
                .arg(
                    Arg::with_name("STATISTICS_PATH")
                        .long("statistics-path")
                        .short("w")
                        .takes_value(true)
                        .help("Where to write statistics to"),
                )
                .arg(
                    Arg::with_name("WINDOW")
                        .long("window")
                        .takes_value(false)
                        .help("Show the particles in a window (needs the `window` feature)"),
                ),
        )
        .subcommand(config_args(
            SubCommand::with_name("print-config").about("Print the effective simulation parameters as YAML"),
        ))
        .get_matches();

    init_logging(matches.occurrences_of("v"));

    let result = if let Some(run_matches) = matches.subcommand_matches("run") {
        run(run_matches)
    } else if let Some(print_matches) = matches.subcommand_matches("print-config") {
        print_config(print_matches)
    } else {
        Err(SimulationError::Initialization(String::from("unknown subcommand")))
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{}", e);
            1
        }
    }
}

fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init();
}

fn read_yaml(path: &str) -> Result<serde_yaml::Value, SimulationError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| SimulationError::Initialization(format!("failed reading config file {}: {}", path, e)))?;
    serde_yaml::from_str(&text)
        .map_err(|e| SimulationError::Initialization(format!("failed parsing config file {}: {}", path, e)))
}

/// Replaces entries of `target` with those of `source`. Every key must name a parameter.
fn overwrite_entries(target: &mut serde_yaml::Value, source: serde_yaml::Value, origin: &str) -> Result<(), SimulationError> {
    let source = match source {
        serde_yaml::Value::Null => return Ok(()),
        serde_yaml::Value::Mapping(mapping) => mapping,
        _ => {
            return Err(SimulationError::Initialization(format!(
                "{} must contain a mapping of parameter names to values",
                origin
            )))
        }
    };
    let mapping = target.as_mapping_mut().ok_or_else(|| {
        SimulationError::Initialization(String::from("cannot get simulation parameters as mapping"))
    })?;

    for (k, v) in source.into_iter() {
        match mapping.get_mut(&k) {
            Some(entry) => *entry = v,
            None => {
                return Err(SimulationError::Initialization(format!(
                    "{}: not able to find attribute {:?}",
                    origin, k
                )))
            }
        }
    }
    Ok(())
}

pub fn merge_params(
    config: Option<serde_yaml::Value>,
    overwrite: Option<serde_yaml::Value>,
) -> Result<SimulationParams, SimulationError> {
    let mut params_serde = serde_yaml::to_value(SimulationParams::default())
        .map_err(|e| SimulationError::Initialization(e.to_string()))?;

    if let Some(config) = config {
        overwrite_entries(&mut params_serde, config, "simulation config")?;
    }
    if let Some(overwrite) = overwrite {
        overwrite_entries(&mut params_serde, overwrite, "overwrite config")?;
    }

    serde_yaml::from_value(params_serde)
        .map_err(|e| SimulationError::Initialization(format!("failed to unpack SimulationParams: {}", e)))
}

fn load_params(matches: &ArgMatches) -> Result<SimulationParams, SimulationError> {
    let config = matches.value_of("SIMULATION_CONFIG").map(read_yaml).transpose()?;
    let overwrite = matches.value_of("OVERWRITE_CONFIG_FILE").map(read_yaml).transpose()?;
    merge_params(config, overwrite)
}

fn parse_value<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, SimulationError>
where
    T::Err: std::fmt::Display,
{
    matches
        .value_of(name)
        .map(|s| {
            s.parse::<T>()
                .map_err(|e| SimulationError::Initialization(format!("invalid value {:?} for {}: {}", s, name, e)))
        })
        .transpose()
}

fn print_config(matches: &ArgMatches) -> Result<(), SimulationError> {
    let params = load_params(matches)?;
    let yaml = serde_yaml::to_string(&params).map_err(|e| SimulationError::Initialization(e.to_string()))?;
    print!("{}", yaml);
    Ok(())
}

fn run(matches: &ArgMatches) -> Result<(), SimulationError> {
    let params = load_params(matches)?;
    log::debug!("{:?}", params);

    let statistics_enabled = matches.is_present("STATISTICS_ENABLED");
    let limits = RunLimits {
        max_frames: parse_value(matches, "FRAMES")?,
        max_seconds: parse_value(matches, "MAX_SECONDS")?,
    };

    let mut simulation = Simulation::new(params, statistics_enabled)?;

    if matches.is_present("WINDOW") {
        run_window(&mut simulation, limits)?;
    } else {
        let snapshots = match matches.value_of("SNAPSHOT_DIR") {
            Some(dir) => Some(SnapshotWriter::new(
                PathBuf::from(dir),
                parse_value(matches, "SNAPSHOT_EVERY")?.unwrap_or(100),
                Viewport {
                    bounds_min: params.bounds_min,
                    bounds_max: params.bounds_max,
                    width: 800,
                    height: 800,
                },
            )?),
            None => None,
        };
        let mut host = HeadlessHost::new(limits, snapshots, 100);
        simulation.run(&mut host)?;
    }

    if statistics_enabled {
        let s = simulation.statistics();
        print!("{}", s);
        if let Some(statistics_path) = matches.value_of("STATISTICS_PATH") {
            std::fs::write(statistics_path, s).map_err(|e| {
                SimulationError::Present(format!("failed writing statistics to {}: {}", statistics_path, e))
            })?;
        }
    }

    Ok(())
}

#[cfg(feature = "window")]
fn run_window(simulation: &mut Simulation, limits: RunLimits) -> Result<(), SimulationError> {
    let mut host = super::rendering::WindowHost::new(simulation.params(), limits)?;
    simulation.run(&mut host)
}

#[cfg(not(feature = "window"))]
fn run_window(_simulation: &mut Simulation, _limits: RunLimits) -> Result<(), SimulationError> {
    Err(SimulationError::Initialization(String::from(
        "this binary was built without the `window` feature",
    )))
}

#[test]
fn config_and_overwrite_files_are_merged() {
    let config: serde_yaml::Value = serde_yaml::from_str("particle_count: 1000\nviscosity: 10.0\n").unwrap();
    let overwrite: serde_yaml::Value = serde_yaml::from_str("viscosity: 0.0\ndt: 0.0002\n").unwrap();

    let params = merge_params(Some(config), Some(overwrite)).unwrap();

    assert_eq!(params.particle_count, 1000);
    assert_eq!(params.viscosity, 0.);
    assert_eq!(params.dt, 0.0002);
    assert_eq!(params.gas_stiffness, SimulationParams::default().gas_stiffness);
}

#[test]
fn unknown_parameters_are_rejected() {
    let overwrite: serde_yaml::Value = serde_yaml::from_str("viscositi: 0.0\n").unwrap();
    match merge_params(None, Some(overwrite)) {
        Err(SimulationError::Initialization(msg)) => assert!(msg.contains("viscositi")),
        other => panic!("unexpected result {:?}", other),
    }

    let not_a_mapping: serde_yaml::Value = serde_yaml::from_str("- 1\n- 2\n").unwrap();
    assert!(merge_params(Some(not_a_mapping), None).is_err());
}

#[test]
fn bundled_default_config_matches_defaults() {
    let config: serde_yaml::Value = serde_yaml::from_str(include_str!("../../../configs/default.yaml")).unwrap();
    assert_eq!(merge_params(Some(config), None).unwrap(), SimulationParams::default());
    assert_eq!(merge_params(None, None).unwrap(), SimulationParams::default());
}

#[test]
fn partial_lattice_overwrite_keeps_default_origin() {
    let overwrite: serde_yaml::Value = serde_yaml::from_str("lattice: {columns: 10}\n").unwrap();
    let params = merge_params(None, Some(overwrite)).unwrap();

    assert_eq!(params.lattice.columns, 10);
    assert_eq!(params.lattice.origin, crate::LatticeConfig::default().origin);
}
