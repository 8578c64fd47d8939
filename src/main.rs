//! FleetRunner CLI Entry Point
//!
//! Runs one service of a fleet definition and prints its outcome.
//!
//! # Usage
//!
//! ```bash
//! # Run a service against its configured targets
//! fleetrunner fleet.yaml --service show_version
//!
//! # Override targets and pass a payload
//! fleetrunner fleet.yaml --service backup --device r1 --pool core --payload '{"site": "lab"}'
//!
//! # Run as another user with custom settings
//! fleetrunner fleet.yaml --service audit --user operator --settings settings.yaml
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use fleetrunner::connection::{LoopbackDriver, Protocol};
use fleetrunner::execution::{Engine, Submission, SubmitRequest};
use fleetrunner::inventory::{Inventory, MemoryInventory};
use fleetrunner::run::{MemoryRepository, RunRepository, RunStatus};
use fleetrunner::settings::{load_settings, Settings};
use fleetrunner::workflow::load_fleet;
use fleetrunner::{APP_NAME, VERSION};

/// Default fleet file used when none is specified.
const DEFAULT_FLEET: &str = "fleet.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    fleet_path: String,
    service: Option<String>,
    settings_path: Option<String>,
    devices: Vec<String>,
    pools: Vec<String>,
    payload: Option<String>,
    user: String,
    asynchronous: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fleet_path: DEFAULT_FLEET.to_string(),
            service: None,
            settings_path: None,
            devices: Vec::new(),
            pools: Vec::new(),
            payload: None,
            user: "admin".to_string(),
            asynchronous: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Network Automation Job Engine");
    println!();
}

fn print_usage() {
    println!("Usage: fleetrunner [OPTIONS] <FLEET_FILE> --service <NAME>");
    println!();
    println!("Arguments:");
    println!("  <FLEET_FILE>        Path to fleet YAML file (default: {})", DEFAULT_FLEET);
    println!();
    println!("Options:");
    println!("  --service NAME      Service to run");
    println!("  --settings PATH     Engine settings YAML file");
    println!("  --device NAME       Target device (repeatable)");
    println!("  --pool NAME         Target pool (repeatable)");
    println!("  --payload JSON      Initial run payload");
    println!("  --user NAME         User triggering the run (default: admin)");
    println!("  --async             Run on a background thread and wait for it");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

fn option_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires a value", flag))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_seen = false;
    let mut i = 1;

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => config.verbose = true,
            "--async" => config.asynchronous = true,
            "--service" => config.service = Some(option_value(args, &mut i, arg)?),
            "--settings" => config.settings_path = Some(option_value(args, &mut i, arg)?),
            "--device" => config.devices.push(option_value(args, &mut i, arg)?),
            "--pool" => config.pools.push(option_value(args, &mut i, arg)?),
            "--payload" => config.payload = Some(option_value(args, &mut i, arg)?),
            "--user" => config.user = option_value(args, &mut i, arg)?,
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if positional_seen {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.fleet_path = arg.clone();
                positional_seen = true;
            }
        }
        i += 1;
    }

    Ok(config)
}

fn print_summary(results: &Value, status: RunStatus) {
    let success = results.get("success").and_then(Value::as_bool).unwrap_or(false);
    let outcome = if success {
        "SUCCESS".green().bold()
    } else {
        "FAILURE".red().bold()
    };
    println!();
    println!("Status: {} ({})", status, outcome);

    let Some(summary) = results.get("summary").and_then(Value::as_object) else {
        if let Some(result) = results.get("result") {
            println!("Result: {}", result);
        }
        return;
    };
    for (key, devices) in summary {
        let names: Vec<&str> = devices
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .collect();
        if names.is_empty() {
            continue;
        }
        let label = match key.as_str() {
            "success" => key.green(),
            "failure" => key.red(),
            _ => key.yellow(),
        };
        println!("  {:<10} {}", label, names.join(", "));
    }
}

fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let settings = match &config.settings_path {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };

    info!("Loading fleet: {}", config.fleet_path);
    let fleet = load_fleet(&config.fleet_path).map_err(|e| {
        error!("Failed to load fleet: {}", e);
        format!("Could not load fleet from '{}': {}", config.fleet_path, e)
    })?;
    let inventory = MemoryInventory::from_fleet(fleet);

    let service_name = config.service.ok_or("--service is required")?;
    let service = inventory
        .service_by_name(&service_name)
        .ok_or_else(|| format!("Unknown service: {}", service_name))?;

    let mut devices = Vec::new();
    for name in &config.devices {
        let device = inventory
            .find_device("name", name)
            .ok_or_else(|| format!("Unknown device: {}", name))?;
        devices.push(device.id);
    }
    let mut pools = Vec::new();
    for name in &config.pools {
        let pool = inventory
            .pool_by_name(name)
            .ok_or_else(|| format!("Unknown pool: {}", name))?;
        pools.push(pool.id);
    }
    let payload = match &config.payload {
        Some(text) => serde_json::from_str(text)?,
        None => Value::Object(Default::default()),
    };

    let repository = Arc::new(MemoryRepository::new());
    let engine = Engine::new(Arc::new(inventory), repository.clone(), settings);
    for protocol in Protocol::ALL {
        engine.register_driver(Arc::new(LoopbackDriver::new(protocol)));
    }
    let recovered = engine.recover_interrupted()?;
    if recovered > 0 {
        warn!("{} interrupted runs marked as aborted", recovered);
    }

    let mut request = SubmitRequest::new(service.id)
        .with_devices(&devices)
        .with_pools(&pools)
        .with_payload(payload)
        .by(&config.user)
        .with_trigger("CLI");
    if config.asynchronous {
        request = request.asynchronous();
    }

    let (runtime, results) = match engine.submit(request)? {
        Submission::Completed {
            runtime, results, ..
        } => (runtime, results),
        Submission::Started { runtime, handle } => {
            info!("Run {} started in the background", runtime);
            let results = handle.join().map_err(|_| "Run thread panicked")?;
            (runtime, results)
        }
    };

    let record = repository
        .get_run(&runtime)
        .ok_or_else(|| format!("Run {} was not recorded", runtime))?;
    let results = Value::Object(results);
    print_summary(&results, record.status);

    if let Some(timeline) = record.state.as_ref().and_then(|s| s.get("timeline")) {
        if let Some(durations) = timeline.as_object().filter(|d| !d.is_empty()) {
            println!();
            println!("{}", "Durations (ms):".bold());
            for (key, millis) in durations {
                println!("  {:<30} {}", key, millis);
            }
        }
    }
    if let Some(duration) = &record.duration {
        println!();
        println!("Total time: {}", duration);
    }

    Ok(record.success.unwrap_or(false))
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
