//! fronmod entry point — CLI wiring and config-driven daemon construction.

use std::path::Path;
use std::process;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use fronmod::config::AppConfig;
use fronmod::gateway::OhGateway;
use fronmod::processor::MetricProcessor;
use fronmod::reader::TcpRegisterSource;
use fronmod::runner::Runner;

/// Parsed CLI arguments.
struct CliArgs {
    config_path: Option<String>,
    cycles_override: Option<u64>,
}

fn print_help() {
    eprintln!("fronmod — Fronius hybrid-inverter Modbus poller for openHAB");
    eprintln!();
    eprintln!("Usage: fronmod [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <path>   Load configuration from TOML file");
    eprintln!("  --cycles <n>      Stop after n scheduler ticks (default: run forever)");
    eprintln!("  --help            Show this help message");
    eprintln!();
    eprintln!("Without --config, built-in defaults are used (Datamanager on");
    eprintln!("localhost:502, openHAB on http://localhost:8080).");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        cycles_override: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --config requires a path argument");
                    process::exit(1);
                }
                cli.config_path = Some(args[i].clone());
            }
            "--cycles" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --cycles requires a u64 argument");
                    process::exit(1);
                }
                if let Ok(n) = args[i].parse::<u64>() {
                    cli.cycles_override = Some(n);
                } else {
                    eprintln!("error: --cycles value \"{}\" is not a valid u64", args[i]);
                    process::exit(1);
                }
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = parse_args();

    let mut config = if let Some(ref path) = cli.config_path {
        match AppConfig::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        AppConfig::default()
    };

    if let Some(cycles) = cli.cycles_override {
        config.poll.cycles = Some(cycles);
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    let addr = match config.modbus.socket_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("error: cannot resolve modbus endpoint: {e}");
            process::exit(1);
        }
    };

    let source =
        match TcpRegisterSource::connect(addr, Duration::from_secs(config.modbus.timeout_secs)) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("error: {e}");
                process::exit(1);
            }
        };

    let gateway = match OhGateway::new(&config.gateway) {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let processor = MetricProcessor::new(source);
    let mut runner = Runner::new(processor, gateway, config.poll.clone());
    runner.run();
}
