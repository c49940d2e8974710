//! keybridge CLI
//!
//! Configuration and control tool for the keybridge daemon.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use keybridge_config::Config;
use keybridge_daemon::keys::parse_key;
use keybridge_daemon::{mapper, pidfile, source};
use miette::IntoDiagnostic;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "keybridge")]
#[command(about = "Configuration and control tool for keybridge")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/keybridge/config.kdl")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file and resolve every key name
    Validate {
        /// Print the parsed configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available input devices
    Devices,

    /// Resolve key names to evdev codes
    Keys {
        /// Key names, e.g. `LeftAlt F12 KEY_KPENTER`
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Show whether the daemon is running
    Status,

    /// Stop the running daemon
    Stop,
}

#[derive(Serialize)]
struct ValidationReport<'a> {
    config: &'a Config,
    virtual_keys: Vec<String>,
    source_codes: Vec<String>,
}

fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Expand tilde in config path
    let config_path: PathBuf = shellexpand::tilde(&cli.config).into_owned().into();

    match cli.command {
        Commands::Validate { json } => cmd_validate(&config_path, json),
        Commands::Devices => cmd_devices(),
        Commands::Keys { names } => cmd_keys(&names),
        Commands::Status => cmd_status(&config_path),
        Commands::Stop => cmd_stop(&config_path),
    }
}

fn load_config(config_path: &Path) -> miette::Result<Config> {
    tracing::debug!("Loading configuration from {}", config_path.display());
    Ok(keybridge_config::parse_config(config_path)?)
}

fn cmd_validate(config_path: &Path, json: bool) -> miette::Result<()> {
    let config = load_config(config_path)?;

    let virtual_keys = match &config.keyboard {
        Some(keyboard) => {
            let mapping = mapper::mapping_from_config(keyboard).map_err(|e| miette::miette!("{}", e))?;
            mapper::required_keys(&mapping)
                .iter()
                .map(|k| format!("{:?}", k))
                .collect()
        }
        None => Vec::new(),
    };

    let source_codes = match &config.source {
        Some(source) => source::codes_from_config(source)
            .map_err(|e| miette::miette!("{}", e))?
            .iter()
            .map(|k| format!("{:?}", k))
            .collect(),
        None => Vec::new(),
    };

    if json {
        let report = ValidationReport {
            config: &config,
            virtual_keys,
            source_codes,
        };
        println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
        return Ok(());
    }

    println!("Validating configuration: {}", config_path.display());
    println!("Configuration is valid!");

    if let Some(keyboard) = &config.keyboard {
        println!(
            "  Keyboard '{}': {} button(s), modifier Button{}",
            keyboard.name,
            keyboard.buttons.len(),
            keyboard.modifier
        );
        for (id, button) in &keyboard.buttons {
            let modifier = if button.modifier.is_empty() {
                "-".to_string()
            } else {
                button.modifier.join("+")
            };
            println!("    - Button{}: {} (mod: {})", id, button.normal.join("+"), modifier);
        }
        println!("  Virtual keys: {}", virtual_keys.join(", "));
    }

    if let Some(source) = &config.source {
        println!(
            "  Source: {}{}",
            source.path.display(),
            if source.grab { " (grabbed)" } else { "" }
        );
        println!("    Codes: {}", source_codes.join(", "));
    }

    for watch in &config.watches {
        let events: Vec<&str> = watch.events.iter().map(|e| e.name()).collect();
        println!(
            "  Watch: {} [{}] -> line {} ({})",
            watch.path.display(),
            events.join(", "),
            watch.line,
            watch.label
        );
    }

    if let Some(network) = &config.network {
        println!("  Network: every {}s", network.interval_secs);
        for interface in &network.interfaces {
            println!(
                "    - {} -> line {} ({})",
                interface.name, interface.line, interface.label
            );
        }
    }

    Ok(())
}

fn cmd_devices() -> miette::Result<()> {
    println!("Available input devices:\n");

    for device in source::enumerate_devices().into_diagnostic()? {
        println!("  {}", device.name);
        println!("    Path: {}", device.path.display());
        println!("    ID: {}", device.vendor_product());
        println!();
    }

    Ok(())
}

fn cmd_keys(names: &[String]) -> miette::Result<()> {
    let mut unknown = 0;

    for name in names {
        match parse_key(name) {
            Some(key) => println!("  {:<12} {:?} ({})", name, key, key.code()),
            None => {
                println!("  {:<12} <unknown>", name);
                unknown += 1;
            }
        }
    }

    if unknown > 0 {
        return Err(miette::miette!("{} unknown key name(s)", unknown));
    }
    Ok(())
}

fn pidfile_path(config: &Config) -> miette::Result<&Path> {
    config
        .global
        .pidfile
        .as_deref()
        .ok_or_else(|| miette::miette!("No pidfile configured in the global section"))
}

fn cmd_status(config_path: &Path) -> miette::Result<()> {
    let config = load_config(config_path)?;
    let path = pidfile_path(&config)?;

    match pidfile::running_instance(path).into_diagnostic()? {
        Some(pid) => println!("keybridge is running (pid {})", pid),
        None => println!("keybridge is not running"),
    }
    Ok(())
}

fn cmd_stop(config_path: &Path) -> miette::Result<()> {
    let config = load_config(config_path)?;
    let path = pidfile_path(&config)?;

    let Some(pid) = pidfile::running_instance(path).into_diagnostic()? else {
        println!("keybridge is not running");
        return Ok(());
    };

    pidfile::terminate(pid).into_diagnostic()?;

    if wait_for_exit(pid, STOP_TIMEOUT) {
        println!("Stopped keybridge (pid {})", pid);
        Ok(())
    } else {
        Err(miette::miette!("Process {} is still running after SIGTERM", pid))
    }
}

fn wait_for_exit(pid: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if matches!(kill(pid, None), Err(Errno::ESRCH)) {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}
