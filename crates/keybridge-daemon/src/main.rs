//! keybridge daemon
//!
//! Maps the buttons of a physical peripheral to a virtual keyboard and keeps
//! a status display up to date from watched files and network interfaces.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use keybridge_config::{Config, LogLevel, WatchConfig};
use keybridge_daemon::button::ButtonId;
use keybridge_daemon::display::{self, Align, LogDisplay, StatusDisplay};
use keybridge_daemon::inotify::{EventMask, FileChangeDecoder, FileEvent};
use keybridge_daemon::mapper::{self, ButtonKeyMapper};
use keybridge_daemon::netmon::NetworkMonitor;
use keybridge_daemon::pidfile::{self, Singleton};
use keybridge_daemon::shutdown::{self, ShutdownHooks};
use keybridge_daemon::source::{self, EvdevButtonSource};
use keybridge_daemon::uinput::DeviceOptions;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

const REPLACE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "keybridged")]
#[command(about = "Button-to-keyboard bridge daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/keybridge/config.kdl")]
    config: String,

    /// Stop an already running instance instead of refusing to start
    #[arg(long)]
    replace: bool,
}

fn init_tracing(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter())),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Expand tilde in config path
    let config_path: PathBuf = shellexpand::tilde(&args.config).into_owned().into();

    let config = match keybridge_config::parse_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LogLevel::default());
            tracing::error!("Failed to load {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    init_tracing(config.global.log_level);
    tracing::info!("Loaded configuration from {}", config_path.display());

    let hooks = Arc::new(ShutdownHooks::new());
    let code = match run(config, args.replace, Arc::clone(&hooks)).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };

    hooks.run();
    tracing::info!("keybridge daemon stopped");
    std::process::exit(code);
}

async fn run(config: Config, replace: bool, hooks: Arc<ShutdownHooks>) -> Result<i32> {
    if let Some(path) = &config.global.pidfile {
        claim_pidfile(path, replace, &hooks).await?;
    }

    let display: Arc<dyn StatusDisplay> = Arc::new(LogDisplay::new());
    if let Some(title) = &config.display.title {
        display.display_line(1, title, Align::Center)?;
    }

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    start_buttons(&config, &display, &hooks, &mut tasks)?;
    start_watches(&config, &display, &hooks, &mut tasks)?;
    start_network(&config, &display, &hooks, &mut tasks)?;

    tracing::info!("keybridge daemon running");

    tokio::select! {
        code = shutdown::wait_for_signal() => Ok(code?),
        Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
            match finished {
                Ok(Ok(())) => bail!("A background task stopped unexpectedly"),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e).context("Background task panicked"),
            }
        }
    }
}

async fn claim_pidfile(path: &Path, replace: bool, hooks: &ShutdownHooks) -> Result<()> {
    let deadline = Instant::now() + REPLACE_TIMEOUT;
    let mut signalled = false;

    loop {
        match pidfile::acquire(path)? {
            Singleton::Acquired(pidfile) => {
                tracing::info!("Using pidfile {}", pidfile.path().display());
                hooks.register("pidfile", move || pidfile.remove());
                return Ok(());
            }
            Singleton::Running(pid) if !replace => {
                bail!("keybridge is already running (pid {})", pid);
            }
            Singleton::Running(pid) => {
                if !signalled {
                    pidfile::terminate(pid)?;
                    signalled = true;
                }
                if Instant::now() >= deadline {
                    bail!("Process {} did not exit after SIGTERM", pid);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn start_buttons(
    config: &Config,
    display: &Arc<dyn StatusDisplay>,
    hooks: &ShutdownHooks,
    tasks: &mut JoinSet<Result<()>>,
) -> Result<()> {
    let Some(keyboard) = &config.keyboard else {
        if config.source.is_some() {
            tracing::warn!("Input source configured without a keyboard section, ignoring it");
        }
        return Ok(());
    };
    let source_config = config
        .source
        .as_ref()
        .context("A keyboard section needs a source device")?;

    let codes = source::codes_from_config(source_config)?;
    let mut source = EvdevButtonSource::open(&source_config.path, &codes, source_config.grab)?;

    let mapping = mapper::mapping_from_config(keyboard)?;
    let options = DeviceOptions {
        name: keyboard.name.clone(),
        ..DeviceOptions::default()
    };

    // Creating the keyboard sleeps through the settle pause
    let mapper = tokio::task::block_in_place(|| {
        ButtonKeyMapper::build(&mut source, ButtonId(keyboard.modifier), mapping, &options)
    })?;
    tracing::info!(
        "Virtual keyboard '{}' ready with {} key(s)",
        keyboard.name,
        mapper.keys().len()
    );
    display::flash_on_press(&mut source, mapper.modifier(), Arc::clone(display))?;

    let mapper = Arc::new(mapper);
    hooks.register("keyboard", move || mapper.close());

    tasks.spawn(async move {
        source.listen().await.context("Button source failed")
    });

    Ok(())
}

fn update_watch(display: &dyn StatusDisplay, watch: &WatchConfig, file: &Path) -> Result<()> {
    match fs::read_to_string(file) {
        Ok(contents) => display.display_line(
            watch.line,
            &format!("{}: {}", watch.label, contents.trim()),
            Align::Left,
        ),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", file.display(), e);
            display.clear_line(watch.line)
        }
    }
}

fn start_watches(
    config: &Config,
    display: &Arc<dyn StatusDisplay>,
    hooks: &ShutdownHooks,
    tasks: &mut JoinSet<Result<()>>,
) -> Result<()> {
    if config.watches.is_empty() {
        return Ok(());
    }

    let mut decoder = FileChangeDecoder::open()?;
    for watch in &config.watches {
        let mask: EventMask = watch.events.iter().copied().collect();
        decoder.add_watch(&watch.path, mask)?;
        update_watch(display.as_ref(), watch, &watch.path)?;
    }

    let decoder = Arc::new(decoder);
    let closer = Arc::clone(&decoder);
    hooks.register("inotify", move || closer.close());

    let watches = config.watches.clone();
    let display = Arc::clone(display);
    tasks.spawn_blocking(move || {
        decoder
            .listen(|event: &FileEvent| {
                match watches.iter().find(|w| event.path.starts_with(&w.path)) {
                    Some(watch) => update_watch(display.as_ref(), watch, &event.path),
                    None => {
                        tracing::debug!("No watch for {}", event.path.display());
                        Ok(())
                    }
                }
            })
            .context("File watch failed")
    });

    Ok(())
}

fn start_network(
    config: &Config,
    display: &Arc<dyn StatusDisplay>,
    hooks: &ShutdownHooks,
    tasks: &mut JoinSet<Result<()>>,
) -> Result<()> {
    let Some(network) = &config.network else {
        return Ok(());
    };

    let monitor = Arc::new(NetworkMonitor::new(
        network.interfaces.iter().map(|i| i.name.clone()),
        Duration::from_secs(network.interval_secs),
    )?);
    let closer = Arc::clone(&monitor);
    hooks.register("network", move || closer.close());

    let interfaces = network.interfaces.clone();
    let display = Arc::clone(display);
    tasks.spawn(async move {
        monitor
            .run(|name: &str, address: Option<Ipv4Addr>| {
                let Some(interface) = interfaces.iter().find(|i| i.name == name) else {
                    return Ok(());
                };
                match address {
                    Some(ip) => display.display_line(
                        interface.line,
                        &format!("{}: {}", interface.label, ip),
                        Align::Left,
                    ),
                    None => display.clear_line(interface.line),
                }
            })
            .await
            .context("Network monitor failed")
    });

    Ok(())
}
