use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use vfio_switch::core::config::{Config, CONFIG_PATH};
use vfio_switch::core::pci::SysfsPci;
use vfio_switch::core::service::{
    ensure_root, DesktopNotifier, FuserScan, HolderScan, SystemdDaemon, PERSISTENCE_UNIT,
};
use vfio_switch::core::switch::{RetryBudget, SwitchManager, SwitchOutcome};
use vfio_switch::gpu::sampler::SmiSampler;
use vfio_switch::utils;

#[derive(Parser)]
#[command(name = "vfio-switch", version, about = "Hands a secondary GPU between the host NVIDIA driver and vfio-pci")]
struct Cli {
    /// Seconds to sleep before and after the host switch sequence
    #[arg(long, global = true, default_value_t = 0)]
    sleep: u64,

    /// Enable diagnostic output, including raw sampler readings
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Return the card to the host NVIDIA driver stack and wait for idle
    Nvidia,
    /// Hand the card to vfio-pci for VM passthrough
    Vfio,
    /// Report current driver bindings and device holders
    List,
    /// Write the configuration file and enable the persistence daemon
    Install {
        /// Device node used for permission toggling, e.g. /dev/nvidia0
        #[arg(long)]
        device: PathBuf,
        /// PCI bus prefix shared by all functions, e.g. 0000:01:00
        #[arg(long)]
        bus: String,
        /// Host driver per function index, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        drivers: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::logging::init(cli.debug);

    // Every command pokes at sysfs, systemd or /etc
    ensure_root()?;

    match cli.command {
        Commands::Nvidia => cmd_nvidia(Duration::from_secs(cli.sleep)),
        Commands::Vfio => cmd_vfio(),
        Commands::List => cmd_list(),
        Commands::Install {
            device,
            bus,
            drivers,
        } => cmd_install(device, bus, drivers),
    }
}

fn load_config() -> Result<Config> {
    Config::load(Path::new(CONFIG_PATH))
        .with_context(|| format!("run `vfio-switch install` to create {}", CONFIG_PATH))
}

fn cmd_nvidia(delay: Duration) -> Result<()> {
    let config = load_config()?;
    let pci = SysfsPci::default();
    let daemon = SystemdDaemon::new(PERSISTENCE_UNIT);
    let sampler = SmiSampler::new(&format!("{}.0", config.bus_prefix));
    let notifier = DesktopNotifier;
    let holders = FuserScan;

    let manager = SwitchManager::new(&config, &pci, &daemon, &sampler, &notifier, &holders);
    match manager.switch_to_host(delay, &RetryBudget::default())? {
        SwitchOutcome::Converged(reading) => {
            println!(
                "GPU back on the host driver, idling at {} ({} W)",
                reading.pstate, reading.watts
            );
        }
        SwitchOutcome::Exhausted => {
            // Reported, not fatal: the card is on the host driver but
            // never reached the idle target
            println!("GPU is on the host driver but did not reach the idle state");
        }
    }
    Ok(())
}

fn cmd_vfio() -> Result<()> {
    let config = load_config()?;
    let pci = SysfsPci::default();
    let daemon = SystemdDaemon::new(PERSISTENCE_UNIT);
    let sampler = SmiSampler::new(&format!("{}.0", config.bus_prefix));
    let notifier = DesktopNotifier;
    let holders = FuserScan;

    let manager = SwitchManager::new(&config, &pci, &daemon, &sampler, &notifier, &holders);
    manager.switch_to_passthrough()?;
    println!("GPU handed to vfio-pci");
    Ok(())
}

fn cmd_list() -> Result<()> {
    let config = load_config()?;
    let pci = SysfsPci::default();

    println!("Device node: {}", config.device_path.display());
    println!("Bus prefix:  {}", config.bus_prefix);

    for function in config.functions(&pci)? {
        let driver = pci.current_driver(&function);
        println!(
            "  {} -> {}",
            function,
            driver.as_deref().unwrap_or("(no driver)")
        );
    }

    let holders = FuserScan.holders(&config.device_path)?;
    if holders.is_empty() {
        println!("No process holds {} open", config.device_path.display());
    } else {
        println!("Processes holding {} open:", config.device_path.display());
        for holder in holders {
            println!("  {} (pid {})", holder.name, holder.pid);
        }
    }
    Ok(())
}

fn cmd_install(device: PathBuf, bus: String, drivers: Vec<String>) -> Result<()> {
    let config = Config {
        device_path: device,
        bus_prefix: bus,
        host_drivers: drivers,
    };

    let path = Path::new(CONFIG_PATH);
    if path.exists() {
        let backup = utils::create_timestamped_backup(path)
            .with_context(|| format!("could not back up {}", path.display()))?;
        println!("Existing config backed up to {}", backup.display());
    }
    config.save(path)?;
    println!("Wrote {}", path.display());

    SystemdDaemon::new(PERSISTENCE_UNIT)
        .enable()
        .context("could not enable the persistence daemon unit")?;
    println!("Enabled {}", PERSISTENCE_UNIT);
    Ok(())
}
