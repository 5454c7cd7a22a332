//! acvm: command-line front end for the VM supervisor.
//!
//! Manages VM records on disk and runs one VM at a time under a
//! [`SupervisorHandle`], with a small line-oriented control prompt.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use acvm::config::{Architecture, ConfigStore, VmConfig};
use acvm::config_watcher::ConfigWatcher;
use acvm::logging;
use acvm::paths::AcvmPaths;
use acvm::settings::Settings;
use acvm::state_machine::lifecycle_sm::VmState;
use acvm::vm::launch::{self, LaunchMode};
use acvm::vm::{StartOutcome, SupervisorEvent, SupervisorHandle};

/// Supervise QEMU virtual machines
#[derive(Parser, Debug)]
#[command(name = "acvm", version, about = "Supervise QEMU virtual machines")]
struct Args {
    /// Keep settings, records and logs under this directory instead of the
    /// platform locations
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Debug logging for acvm and the engine's stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List saved VM records
    List,
    /// Print a record and the engine arguments it would launch with
    Show { name: String },
    /// Write a new VM record
    Create(CreateArgs),
    /// Remove a VM record and its nvram store
    Delete { name: String },
    /// Start a VM and control it until it stops
    Run {
        name: String,
        /// No display; the guest serial console is attached to this terminal
        #[arg(long)]
        headless: bool,
    },
}

#[derive(clap::Args, Debug)]
struct CreateArgs {
    name: String,
    #[arg(long, default_value = "aarch64")]
    arch: String,
    #[arg(long, default_value_t = 4)]
    cores: u32,
    /// Memory in megabytes
    #[arg(long, default_value_t = 4096)]
    ram: u32,
    /// Main disk image
    #[arg(long)]
    image: PathBuf,
    /// Firmware variable store, which must exist before launch
    /// [default: <vms>/<name>.nvram]
    #[arg(long)]
    nvram: Option<PathBuf>,
    /// Installation media, mounted for the next session only
    #[arg(long)]
    cd: Option<PathBuf>,
    /// Attach the boot disk as NVMe instead of virtio
    #[arg(long)]
    nvme: bool,
    #[arg(long)]
    ssh: bool,
    #[arg(long)]
    rdp: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let paths = match &args.root {
        Some(root) => AcvmPaths::under(root),
        None => AcvmPaths::resolve().context("HOME is not set")?,
    };
    paths.ensure().context("creating application directories")?;
    let _log_guard = logging::init(Some(&paths.logs), args.verbose);

    let settings = Settings::load_or_init(&paths.settings_file());
    let store = ConfigStore::new(&paths.vms);

    match args.command {
        Command::List => list(&store),
        Command::Show { name } => show(&store, &settings, &name),
        Command::Create(create_args) => create(&store, &paths, create_args),
        Command::Delete { name } => {
            let config = store.load(&name)?;
            store.delete(&config)?;
            println!("deleted {name}");
            Ok(())
        }
        Command::Run { name, headless } => {
            let config = store.load(&name)?;
            let mode = if headless {
                LaunchMode::Headless
            } else {
                LaunchMode::Normal
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("creating tokio runtime")?;
            runtime.block_on(run(config, settings, store, mode))
        }
    }
}

fn list(store: &ConfigStore) -> Result<()> {
    let configs = store.list()?;
    if configs.is_empty() {
        println!("no VMs in {}", store.dir().display());
        return Ok(());
    }
    for config in configs {
        println!(
            "{:<24} {:<8} {:>3} cores {:>6} MB",
            config.name,
            config.architecture.as_str(),
            config.cores,
            config.ram_megabytes
        );
    }
    Ok(())
}

fn show(store: &ConfigStore, settings: &Settings, name: &str) -> Result<()> {
    let config = store.load(name)?;
    print!("{}", config.to_toml()?);
    match launch::build(
        &config,
        LaunchMode::Normal,
        &settings.firmware_path,
        settings.monitor_ports(),
    ) {
        Ok(spec) => println!("\n# launch arguments\n{}", spec.args.join(" ")),
        Err(e) => println!("\n# cannot launch: {e}"),
    }
    Ok(())
}

fn create(store: &ConfigStore, paths: &AcvmPaths, args: CreateArgs) -> Result<()> {
    if store.path_for(&args.name).exists() {
        bail!("a VM named `{}` already exists", args.name);
    }
    let nvram = args.nvram.unwrap_or_else(|| paths.nvram_for(&args.name));
    let mut config = VmConfig::new(args.name, Architecture::from(args.arch), args.image, nvram);
    config.cores = args.cores;
    config.ram_megabytes = args.ram;
    config.use_virtio = !args.nvme;
    config.ssh_port_forward = args.ssh;
    config.rdp_port_forward = args.rdp;
    if let Some(cd) = args.cd {
        config.cd_image = cd;
        config.mount_cd_image = true;
    }
    store.save(&config)?;
    println!("created {} at {}", config.name, store.path_for(&config.name).display());
    if !config.nvram.is_file() {
        println!("note: {} does not exist yet; create it before running", config.nvram.display());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn run(config: VmConfig, settings: Settings, store: ConfigStore, mode: LaunchMode) -> Result<()> {
    let name = config.name.clone();
    let supervisor = SupervisorHandle::spawn(config, settings, store.clone());
    let mut events = supervisor.subscribe();

    // Forward on-disk edits of this record to the supervisor.
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    let _watcher = match ConfigWatcher::start(store, &name, move |config| {
        let _ = reload_tx.send(config);
    }) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(vm = %name, error = %e, "not watching VM record");
            None
        }
    };
    let reload_handle = supervisor.clone();
    tokio::spawn(async move {
        while let Some(config) = reload_rx.recv().await {
            if let Err(e) = reload_handle.replace_config(config).await {
                warn!(error = %e, "configuration change not applied");
            }
        }
    });

    match supervisor.start(mode).await? {
        StartOutcome::Started { pid, monitor_port } => {
            info!(vm = %name, ?pid, monitor_port, "started");
            println!("{name} started (monitor port {monitor_port})");
        }
        StartOutcome::StoppedExisting => {
            println!("{name} was already running and has been stopped");
            return Ok(());
        }
    }

    match mode {
        // The guest owns stdin; Ctrl-C is the only control.
        LaunchMode::Headless => {
            tokio::select! {
                _ = wait_until_stopped(&mut events) => {}
                _ = tokio::signal::ctrl_c() => {
                    println!("stopping {name}");
                    supervisor.stop().await?;
                    wait_until_stopped(&mut events).await;
                }
            }
        }
        LaunchMode::Normal => control_prompt(&supervisor, &mut events).await?,
    }

    supervisor.shutdown().await?;
    Ok(())
}

/// Read commands from stdin until the VM stops or the user quits.
async fn control_prompt(
    supervisor: &SupervisorHandle,
    events: &mut broadcast::Receiver<SupervisorEvent>,
) -> Result<()> {
    println!("commands: pause | resume | stop | screendump | status | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SupervisorEvent::StateChanged(VmState::Stopped)) => {
                    println!("state: stopped");
                    return Ok(());
                }
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(missed = n, "event stream lagged"),
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // stdin closed: treat as quit.
                    supervisor.terminate().await?;
                    return Ok(());
                };
                let result = match line.trim() {
                    "" => continue,
                    "pause" => supervisor.pause().await.map(|o| println!("{o:?}")),
                    "resume" => supervisor.resume().await.map(|o| println!("{o:?}")),
                    "stop" => supervisor.stop().await.map(|o| println!("{o:?}")),
                    "screendump" => supervisor
                        .screendump()
                        .await
                        .map(|path| println!("screendump requested: {}", path.display())),
                    "status" => supervisor.status().await.map(|s| println!("{s:?}")),
                    "quit" => {
                        supervisor.terminate().await?;
                        return Ok(());
                    }
                    other => {
                        println!("unknown command `{other}`");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    println!("error: {e}");
                }
            }
        }
    }
}

async fn wait_until_stopped(events: &mut broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::StateChanged(VmState::Stopped)) | Err(broadcast::error::RecvError::Closed) => {
                return;
            }
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

fn print_event(event: &SupervisorEvent) {
    match event {
        SupervisorEvent::StateChanged(state) => println!("state: {state}"),
        SupervisorEvent::ConfigurationReplaced(config) => println!("configuration reloaded: {}", config.name),
        SupervisorEvent::ConfigurationDeleted(name) => println!("deleted: {name}"),
        SupervisorEvent::PreviewReady(image) => println!(
            "preview {}x{} at {}",
            image.width,
            image.height,
            image.path.display()
        ),
        SupervisorEvent::Monitor(event) => println!("monitor event: {}", event.name),
    }
}
