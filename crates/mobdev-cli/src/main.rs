use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;
use clap::{Parser, Subcommand};
use merge::Merge;
use tokio::signal;
use tracing::{debug, error, info, warn};

use mobdev_config::ConfigServiceImpl;
use mobdev_devices::{device_tree, DeviceServiceImpl};
use mobdev_logging::LoggingServiceImpl;
use mobdev_process::TokioCommandRunner;
use mobdev_ssh::SshServiceImpl;
use mobdev_traits::config::{Config, ConfigService};
use mobdev_traits::devices::{DeviceService, TreeItem};
use mobdev_traits::logging::LoggingService;
use mobdev_traits::process::CommandRunner;
use mobdev_traits::ssh::{Prompt, SshService};
use mobdev_traits::wsa::WsaService;
use mobdev_wsa::{process_tree, WsaServiceImpl};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true)]
    pub config: Option<String>,
    #[arg(long, global = true, env = "MOBDEV_LOG_LEVEL")]
    pub log_level: Option<String>,
    #[arg(long, global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub non_interactive: bool,
    /// Answer yes to confirmation prompts.
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,
    #[arg(long, global = true)]
    pub dry_run: bool,
    #[arg(long, global = true)]
    pub adb: Option<String>,
    #[arg(long, global = true)]
    pub ssh_key: Option<String>,
    #[arg(long, global = true)]
    pub wsa_host: Option<String>,
    #[arg(long, global = true)]
    pub wsa_port: Option<u16>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Lists the local system, iOS devices and Android devices.
    Devices,
    /// Redraws devices and WSA process info until interrupted.
    Watch,
    /// Generates an SSH key pair if none exists.
    Keygen,
    /// Installs the SSH public key on an iOS device.
    CopyId { device: String },
    /// Opens an interactive shell on a device, or `local`.
    Shell { device: String },
    /// Controls the Windows Subsystem for Android.
    Wsa {
        #[command(subcommand)]
        action: WsaAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum WsaAction {
    Start,
    Stop,
    Reboot,
    Status,
    /// Shows the WSA client process table.
    Ps,
}

struct TerminalPrompt {
    assume_yes: bool,
    interactive: bool,
}

impl Prompt for TerminalPrompt {
    fn confirm(&self, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        if !self.interactive {
            warn!("{} (declined: non-interactive)", message);
            return false;
        }

        tokio::task::block_in_place(|| {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{} [y/N] ", message);
            let _ = stderr.flush();

            let mut answer = String::new();
            match std::io::stdin().lock().read_line(&mut answer) {
                Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes" | "Yes"),
                Err(e) => {
                    error!("Failed to read answer: {}", e);
                    false
                }
            }
        })
    }
}

fn indented(item: &TreeItem) -> String {
    item.render()
        .lines()
        .map(|line| format!("  {}\n", line))
        .collect()
}

fn print_tree(title: &str, items: &[TreeItem]) {
    println!("{}", title);
    for item in items {
        print!("{}", indented(item));
    }
}

fn dry_run(command: &Commands, config: &Config) {
    info!("[dry-run] Would execute the following steps:");
    match command {
        Commands::Devices | Commands::Watch => {
            info!("[dry-run] 1. Run '{} -l' and '{} devices -l'", config.idevice_id(), config.adb());
            info!("[dry-run] 2. Print the device tree");
        }
        Commands::Keygen => {
            info!("[dry-run] 1. Run '{} -f {}' if the key does not exist", config.ssh_keygen(), mobdev_ssh::key_path(config).display());
        }
        Commands::CopyId { device } => {
            info!("[dry-run] 1. Ensure an SSH key pair exists");
            info!("[dry-run] 2. Forward a local port to port {} of '{}' with {}", config.device_ssh_port(), device, config.iproxy());
            info!("[dry-run] 3. Append {} to authorized_keys over SSH", mobdev_ssh::public_key_path(config).display());
            info!("[dry-run] 4. Close the forward");
        }
        Commands::Shell { device } => {
            info!("[dry-run] 1. Open an interactive shell on '{}' (ssh via {} for iOS, adb for Android)", device, config.iproxy());
        }
        Commands::Wsa { action } => match action {
            WsaAction::Start => {
                info!("[dry-run] 1. Launch {}", config.wsa_launch_uri());
                info!("[dry-run] 2. Wait up to {:?} for {} to accept connections", config.port_wait_timeout(), config.wsa_address());
                info!("[dry-run] 3. Run '{} connect {}' and check it is listed", config.adb(), config.wsa_address());
            }
            WsaAction::Stop => {
                info!("[dry-run] 1. Kill {}.exe and check it is gone", config.wsa_process_name());
            }
            WsaAction::Reboot => {
                info!("[dry-run] 1. Stop WSA");
                info!("[dry-run] 2. Wait {:?}", config.reboot_delay());
                info!("[dry-run] 3. Start WSA");
            }
            WsaAction::Status | WsaAction::Ps => {
                info!("[dry-run] 1. Query the {} process and {}", config.wsa_process_name(), config.wsa_address());
            }
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- Configuration Setup ---
    let file_config = ConfigServiceImpl::load_from_paths(cli.config.as_deref().map(Path::new))?;
    let cli_config = Config {
        adb_path: cli.adb.clone(),
        ssh_key_path: cli.ssh_key.clone(),
        wsa_host: cli.wsa_host.clone(),
        wsa_port: cli.wsa_port,
        log_level: cli.log_level.clone(),
        ..Config::empty()
    };
    let mut config = Config::default();
    config.merge(file_config);
    config.merge(cli_config);

    // --- Logging ---
    let use_color = !cli.no_color && std::io::stderr().is_terminal();
    LoggingServiceImpl::init_logging(config.log_level.as_deref().unwrap_or("info"), use_color)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    debug!("Final configuration: {:#?}", config);

    if cli.dry_run {
        dry_run(&cli.command, &config);
        return Ok(());
    }

    if let Err(e) = run(&cli, &config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
    let devices = Arc::new(DeviceServiceImpl::new(config, runner.clone()));
    let prompt = Arc::new(TerminalPrompt {
        assume_yes: cli.yes,
        interactive: !cli.non_interactive && std::io::stdin().is_terminal(),
    });

    match &cli.command {
        Commands::Devices => {
            let listed = devices.list_devices().await;
            print_tree("Devices", &device_tree(&listed));
        }
        Commands::Watch => {
            let wsa = WsaServiceImpl::new(config, runner.clone());
            watch(devices.as_ref(), &wsa, config).await;
        }
        Commands::Keygen => {
            let ssh = SshServiceImpl::new(config, runner.clone(), devices, prompt);
            if !ssh.keygen().await? {
                info!("SSH key pair was not generated");
            }
        }
        Commands::CopyId { device } => {
            let ssh = SshServiceImpl::new(config, runner.clone(), devices, prompt);
            ssh.copy_id(device).await?;
        }
        Commands::Shell { device } => {
            let ssh = SshServiceImpl::new(config, runner.clone(), devices, prompt);
            ssh.shell(device).await?;
        }
        Commands::Wsa { action } => {
            let wsa = WsaServiceImpl::new(config, runner.clone());
            wsa_action(&wsa, *action).await?;
        }
    }
    Ok(())
}

async fn wsa_action(wsa: &WsaServiceImpl, action: WsaAction) -> anyhow::Result<()> {
    match action {
        WsaAction::Start => wsa.start().await?,
        WsaAction::Stop => wsa.stop().await?,
        WsaAction::Reboot => wsa.reboot().await?,
        WsaAction::Status => {
            let status = wsa.status().await;
            let yes_no = |b: bool| if b { "yes" } else { "no" };
            println!("running:   {}", yes_no(status.running));
            println!("adb port:  {}", yes_no(status.port_open));
            println!("connected: {}", yes_no(status.connected));
        }
        WsaAction::Ps => {
            print_tree("WSA", &process_tree(&wsa.process_table().await));
        }
    }
    Ok(())
}

async fn watch(devices: &DeviceServiceImpl, wsa: &WsaServiceImpl, config: &Config) {
    let mut ticker = tokio::time::interval(config.refresh_interval());
    let clear = std::io::stdout().is_terminal();
    info!("Refreshing every {:?}. Press Ctrl+C to exit.", config.refresh_interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let listed = devices.list_devices().await;
                let processes = wsa.process_table().await;
                if clear {
                    print!("\x1B[2J\x1B[H");
                }
                print_tree("Devices", &device_tree(&listed));
                print_tree("WSA", &process_tree(&processes));
            }
            _ = signal::ctrl_c() => {
                info!("Stopped watching.");
                break;
            }
        }
    }
}
