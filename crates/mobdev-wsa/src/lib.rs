use std::sync::Arc;
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use mobdev_devices::parse_adb_devices;
use mobdev_process::{is_port_open, wait_for_port, PortWait};
use mobdev_traits::config::Config;
use mobdev_traits::devices::{DeviceKind, TreeItem};
use mobdev_traits::process::{CommandRunner, CommandSpec, ProcessError};
use mobdev_traits::wsa::{ProcessTable, WsaError, WsaService, WsaStatus};

mod table;

pub use table::parse_process_table;

const PROCESS_COLUMNS: &str = "Handles, NPM, PM, WS, CPU, Id, SI, ProcessName";
const STOP_VERIFY_ATTEMPTS: usize = 5;

pub const PROCESS_ERROR_LABEL: &str = "Error fetching process data, wsa may have been stopped.";

/// `cmd /C start "" wsa://` hands the URI to the shell, which launches the subsystem.
fn launch_command(config: &Config) -> CommandSpec {
    CommandSpec::new("cmd").args(["/C", "start", "", config.wsa_launch_uri()])
}

fn kill_command(config: &Config) -> CommandSpec {
    let image = format!("{}.exe", config.wsa_process_name());
    CommandSpec::new("taskkill").args(["/F", "/IM", image.as_str()])
}

fn process_query(config: &Config) -> CommandSpec {
    let script = format!(
        "Get-Process -Name {} | Format-Table {} -AutoSize",
        config.wsa_process_name(),
        PROCESS_COLUMNS
    );
    CommandSpec::new("powershell.exe").args(["-NoProfile", "-Command", script.as_str()])
}

/// Flattens the process listing into one leaf per cell, labelled by column.
pub fn process_tree(result: &Result<ProcessTable, WsaError>) -> Vec<TreeItem> {
    match result {
        Ok(table) if !table.is_empty() => table
            .rows
            .iter()
            .flat_map(|row| {
                table.headers.iter().enumerate().map(move |(col, header)| {
                    TreeItem::new(header, row.get(col).cloned().unwrap_or_default())
                })
            })
            .collect(),
        _ => vec![TreeItem::new(PROCESS_ERROR_LABEL, "")],
    }
}

pub struct WsaServiceImpl {
    config: Config,
    runner: Arc<dyn CommandRunner>,
}

impl WsaServiceImpl {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config: config.clone(),
            runner,
        }
    }

    async fn is_connected(&self) -> Result<bool, WsaError> {
        let spec = CommandSpec::new(self.config.adb()).arg("devices");
        let output = self.runner.checked_output(&spec).await?;
        Ok(parse_adb_devices(&output.stdout, &self.config)
            .iter()
            .any(|d| d.kind == DeviceKind::Subsystem))
    }

    async fn launch_and_connect(&self) -> Result<(), WsaError> {
        let address = self.config.wsa_address();

        self.runner.checked_output(&launch_command(&self.config)).await?;
        info!("WSA started, waiting for ADB debug port...");

        wait_for_port(self.config.wsa_host(), self.config.wsa_port(), PortWait::from_config(&self.config)).await?;
        info!("ADB debug port is open. Connecting using ADB...");

        let connect = CommandSpec::new(self.config.adb()).args(["connect", address.as_str()]);
        let output = self.runner.checked_output(&connect).await?;
        debug!("adb connect: {}", output.stdout.trim());

        // adb exits 0 even when it prints "failed to connect".
        if !self.is_connected().await? {
            return Err(WsaError::NotConnected(address));
        }
        info!("Connected to WSA using ADB.");
        Ok(())
    }

    async fn kill_and_verify(&self) -> Result<(), WsaError> {
        self.runner.checked_output(&kill_command(&self.config)).await?;

        for attempt in 1..=STOP_VERIFY_ATTEMPTS {
            match self.process_table().await {
                Ok(table) if !table.is_empty() => {
                    debug!("WSA still listed after stop (attempt {})", attempt);
                    sleep(self.config.port_wait_interval()).await;
                }
                Ok(_) => return Ok(()),
                // Get-Process exits non-zero when no process has the name.
                Err(WsaError::Process(ProcessError::Failed { .. })) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Err(WsaError::StillRunning)
    }
}

#[async_trait]
impl WsaService for WsaServiceImpl {
    async fn start(&self) -> Result<(), WsaError> {
        info!("Wsa starting...");
        self.launch_and_connect()
            .await
            .map_err(|e| WsaError::Start(e.to_string()))?;
        info!("WSA started successfully.");
        Ok(())
    }

    async fn stop(&self) -> Result<(), WsaError> {
        info!("Wsa stopping...");
        self.kill_and_verify()
            .await
            .map_err(|e| WsaError::Stop(e.to_string()))?;
        info!("WSA stopped successfully.");
        Ok(())
    }

    async fn reboot(&self) -> Result<(), WsaError> {
        let result = async {
            self.stop().await?;
            let delay = self.config.reboot_delay();
            info!("Waiting {:?} before restarting WSA", delay);
            sleep(delay).await;
            self.start().await
        }
        .await;
        result.map_err(|e| WsaError::Reboot(e.to_string()))
    }

    async fn status(&self) -> WsaStatus {
        let running = matches!(self.process_table().await, Ok(table) if !table.is_empty());
        let port_open = is_port_open(
            self.config.wsa_host(),
            self.config.wsa_port(),
            self.config.port_probe_timeout(),
        )
        .await;
        let connected = match self.is_connected().await {
            Ok(connected) => connected,
            Err(e) => {
                warn!("Could not query adb: {}", e);
                false
            }
        };
        WsaStatus {
            running,
            port_open,
            connected,
        }
    }

    async fn process_table(&self) -> Result<ProcessTable, WsaError> {
        let output = self.runner.checked_output(&process_query(&self.config)).await?;
        Ok(parse_process_table(&output.stdout))
    }
}
