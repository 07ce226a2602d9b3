use async_trait::async_trait;
use thiserror::Error;

use crate::process::ProcessError;

#[derive(Error, Debug)]
pub enum WsaError {
    #[error("Failed to start WSA or connect using ADB: {0}")]
    Start(String),
    #[error("Failed to stop WSA: {0}")]
    Stop(String),
    #[error("Failed to reboot WSA: {0}")]
    Reboot(String),
    #[error("WSA process is still running")]
    StillRunning,
    #[error("adb does not list {0} as a connected device")]
    NotConnected(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Output of the platform process listing, split into cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ProcessTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Looks up a cell by header name.
    pub fn cell(&self, row: usize, header: &str) -> Option<&str> {
        let col = self.headers.iter().position(|h| h.eq_ignore_ascii_case(header))?;
        self.rows.get(row)?.get(col).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WsaStatus {
    pub running: bool,
    pub port_open: bool,
    pub connected: bool,
}

/// Lifecycle control of the Windows Subsystem for Android.
#[async_trait]
pub trait WsaService {
    async fn start(&self) -> Result<(), WsaError>;
    async fn stop(&self) -> Result<(), WsaError>;
    async fn reboot(&self) -> Result<(), WsaError>;
    async fn status(&self) -> WsaStatus;
    async fn process_table(&self) -> Result<ProcessTable, WsaError>;
}
