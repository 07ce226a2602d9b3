use async_trait::async_trait;
use thiserror::Error;

use crate::devices::DeviceError;
use crate::process::ProcessError;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Failed to generate SSH key pair")]
    KeygenFailed,
    #[error("SSH key pair generation was declined")]
    KeygenDeclined,
    #[error("Failed to create key directory '{0}': {1}")]
    KeyDir(String, std::io::Error),
    #[error("Failed to read SSH public key at '{0}': {1}")]
    PublicKeyRead(String, std::io::Error),
    #[error("This command is only available on a device")]
    LocalDevice,
    #[error("Device type \"{0}\" is not supported")]
    UnsupportedOs(String),
    #[error("Failed to deploy SSH key to {0}: {1}")]
    DeployFailed(String, String),
    #[error("Failed to open SSH tunnel: {0}")]
    Tunnel(ProcessError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Asks the user a yes/no question.
pub trait Prompt: Send + Sync {
    fn confirm(&self, message: &str) -> bool;
}

/// Key management and interactive access to devices over SSH or adb.
#[async_trait]
pub trait SshService {
    /// Ensures a key pair exists. Returns `false` if the user declined to create one.
    async fn keygen(&self) -> Result<bool, SshError>;
    async fn copy_id(&self, device_id: &str) -> Result<(), SshError>;
    async fn shell(&self, device_id: &str) -> Result<(), SshError>;
}
