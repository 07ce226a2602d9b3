use std::fmt;
use std::sync::Arc;
use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;
use crate::process::{CommandRunner, ProcessError};

pub const LOCAL_DEVICE_ID: &str = "local";

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device was not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Local,
    Usb,
    Remote,
    Subsystem,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Local => "local",
            DeviceKind::Usb => "usb",
            DeviceKind::Remote => "remote",
            DeviceKind::Subsystem => "subsystem",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOs {
    Ios,
    Android,
    Local,
    Unknown(String),
}

impl fmt::Display for DeviceOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOs::Ios => f.write_str("ios"),
            DeviceOs::Android => f.write_str("android"),
            DeviceOs::Local => f.write_str("local"),
            DeviceOs::Unknown(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub os: DeviceOs,
}

impl Device {
    /// The machine the tool runs on.
    pub fn local() -> Self {
        Self {
            id: LOCAL_DEVICE_ID.to_string(),
            name: "Local System".to_string(),
            kind: DeviceKind::Local,
            os: DeviceOs::Local,
        }
    }

    pub fn is_local(&self) -> bool {
        self.id == LOCAL_DEVICE_ID
    }
}

/// A node of the status tree. Leaves have no children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeItem {
    pub label: String,
    pub description: String,
    pub tooltip: String,
    pub children: Vec<TreeItem>,
}

impl TreeItem {
    pub fn new(label: impl Into<String>, description: impl Into<String>) -> Self {
        let label = label.into();
        let description = description.into();
        let tooltip = format!("{}: {}", label, description);
        Self {
            label,
            description,
            tooltip,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<TreeItem>) -> Self {
        self.children = children;
        self
    }

    /// Renders the item and its descendants, two spaces of indent per level.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&self.label);
        if !self.description.is_empty() {
            out.push_str("  ");
            out.push_str(&self.description);
        }
        out.push('\n');
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }
}

#[async_trait]
pub trait DeviceService: Send + Sync {
    fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self
    where
        Self: Sized;
    async fn list_devices(&self) -> Vec<Device>;
    async fn find(&self, id: &str) -> Result<Device, DeviceError>;
    async fn os(&self, id: &str) -> Result<DeviceOs, DeviceError> {
        Ok(self.find(id).await?.os)
    }
}
