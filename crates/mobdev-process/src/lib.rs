//! Process and network plumbing shared by the device services.
//!
//! - [`TokioCommandRunner`] runs external tools with `tokio::process`
//! - [`is_port_open`] / [`wait_for_port`] probe and poll local TCP ports
//! - [`resolve_executable`] finds tools on `PATH`

mod port;
mod runner;

pub use port::{find_free_port, is_port_open, wait_for_port, PortWait};
pub use runner::{resolve_executable, TokioCommandRunner, TokioProcessHandle};

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
