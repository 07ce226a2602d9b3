pub mod config;
pub mod devices;
pub mod logging;
pub mod process;
pub mod ssh;
pub mod wsa;
