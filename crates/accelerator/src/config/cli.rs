use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::DaemonArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the accelerator agent: discover devices and collect measurements
    Daemon(Box<DaemonArgs>),
    /// Print the discovered devices and slot capacity as JSON
    Devices(Box<DaemonArgs>),
    /// Probe the runtime-integration helper and print its protocol version
    #[command(name = "runtime-version")]
    RuntimeVersion(Box<DaemonArgs>),
}
