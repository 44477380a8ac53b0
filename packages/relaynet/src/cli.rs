//! Command-line arguments for binaries that embed a node type.

use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use relaynet_emulator::{DEFAULT_RELAY_PORT, EmulatorConfig};
use relaynet_manager::{FailureLvl, ManagerConfig};

/// Which scheduler runs the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Simulate,
    Emulate,
}

/// Run a relaynet node algorithm
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["simulate", "emulate"])))]
pub struct Args {
    /// Run every node in this process
    #[arg(short = 's', long)]
    pub simulate: bool,

    /// Run one node in this process, connected through a relay
    #[arg(short = 'e', long)]
    pub emulate: bool,

    /// RNG seed (defaults to $RELAYNET_SEED, then a random seed)
    #[arg(long)]
    pub seed: Option<u64>,

    /// 0 = nothing, 1 = crash, 2 = drop, 3 = delay, 4 = everything under
    /// operator control
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(0..=4))]
    pub failure_lvl: u8,

    /// Read commands from this file instead of the keyboard
    #[arg(long)]
    pub command_file: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1")]
    pub router_host: String,

    #[arg(long, default_value_t = DEFAULT_RELAY_PORT)]
    pub router_port: u16,

    /// Port announced to the relay
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Record every non-deterministic input to this file
    #[arg(long)]
    pub replay_output: Option<PathBuf>,

    /// Replay a recorded run from this file
    #[arg(long)]
    pub replay_input: Option<PathBuf>,

    /// Partially ordered (vector clock) trace output
    #[arg(long)]
    pub synoptic_partial: Option<PathBuf>,

    /// Totally ordered trace output (simulation only)
    #[arg(long)]
    pub synoptic_total: Option<PathBuf>,

    #[arg(long, default_value = "storage")]
    pub storage_root: PathBuf,

    /// Stop after this many rounds
    #[arg(long)]
    pub max_rounds: Option<u64>,
}

impl Args {
    #[must_use]
    pub const fn mode(&self) -> Mode {
        if self.emulate {
            Mode::Emulate
        } else {
            Mode::Simulate
        }
    }

    #[must_use]
    pub fn failure_lvl(&self) -> FailureLvl {
        FailureLvl::from_repr(self.failure_lvl).unwrap_or_default()
    }

    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new();
        config
            .failure_lvl(self.failure_lvl())
            .storage_root(&self.storage_root);

        if let Some(seed) = self.seed {
            config.seed(seed);
        }
        if let Some(max_rounds) = self.max_rounds {
            config.max_rounds(max_rounds);
        }
        if let Some(path) = &self.command_file {
            config.command_file(path);
        }
        if let Some(path) = &self.replay_input {
            config.replay_input(path);
        }
        if let Some(path) = &self.replay_output {
            config.replay_output(path);
        }
        if let Some(path) = &self.synoptic_partial {
            config.partial_trace(path);
        }
        if let Some(path) = &self.synoptic_total {
            config.total_trace(path);
        }

        config
    }

    #[must_use]
    pub fn emulator_config(&self) -> EmulatorConfig {
        let mut config = EmulatorConfig::new();
        config
            .relay_host(self.router_host.clone())
            .relay_port(self.router_port);
        if let Some(port) = self.local_port {
            config.local_port(port);
        }
        config
    }
}
