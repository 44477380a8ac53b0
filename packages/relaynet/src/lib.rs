#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! A testbed for distributed algorithms.
//!
//! Implement [`Node`] once, then run it either in the [`Simulator`], where
//! every node shares one process and one logical clock, or in the
//! [`Emulator`], one node per process talking through a relay. Both inject
//! crashes, drops and delays (randomly or under operator control), write
//! vector-clock traces and can record a run for exact replay.
//!
//! ```rust,no_run
//! use clap::Parser as _;
//! # use relaynet::{Address, Context, Node, NodeResult};
//! # struct Echo;
//! # impl Node for Echo {
//! #     type Timer = ();
//! #     fn start(&mut self, _: &mut dyn Context<()>) -> NodeResult { Ok(()) }
//! #     fn on_receive(&mut self, _: &mut dyn Context<()>, _: Address, _: u8, _: &[u8]) -> NodeResult { Ok(()) }
//! #     fn on_command(&mut self, _: &mut dyn Context<()>, _: &str) -> NodeResult { Ok(()) }
//! #     fn on_timeout(&mut self, _: &mut dyn Context<()>, _: ()) -> NodeResult { Ok(()) }
//! # }
//!
//! relaynet::init_logging();
//! let args = relaynet::cli::Args::parse();
//! if let Err(e) = relaynet::run(&args, |_addr| Echo) {
//!     log::error!("{e}");
//!     std::process::exit(1);
//! }
//! ```

use thiserror::Error;

pub mod cli;

pub use relaynet_emulator::{Emulator, EmulatorConfig, EmulatorError};
pub use relaynet_manager::{
    Address, BROADCAST, Context, FailureLvl, FailureRates, MAX_ADDRESS, ManagerConfig, Node,
    NodeCrash, NodeResult, Packet, SendError, Storage, StorageError,
};
pub use relaynet_simulation::{Simulator, SimulatorError};

pub use relaynet_manager as manager;
pub use relaynet_packet as packet;
pub use relaynet_replay as replay;
pub use relaynet_trace as trace;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Simulator(#[from] SimulatorError),
    #[error(transparent)]
    Emulator(#[from] EmulatorError),
}

/// Initializes `pretty_env_logger`, honoring `RUST_LOG` and defaulting to
/// `relaynet=info`.
pub fn init_logging() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.parse_filters("relaynet=info"),
    };
    if let Err(e) = builder.try_init() {
        log::debug!("init_logging: logger already set: {e:?}");
    }
}

/// Runs `factory`'s nodes under the scheduler `args` selects.
///
/// # Errors
///
/// * If the scheduler cannot be set up
/// * If the run fails before it completes
pub fn run<N, F>(args: &cli::Args, factory: F) -> Result<(), RunError>
where
    N: Node,
    F: FnMut(Address) -> N,
{
    let config = args.manager_config();

    match args.mode() {
        cli::Mode::Simulate => Simulator::new(&config, factory)?.run()?,
        cli::Mode::Emulate => {
            Emulator::new(&config, args.emulator_config(), factory)?.run()?;
        }
    }

    Ok(())
}
