#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Relay binary for emulated relaynet nodes.
//!
//! ```bash
//! RUST_LOG=relaynet_relay=debug relaynet_relay --port 8888
//! ```

use std::net::Ipv4Addr;

use clap::Parser;
use relaynet_relay::{Relay, RelayError};

/// Route packets between relaynet emulators
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8888)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    if std::env::var("RUST_LOG").is_err() {
        pretty_env_logger::formatted_timed_builder()
            .parse_filters("relaynet_relay=info")
            .init();
    } else {
        pretty_env_logger::init_timed();
    }

    let cli = Cli::parse();
    Relay::bind((Ipv4Addr::UNSPECIFIED, cli.port)).await?.run().await
}
