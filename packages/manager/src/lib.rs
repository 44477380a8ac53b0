#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Scheduler services shared by the relaynet simulator and emulator.
//!
//! A user algorithm implements [`Node`] and talks to its scheduler through a
//! [`Context`]. Both schedulers are built on [`ManagerCore`], which owns the
//! logical clock, the failure configuration, the pending timeouts, the
//! vector clocks and every non-deterministic decision (RNG rolls and
//! operator prompts), so a run can be replayed exactly from its seed and
//! recorded input.

use relaynet_packet::PacketError;
use strum_macros::{AsRefStr, EnumString, FromRepr};
use thiserror::Error;

pub mod commands;
pub mod config;
pub mod event;
pub mod manager;
pub mod node;
pub mod storage;

pub use config::ManagerConfig;
pub use event::{Event, Timeout};
pub use manager::{CrashPlan, ManagerCore, TransitPlan};
pub use node::{Context, Node};
pub use relaynet_packet::{Address, BROADCAST, MAX_ADDRESS, Packet};
pub use relaynet_replay::{Replay, ReplayError};
pub use storage::{Storage, StorageError};

/// How much of the drop, delay, crash, recovery and ordering decisions are
/// handed to the operator instead of the RNG.
///
/// Each level includes the control of every level below it.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRefStr,
    EnumString,
    FromRepr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[repr(u8)]
pub enum FailureLvl {
    /// Everything is decided by the RNG.
    Nothing = 0,
    /// The operator decides crashes and recoveries.
    Crash = 1,
    /// The operator also decides which packets are dropped.
    Drop = 2,
    /// The operator also decides which packets are delayed.
    Delay = 3,
    /// The operator also orders every round's events.
    #[default]
    Everything = 4,
}

/// Per-round probabilities used when the RNG makes a decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureRates {
    /// Chance that a live node crashes in a round (or before a write).
    pub failure: f64,
    /// Chance that a crashed node restarts in a round.
    pub recovery: f64,
    /// Chance that an in-transit packet is dropped.
    pub drop: f64,
    /// Chance that an in-transit packet is held for another round.
    pub delay: f64,
}

impl Default for FailureRates {
    fn default() -> Self {
        Self {
            failure: 0.05,
            recovery: 0.10,
            drop: 0.10,
            delay: 0.25,
        }
    }
}

impl FailureRates {
    /// Rates that never fail, drop or delay anything.
    #[must_use]
    pub const fn reliable() -> Self {
        Self {
            failure: 0.0,
            recovery: 0.0,
            drop: 0.0,
            delay: 0.0,
        }
    }

    #[must_use]
    pub const fn failure(mut self, failure: f64) -> Self {
        self.failure = failure;
        self
    }

    #[must_use]
    pub const fn recovery(mut self, recovery: f64) -> Self {
        self.recovery = recovery;
        self
    }

    #[must_use]
    pub const fn drop(mut self, drop: f64) -> Self {
        self.drop = drop;
        self
    }

    #[must_use]
    pub const fn delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    /// Clamps every rate into `[0, 1]`.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            failure: self.failure.clamp(0.0, 1.0),
            recovery: self.recovery.clamp(0.0, 1.0),
            drop: self.drop.clamp(0.0, 1.0),
            delay: self.delay.clamp(0.0, 1.0),
        }
    }
}

/// The signal a node upcall returns when the node has crashed.
///
/// Only ever used to unwind the current upcall. The scheduler that receives
/// it fails the node once the upcall has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Node {addr} crashed")]
pub struct NodeCrash {
    addr: Address,
}

impl NodeCrash {
    #[must_use]
    pub const fn new(addr: Address) -> Self {
        Self { addr }
    }

    #[must_use]
    pub const fn addr(&self) -> Address {
        self.addr
    }
}

/// Result of every [`Node`] upcall.
pub type NodeResult = Result<(), NodeCrash>;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Node address {0} is invalid")]
    InvalidAddress(Address),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn failure_levels_are_ordered_by_operator_control() {
        assert!(FailureLvl::Nothing < FailureLvl::Crash);
        assert!(FailureLvl::Crash < FailureLvl::Drop);
        assert!(FailureLvl::Drop < FailureLvl::Delay);
        assert!(FailureLvl::Delay < FailureLvl::Everything);
        assert_eq!(FailureLvl::default(), FailureLvl::Everything);
    }

    #[test_log::test]
    fn failure_level_parses_from_name_or_number() {
        assert_eq!(FailureLvl::from_str("crash").unwrap(), FailureLvl::Crash);
        assert_eq!(FailureLvl::from_repr(3), Some(FailureLvl::Delay));
        assert_eq!(FailureLvl::from_repr(5), None);
        assert_eq!(FailureLvl::Drop.as_ref(), "DROP");
    }

    #[test_log::test]
    fn rates_are_clamped_into_unit_interval() {
        let rates = FailureRates::reliable()
            .failure(-0.5)
            .recovery(2.0)
            .drop(0.3)
            .delay(f64::INFINITY)
            .clamped();

        assert_eq!(
            rates,
            FailureRates {
                failure: 0.0,
                recovery: 1.0,
                drop: 0.3,
                delay: 1.0,
            }
        );
    }
}
