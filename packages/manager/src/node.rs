//! The contract between user algorithms and the schedulers.

use std::{fmt, path::PathBuf};

use crate::{Address, BROADCAST, FailureRates, NodeCrash, NodeResult, SendError};

/// A distributed-algorithm participant.
///
/// The scheduler owns every node and calls exactly one upcall at a time on
/// it. An upcall that returns `Err(NodeCrash)` (usually by propagating a
/// crash from [`Context::check_write_crash`] with `?`) fails the node once it
/// returns; the scheduler then drops the instance and builds a fresh one if
/// the node is ever restarted.
pub trait Node {
    /// Payload carried by this node's timeouts.
    type Timer: fmt::Debug;

    /// Called once after the node is constructed at its address.
    ///
    /// # Errors
    ///
    /// * If the node crashed during startup
    fn start(&mut self, ctx: &mut dyn Context<Self::Timer>) -> NodeResult;

    /// Called when a packet from `from` is delivered.
    ///
    /// # Errors
    ///
    /// * If the node crashed while handling the packet
    fn on_receive(
        &mut self,
        ctx: &mut dyn Context<Self::Timer>,
        from: Address,
        protocol: u8,
        payload: &[u8],
    ) -> NodeResult;

    /// Called for each operator command addressed to this node.
    ///
    /// # Errors
    ///
    /// * If the node crashed while handling the command
    fn on_command(&mut self, ctx: &mut dyn Context<Self::Timer>, command: &str) -> NodeResult;

    /// Called when one of this node's timeouts fires.
    ///
    /// # Errors
    ///
    /// * If the node crashed while handling the timeout
    fn on_timeout(&mut self, ctx: &mut dyn Context<Self::Timer>, timer: Self::Timer)
    -> NodeResult;

    /// Crash hook, called right before the instance is discarded.
    fn on_fail(&mut self) {}

    /// Failure probabilities used while running this node type.
    #[must_use]
    fn failure_rates() -> FailureRates
    where
        Self: Sized,
    {
        FailureRates::default()
    }
}

/// Scheduler services available to a node during an upcall.
pub trait Context<T> {
    /// Address of the node being called.
    fn addr(&self) -> Address;

    /// Current logical time.
    fn now(&self) -> u64;

    /// Sends `payload` to `to`, which may be [`BROADCAST`].
    ///
    /// # Errors
    ///
    /// * If the source address is invalid
    /// * If the payload does not fit in a packet
    fn send(&mut self, to: Address, protocol: u8, payload: &[u8]) -> Result<(), SendError>;

    /// Sends `payload` to every other node.
    ///
    /// # Errors
    ///
    /// * If the payload does not fit in a packet
    fn broadcast(&mut self, protocol: u8, payload: &[u8]) -> Result<(), SendError> {
        self.send(BROADCAST, protocol, payload)
    }

    /// Schedules `timer` to fire `delay` rounds from now.
    ///
    /// A non-positive delay fires the timer as soon as the current upcall
    /// returns, ahead of every other event.
    fn add_timeout(&mut self, delay: i64, timer: T);

    /// Records a user event in the causal trace.
    fn log_event(&mut self, event: &str);

    /// Gives the scheduler a chance to crash the node before a mutating
    /// storage operation described by `description`.
    ///
    /// # Errors
    ///
    /// * If the scheduler decided to crash the node
    fn check_write_crash(&mut self, description: &str) -> NodeResult;

    /// Audit hook for completed storage writes.
    fn storage_write_event(&mut self, description: &str);

    /// Audit hook for storage reads.
    fn storage_read_event(&mut self, description: &str);

    /// Directory holding this node's persistent files.
    fn storage_dir(&self) -> PathBuf;

    /// A crash signal for this node, for algorithms that decide to fail
    /// themselves.
    fn crash(&self) -> NodeCrash {
        NodeCrash::new(self.addr())
    }
}
