use std::fmt;

use crate::{Address, Packet};

/// A timer registered by a node, fired by the scheduler at `fire_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeout<T> {
    id: u64,
    owner: Address,
    fire_time: u64,
    timer: T,
}

impl<T> Timeout<T> {
    pub(crate) const fn new(id: u64, owner: Address, fire_time: u64, timer: T) -> Self {
        Self {
            id,
            owner,
            fire_time,
            timer,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn owner(&self) -> Address {
        self.owner
    }

    #[must_use]
    pub const fn fire_time(&self) -> u64 {
        self.fire_time
    }

    #[must_use]
    pub const fn timer(&self) -> &T {
        &self.timer
    }

    #[must_use]
    pub fn into_timer(self) -> T {
        self.timer
    }
}

impl<T: fmt::Debug> fmt::Display for Timeout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fire-time:{} {:?}", self.fire_time, self.timer)
    }
}

/// One unit of work executed by a scheduler within a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
    Failure(Address),
    Start(Address),
    Exit,
    Command { addr: Address, command: String },
    Echo(String),
    Time,
    Delivery(Packet),
    Timeout(Timeout<T>),
}

impl<T: fmt::Debug> fmt::Display for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failure(addr) => write!(f, "Failure: {addr}"),
            Self::Start(addr) => write!(f, "Start: {addr}"),
            Self::Exit => f.write_str("Exit"),
            Self::Command { addr, command } => write!(f, "Command: {addr} {command}"),
            Self::Echo(text) => write!(f, "Echo: {text}"),
            Self::Time => f.write_str("Time"),
            Self::Delivery(packet) => write!(f, "Delivery: {packet}"),
            Self::Timeout(timeout) => write!(f, "Timeout: {} {timeout}", timeout.owner),
        }
    }
}
